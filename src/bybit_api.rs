use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::BYBIT_LIVE_REST_URL;
use crate::exchange::{classify_error, with_retry, Exchange, ExchangeError, MarketData};
use crate::types::{
    clean_float, Candle, ClosedPnl, ExchangePosition, Execution, InstrumentInfo, LongShortRatio,
    OrderBook, Side, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";

// Read-only calls are retried. Order creates (entries and reduce-only closes)
// are not: a timed-out create may still have filled on the venue.
const READ_RETRIES: u32 = 3;
const ORDER_RETRIES: u32 = 0;

// ── Client ────────────────────────────────────────────────────────────────────

/// Bybit v5 REST client (linear USDT perpetuals).
#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    market_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    pub fn new(base_url: &str, api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ExchangeError::Permanent(format!("HTTP client build failed: {}", e)))?;

        Ok(BybitClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            // Public market data always comes from mainnet.
            market_url: BYBIT_LIVE_REST_URL.to_string(),
            api_key,
            api_secret,
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Permanent(format!("HMAC init failed: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_headers(&self, payload_tail: &str) -> Result<reqwest::header::HeaderMap, ExchangeError> {
        let ts = Self::timestamp_ms().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, payload_tail);
        let signature = self.sign(&payload)?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in [
            ("X-BAPI-API-KEY", self.api_key.as_str()),
            ("X-BAPI-TIMESTAMP", ts.as_str()),
            ("X-BAPI-SIGN", signature.as_str()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW),
            ("Content-Type", "application/json"),
        ] {
            let value = value
                .parse()
                .map_err(|_| ExchangeError::Permanent(format!("invalid header value for {}", name)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Reads the envelope and returns `result` when retCode == 0.
    async fn unwrap_envelope(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let http_status = resp.status().as_u16();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("Parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json["result"].clone())
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let headers = self.signed_headers(query)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::unwrap_envelope(resp).await
    }

    async fn signed_post(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let body = body.to_string();
        let headers = self.signed_headers(&body)?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::unwrap_envelope(resp).await
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.market_url, path, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("HTTP error: {}", e)))?;
        Self::unwrap_envelope(resp).await
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn wallet_equity_raw(&self) -> Result<f64, ExchangeError> {
        let result = self.signed_get("/v5/account/wallet-balance", "accountType=UNIFIED").await?;
        result["list"]
            .as_array()
            .and_then(|l| l.first())
            .map(|acct| num(&acct["totalEquity"]))
            .ok_or_else(|| ExchangeError::Transient("wallet-balance: empty list".into()))
    }

    async fn positions_raw(&self, query: &str) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let result = self.signed_get("/v5/position/list", query).await?;
        let list = match result["list"].as_array() {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        Ok(list.iter().filter_map(parse_position).collect())
    }

    async fn ticker_raw(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.public_get("/v5/market/tickers", &query).await?;
        let t = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Permanent(format!("tickers: unknown symbol {}", symbol)))?;
        Ok(Ticker {
            last_price:    num(&t["lastPrice"]),
            price_24h_pct: num(&t["price24hPcnt"]) * 100.0,
            high_24h:      num(&t["highPrice24h"]),
            low_24h:       num(&t["lowPrice24h"]),
            volume_24h:    num(&t["volume24h"]),
            turnover_24h:  num(&t["turnover24h"]),
            open_interest: num(&t["openInterest"]),
            funding_rate:  num(&t["fundingRate"]),
        })
    }

    async fn instrument_info_raw(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self.public_get("/v5/market/instruments-info", &query).await?;
        let item = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Permanent(format!("instruments-info: no {}", symbol)))?;
        let info = InstrumentInfo {
            symbol: symbol.to_string(),
            qty_step: num(&item["lotSizeFilter"]["qtyStep"]),
            min_order_qty: num(&item["lotSizeFilter"]["minOrderQty"]),
        };
        if !info.is_valid() {
            return Err(ExchangeError::Permanent(format!("instruments-info: bad lot filter for {}", symbol)));
        }
        Ok(info)
    }

    async fn create_order_raw(&self, body: Value) -> Result<String, ExchangeError> {
        let result = self.signed_post("/v5/order/create", body).await?;
        Ok(result["orderId"].as_str().unwrap_or("unknown").to_string())
    }

    async fn set_stop_loss_raw(&self, symbol: &str, stop_loss: f64) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      symbol,
            "stopLoss":    format_price(stop_loss),
            "slTriggerBy": "LastPrice",
            "tpslMode":    "Full",
            "positionIdx": 0
        });
        self.signed_post("/v5/position/trading-stop", body).await?;
        Ok(())
    }

    async fn executions_raw(&self, symbol: &str, limit: u32) -> Result<Vec<Execution>, ExchangeError> {
        let query = format!("category=linear&symbol={}&limit={}", symbol, limit);
        let result = self.signed_get("/v5/execution/list", &query).await?;
        let list = result["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .map(|e| Execution {
                exec_time_ms:    num(&e["execTime"]) as i64,
                closed_size:     num(&e["closedSize"]),
                order_type:      e["orderType"].as_str().unwrap_or("").to_string(),
                stop_order_type: e["stopOrderType"].as_str().unwrap_or("").to_string(),
            })
            .collect())
    }

    async fn closed_pnl_raw(&self, symbol: &str, limit: u32) -> Result<Vec<ClosedPnl>, ExchangeError> {
        let query = format!("category=linear&symbol={}&limit={}", symbol, limit);
        let result = self.signed_get("/v5/position/closed-pnl", &query).await?;
        let list = result["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .map(|r| ClosedPnl {
                created_time_ms: num(&r["createdTime"]) as i64,
                closed_pnl:      num(&r["closedPnl"]),
            })
            .collect())
    }

    async fn klines_raw(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!("category=linear&symbol={}&interval={}&limit={}", symbol, interval, limit);
        let result = self.public_get("/v5/market/kline", &query).await?;
        let list = result["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("missing result.list".into()))?;
        Ok(parse_klines(list))
    }

    async fn orderbook_raw(&self, symbol: &str, depth: u32) -> Result<OrderBook, ExchangeError> {
        let query = format!("category=linear&symbol={}&limit={}", symbol, depth);
        let result = self.public_get("/v5/market/orderbook", &query).await?;
        Ok(OrderBook { bids: parse_levels(&result["b"]), asks: parse_levels(&result["a"]) })
    }

    async fn funding_history_raw(&self, symbol: &str, limit: u32) -> Result<Vec<f64>, ExchangeError> {
        let query = format!("category=linear&symbol={}&limit={}", symbol, limit);
        let result = self.public_get("/v5/market/funding/history", &query).await?;
        let list = result["list"].as_array().cloned().unwrap_or_default();
        Ok(list.iter().map(|r| num(&r["fundingRate"])).collect())
    }

    async fn long_short_raw(&self, symbol: &str, limit: u32) -> Result<Vec<LongShortRatio>, ExchangeError> {
        let query = format!("category=linear&symbol={}&period=1h&limit={}", symbol, limit);
        let result = self.public_get("/v5/market/account-ratio", &query).await?;
        let list = result["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .map(|r| LongShortRatio { buy_ratio: num(&r["buyRatio"]), sell_ratio: num(&r["sellRatio"]) })
            .collect())
    }
}

// ── Trait implementations with retry ──────────────────────────────────────────

#[async_trait]
impl Exchange for BybitClient {
    async fn wallet_equity(&self) -> Result<f64, ExchangeError> {
        with_retry(|| self.wallet_equity_raw(), READ_RETRIES).await
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let t = with_retry(|| self.ticker_raw(symbol), READ_RETRIES).await?;
        if t.last_price > 0.0 {
            Ok(t.last_price)
        } else {
            Err(ExchangeError::Transient(format!("{}: no last price", symbol)))
        }
    }

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        with_retry(|| self.positions_raw("category=linear&settleCoin=USDT&limit=200"), READ_RETRIES).await
    }

    async fn position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        let query = format!("category=linear&symbol={}", symbol);
        let list = with_retry(|| self.positions_raw(&query), READ_RETRIES).await?;
        Ok(list.into_iter().find(|p| p.symbol == symbol))
    }

    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        with_retry(|| self.instrument_info_raw(symbol), READ_RETRIES).await
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<String, ExchangeError> {
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      symbol,
            "side":        side.as_order_side(),
            "orderType":   "Market",
            "qty":         format_qty(qty),
            "stopLoss":    format_price(stop_loss),
            "takeProfit":  format_price(take_profit),
            "slTriggerBy": "LastPrice",
            "tpTriggerBy": "LastPrice",
            "tpslMode":    "Full",
            "timeInForce": "GTC"
        });
        let order_id = with_retry(|| self.create_order_raw(body.clone()), ORDER_RETRIES).await?;
        log::info!("Order placed: {} {} {} qty={}", side, symbol, order_id, format_qty(qty));
        Ok(order_id)
    }

    async fn set_stop_loss(&self, symbol: &str, stop_loss: f64) -> Result<(), ExchangeError> {
        with_retry(|| self.set_stop_loss_raw(symbol, stop_loss), READ_RETRIES).await
    }

    async fn close_position(&self, symbol: &str, side: Side, qty: f64) -> Result<String, ExchangeError> {
        let close_side = side.closing_order_side();
        let body = serde_json::json!({
            "category":    "linear",
            "symbol":      symbol,
            "side":        close_side,
            "orderType":   "Market",
            "qty":         format_qty(qty),
            "reduceOnly":  true,
            "timeInForce": "GTC"
        });
        let order_id = with_retry(|| self.create_order_raw(body.clone()), ORDER_RETRIES).await?;
        log::info!("Reduce-only close: {} {} qty={} orderId={}", symbol, close_side, format_qty(qty), order_id);
        Ok(order_id)
    }

    async fn recent_executions(&self, symbol: &str, limit: u32) -> Result<Vec<Execution>, ExchangeError> {
        with_retry(|| self.executions_raw(symbol, limit), READ_RETRIES).await
    }

    async fn closed_pnl(&self, symbol: &str, limit: u32) -> Result<Vec<ClosedPnl>, ExchangeError> {
        with_retry(|| self.closed_pnl_raw(symbol, limit), READ_RETRIES).await
    }
}

#[async_trait]
impl MarketData for BybitClient {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        with_retry(|| self.klines_raw(symbol, interval, limit), READ_RETRIES).await
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        with_retry(|| self.ticker_raw(symbol), READ_RETRIES).await
    }

    async fn orderbook(&self, symbol: &str, depth: u32) -> Result<OrderBook, ExchangeError> {
        with_retry(|| self.orderbook_raw(symbol, depth), READ_RETRIES).await
    }

    async fn funding_history(&self, symbol: &str, limit: u32) -> Result<Vec<f64>, ExchangeError> {
        with_retry(|| self.funding_history_raw(symbol, limit), READ_RETRIES).await
    }

    async fn long_short_ratio(&self, symbol: &str, limit: u32) -> Result<Vec<LongShortRatio>, ExchangeError> {
        with_retry(|| self.long_short_raw(symbol, limit), READ_RETRIES).await
    }
}

// ── Parsing helpers ───────────────────────────────────────────────────────────

/// Bybit sends numbers as strings; accept either, default 0.
fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_position(entry: &Value) -> Option<ExchangePosition> {
    let size = num(&entry["size"]);
    if size <= 0.0 {
        return None;
    }
    Some(ExchangePosition {
        symbol:       entry["symbol"].as_str()?.to_string(),
        side:         Side::from_order_side(entry["side"].as_str().unwrap_or(""))?,
        size,
        avg_price:    num(&entry["avgPrice"]),
        stop_loss:    num(&entry["stopLoss"]),
        take_profit:  num(&entry["takeProfit"]),
        leverage:     num(&entry["leverage"]),
        created_time: entry["createdTime"].as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|ms| ms / 1000)
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
    })
}

fn parse_klines(list: &[Value]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = list
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            if arr.len() < 6 {
                return None;
            }
            Some(Candle {
                timestamp: arr[0].as_str()?.parse().ok()?,
                open:      arr[1].as_str()?.parse().ok()?,
                high:      arr[2].as_str()?.parse().ok()?,
                low:       arr[3].as_str()?.parse().ok()?,
                close:     arr[4].as_str()?.parse().ok()?,
                volume:    arr[5].as_str()?.parse().ok()?,
            })
        })
        .collect();
    candles.reverse(); // Bybit returns newest-first; reverse to oldest-first
    candles
}

fn parse_levels(v: &Value) -> Vec<(f64, f64)> {
    v.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|r| {
                    let pair = r.as_array()?;
                    Some((num(pair.first()?), num(pair.get(1)?)))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn format_qty(qty: f64) -> String {
    format!("{}", clean_float(qty))
}

fn format_price(price: f64) -> String {
    format!("{}", (price * 1e4).round() / 1e4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positions_with_zero_size_are_skipped() {
        let open = json!({"symbol":"SOLUSDT","side":"Sell","size":"12.5","avgPrice":"171.2",
                          "stopLoss":"174","takeProfit":"","leverage":"10","createdTime":"1700000000000"});
        let flat = json!({"symbol":"BTCUSDT","side":"","size":"0","avgPrice":"0"});
        let p = parse_position(&open).unwrap();
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.size, 12.5);
        assert_eq!(p.take_profit, 0.0);
        assert_eq!(p.created_time, 1_700_000_000);
        assert!((p.margin() - 12.5 * 171.2 / 10.0).abs() < 1e-9);
        assert!(parse_position(&flat).is_none());
    }

    #[test]
    fn klines_are_reversed_to_oldest_first() {
        let rows = vec![
            json!(["2000", "2", "3", "1", "2.5", "10", "25"]),
            json!(["1000", "1", "2", "0.5", "1.5", "8", "12"]),
        ];
        let c = parse_klines(&rows);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].timestamp, 1000);
        assert_eq!(c[1].close, 2.5);
    }

    #[test]
    fn order_fields_are_formatted_compactly() {
        assert_eq!(format_qty(25.000000000000004), "25");
        assert_eq!(format_qty(0.1), "0.1");
        assert_eq!(format_price(168.123456), "168.1235");
        assert_eq!(parse_levels(&json!([["100.5", "3"], ["100.4", "1.5"]])), vec![(100.5, 3.0), (100.4, 1.5)]);
    }
}
