use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::exchange::MarketData;
use crate::indicators::{self, IndicatorSummary, PivotPoints, TpLevels, MIN_CANDLES};
use crate::types::{Candle, LongShortRatio, OrderBook, Ticker};

const FEAR_GREED_URL: &str = "https://api.alternative.me/fng/?limit=1";
const KLINE_LIMIT: usize = 200;
const ORDERBOOK_DEPTH: u32 = 50;
const FUNDING_HISTORY_LIMIT: u32 = 5;
const LONG_SHORT_LIMIT: u32 = 5;

/// (label, Bybit interval)
pub const TIMEFRAMES: [(&str, &str); 4] = [("15m", "15"), ("1h", "60"), ("4h", "240"), ("daily", "D")];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Availability<T> {
    Available(T),
    Unavailable,
}

impl<T> Availability<T> {
    pub fn as_option(&self) -> Option<&T> {
        match self {
            Availability::Available(t) => Some(t),
            Availability::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }
}

impl<T> From<Option<T>> for Availability<T> {
    fn from(o: Option<T>) -> Self {
        match o {
            Some(t) => Availability::Available(t),
            None => Availability::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookPressure {
    pub bid_ask_imbalance: f64,
    pub near_pressure: f64,
    pub spread: f64,
    pub top_bid: f64,
    pub top_ask: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingHistory {
    pub rates: Vec<f64>,
    pub average: f64,
    pub trend: &'static str,
    pub direction: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongShortSummary {
    pub buy_ratio: f64,
    pub sell_ratio: f64,
    pub buy_ratio_trend: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BtcContext {
    pub price: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub position_in_range_pct: f64,
    pub bias: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FearGreed {
    pub value: u32,
    pub classification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub indicators: BTreeMap<String, Availability<IndicatorSummary>>,
    pub pivot_points: Availability<PivotPoints>,
    pub tp_levels: Availability<TpLevels>,
    pub orderbook: Availability<OrderBookPressure>,
    pub funding_rate: Availability<f64>,
    pub funding_history: Availability<FundingHistory>,
    pub ticker: Availability<Ticker>,
    pub long_short_ratio: Availability<LongShortSummary>,
    pub btc_context: Availability<BtcContext>,
    pub fear_greed: Availability<FearGreed>,
}

impl MarketSnapshot {
    /// 4H ATR, or 0.0 when that frame is unavailable.
    pub fn atr_4h(&self) -> f64 {
        self.indicators
            .get("4h")
            .and_then(|a| a.as_option())
            .and_then(|s| s.atr)
            .unwrap_or(0.0)
    }

    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            log::error!("Snapshot serialization failed: {}", e);
            format!("{{\"symbol\": \"{}\"}}", self.symbol)
        })
    }
}

pub struct DataCollector {
    market: Arc<dyn MarketData>,
    http: reqwest::Client,
    fear_greed_url: String,
}

impl DataCollector {
    pub fn new(market: Arc<dyn MarketData>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        DataCollector { market, http, fear_greed_url: FEAR_GREED_URL.to_string() }
    }

    #[cfg(test)]
    pub fn with_fear_greed_url(mut self, url: &str) -> Self {
        self.fear_greed_url = url.to_string();
        self
    }

    pub async fn collect(&self, symbol: &str) -> MarketSnapshot {
        log::info!("Collecting data for {}...", symbol);

        let mut frames: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for (label, interval) in TIMEFRAMES {
            match self.market.klines(symbol, interval, KLINE_LIMIT).await {
                Ok(c) => {
                    frames.insert(label.to_string(), c);
                }
                Err(e) => log::error!("Error fetching klines {} {}: {}", symbol, interval, e),
            }
        }

        let indicators: BTreeMap<String, Availability<IndicatorSummary>> = TIMEFRAMES
            .iter()
            .map(|(label, _)| {
                let summary = frames.get(*label).and_then(|c| indicators::summarize(c));
                (label.to_string(), summary.into())
            })
            .collect();

        let pivots = frames.get("daily").and_then(|d| indicators::pivot_points(d));
        let tp_levels = frames.get("4h").and_then(|c| {
            if c.len() < MIN_CANDLES {
                return None;
            }
            let closes: Vec<f64> = c.iter().map(|x| x.close).collect();
            let bb = indicators::bollinger(&closes, 20, 2.0);
            let atr = indicators::atr(c, 14);
            indicators::tp_levels(c, pivots.as_ref(), bb.as_ref(), indicators::vwap(c), atr)
        });

        let ticker = self.market.ticker(symbol).await.map_err(|e| {
            log::error!("Ticker error {}: {}", symbol, e);
        });
        let funding_rate = ticker.as_ref().ok().map(|t| t.funding_rate);

        let orderbook = match self.market.orderbook(symbol, ORDERBOOK_DEPTH).await {
            Ok(ob) => orderbook_pressure(&ob),
            Err(e) => {
                log::error!("Orderbook error {}: {}", symbol, e);
                None
            }
        };
        let funding_history = match self.market.funding_history(symbol, FUNDING_HISTORY_LIMIT).await {
            Ok(rates) => funding_summary(&rates),
            Err(e) => {
                log::error!("Funding history error {}: {}", symbol, e);
                None
            }
        };
        let long_short = match self.market.long_short_ratio(symbol, LONG_SHORT_LIMIT).await {
            Ok(r) => long_short_summary(&r),
            Err(e) => {
                log::error!("Long/short ratio error {}: {}", symbol, e);
                None
            }
        };
        let btc = match self.market.ticker("BTCUSDT").await {
            Ok(t) => btc_context(&t),
            Err(e) => {
                log::error!("BTC context error: {}", e);
                None
            }
        };
        let fear_greed = self.fear_greed().await;

        let snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            indicators,
            pivot_points: pivots.into(),
            tp_levels: tp_levels.into(),
            orderbook: orderbook.into(),
            funding_rate: funding_rate.into(),
            funding_history: funding_history.into(),
            ticker: ticker.ok().into(),
            long_short_ratio: long_short.into(),
            btc_context: btc.into(),
            fear_greed: fear_greed.into(),
        };

        log::info!(
            "Data collected: {}/{} timeframes, L/S={}, BTC={}",
            snapshot.indicators.values().filter(|a| a.is_available()).count(),
            TIMEFRAMES.len(),
            snapshot.long_short_ratio.as_option().map(|l| format!("{:.3}", l.buy_ratio)).unwrap_or_else(|| "N/A".into()),
            snapshot.btc_context.as_option().map(|b| b.bias).unwrap_or("N/A"),
        );
        snapshot
    }

    async fn fear_greed(&self) -> Option<FearGreed> {
        let resp = match self.http.get(&self.fear_greed_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::warn!("Fear & Greed status: {}", r.status());
                return None;
            }
            Err(e) => {
                log::error!("Fear & Greed error: {}", e);
                return None;
            }
        };
        match resp.json::<Value>().await {
            Ok(json) => parse_fear_greed(&json),
            Err(e) => {
                log::error!("Fear & Greed parse error: {}", e);
                None
            }
        }
    }
}

// ── Pure section builders ─────────────────────────────────────────────────────

pub fn orderbook_pressure(ob: &OrderBook) -> Option<OrderBookPressure> {
    let (top_bid, top_ask) = (ob.bids.first()?.0, ob.asks.first()?.0);
    let total_bid: f64 = ob.bids.iter().map(|(_, q)| q).sum();
    let total_ask: f64 = ob.asks.iter().map(|(_, q)| q).sum();
    let near_bid: f64 = ob.bids.iter().take(5).map(|(_, q)| q).sum();
    let near_ask: f64 = ob.asks.iter().take(5).map(|(_, q)| q).sum();
    Some(OrderBookPressure {
        bid_ask_imbalance: round3(if total_ask > 0.0 { total_bid / total_ask } else { 1.0 }),
        near_pressure: round3(if near_ask > 0.0 { near_bid / near_ask } else { 1.0 }),
        spread: ((top_ask - top_bid) * 1e6).round() / 1e6,
        top_bid,
        top_ask,
    })
}

/// `rates` newest-first.
pub fn funding_summary(rates: &[f64]) -> Option<FundingHistory> {
    if rates.is_empty() {
        return None;
    }
    let average = rates.iter().sum::<f64>() / rates.len() as f64;
    let direction = if rates.len() >= 3 {
        let (newest, oldest) = (rates[0], rates[rates.len() - 1]);
        if newest > oldest * 1.5 {
            "rising"
        } else if newest < oldest * 0.5 {
            "falling"
        } else {
            "stable"
        }
    } else {
        "stable"
    };
    Some(FundingHistory {
        rates: rates.iter().map(|r| round7(*r)).collect(),
        average: round7(average),
        trend: if average > 0.0 { "positive" } else { "negative" },
        direction,
    })
}

/// `ratios` newest-first.
pub fn long_short_summary(ratios: &[LongShortRatio]) -> Option<LongShortSummary> {
    let latest = ratios.first()?;
    let buy_ratio_trend = (ratios.len() >= 3).then(|| {
        let oldest = &ratios[ratios.len() - 1];
        if latest.buy_ratio > oldest.buy_ratio { "rising" } else { "falling" }
    });
    Some(LongShortSummary { buy_ratio: latest.buy_ratio, sell_ratio: latest.sell_ratio, buy_ratio_trend })
}

pub fn btc_context(t: &Ticker) -> Option<BtcContext> {
    if t.last_price <= 0.0 {
        return None;
    }
    let range = t.high_24h - t.low_24h;
    let position = if range > 0.0 { (t.last_price - t.low_24h) / range * 100.0 } else { 50.0 };
    let change = t.price_24h_pct;
    Some(BtcContext {
        price: t.last_price,
        change_24h_pct: indicators::round2(change),
        high_24h: t.high_24h,
        low_24h: t.low_24h,
        position_in_range_pct: (position * 10.0).round() / 10.0,
        bias: if change > 0.5 {
            "bullish"
        } else if change < -0.5 {
            "bearish"
        } else {
            "neutral"
        },
    })
}

pub fn parse_fear_greed(json: &Value) -> Option<FearGreed> {
    let data = json["data"].as_array()?.first()?;
    let value = match &data["value"] {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => n.as_u64()? as u32,
        _ => return None,
    };
    Some(FearGreed {
        value,
        classification: data["value_classification"].as_str().unwrap_or("Unknown").to_string(),
    })
}

fn round3(v: f64) -> f64 {
    (v * 1e3).round() / 1e3
}

fn round7(v: f64) -> f64 {
    (v * 1e7).round() / 1e7
}
