use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{
    Candle, ClosedPnl, ExchangePosition, Execution, InstrumentInfo, LongShortRatio, OrderBook,
    Side, Ticker,
};

// ── Error types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Network, timeout, HTTP 5xx, server overload (retCode=10016).
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: {0}")]
    Permanent(String),
}

/// Classify a Bybit retCode + HTTP status into an ExchangeError.
pub fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> ExchangeError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => ExchangeError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => ExchangeError::Transient(msg.to_string()),
        _ => ExchangeError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Generic retry wrapper with exponential backoff. Permanent errors return at once.
pub async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(ExchangeError::RateLimit { retry_after }) => {
                if retries >= max_retries {
                    return Err(ExchangeError::RateLimit { retry_after });
                }
                log::warn!("Rate limited — sleeping {}s (attempt {}/{})", retry_after, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(ExchangeError::Transient(msg)) => {
                if retries >= max_retries {
                    return Err(ExchangeError::Transient(msg));
                }
                log::warn!("Transient error: {} — retry in {}s ({}/{})", msg, delay, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
                retries += 1;
            }
            Err(e @ ExchangeError::Permanent(_)) => return Err(e),
        }
    }
}

/// Account equity, or the configured account size when the venue cannot be
/// reached. The fallback shows no drawdown, so it is logged.
pub async fn equity_or_account_size(exchange: &dyn Exchange) -> f64 {
    match exchange.wallet_equity().await {
        Ok(equity) if equity > 0.0 => equity,
        Ok(equity) => {
            log::warn!("Wallet equity reported as {}, using account size", equity);
            crate::config::ACCOUNT_SIZE
        }
        Err(e) => {
            log::warn!("Wallet equity unavailable ({}), using account size", e);
            crate::config::ACCOUNT_SIZE
        }
    }
}

/// Reduce-only close that is sent once. When the call errors (a timeout can
/// land after the fill) the position is re-read: if it already shrank to
/// `size_before - qty` or below, the close counts as done.
pub async fn close_once_confirmed(
    exchange: &dyn Exchange,
    symbol: &str,
    side: Side,
    qty: f64,
    size_before: f64,
) -> Result<String, ExchangeError> {
    let err = match exchange.close_position(symbol, side, qty).await {
        Ok(order_id) => return Ok(order_id),
        Err(e) => e,
    };
    let expected_left = (size_before - qty).max(0.0);
    match exchange.position(symbol).await {
        Ok(live) => {
            let left = live.map(|p| p.size).unwrap_or(0.0);
            if left <= expected_left + 1e-9 {
                log::warn!(
                    "[{}] Close reported '{}' but exchange size is {} (expected <= {}), treating as filled",
                    symbol, err, left, expected_left
                );
                Ok("unacknowledged".to_string())
            } else {
                Err(err)
            }
        }
        Err(e) => {
            log::error!("[{}] Could not re-read position after failed close: {}", symbol, e);
            Err(err)
        }
    }
}

// ── Collaborator interfaces ───────────────────────────────────────────────────

/// Account and order operations the core needs from a futures venue.
/// Every position query is exchange truth; local state only caches it.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Total account equity.
    async fn wallet_equity(&self) -> Result<f64, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// All open positions (size > 0) across the account.
    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Open position for one symbol, `None` when flat.
    async fn position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError>;

    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError>;

    /// Market entry with exchange-native SL / TP attached. Returns the order id.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<String, ExchangeError>;

    /// Moves the position's stop-loss.
    async fn set_stop_loss(&self, symbol: &str, stop_loss: f64) -> Result<(), ExchangeError>;

    /// Reduce-only market close of `qty` on a position opened in `side`.
    async fn close_position(&self, symbol: &str, side: Side, qty: f64) -> Result<String, ExchangeError>;

    /// Recent executions, newest first.
    async fn recent_executions(&self, symbol: &str, limit: u32) -> Result<Vec<Execution>, ExchangeError>;

    /// Recent realized-PnL records, newest first.
    async fn closed_pnl(&self, symbol: &str, limit: u32) -> Result<Vec<ClosedPnl>, ExchangeError>;
}

/// Public market data used to build the analysis snapshot.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Candles oldest-first.
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError>;
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    async fn orderbook(&self, symbol: &str, depth: u32) -> Result<OrderBook, ExchangeError>;
    /// Funding rates newest-first.
    async fn funding_history(&self, symbol: &str, limit: u32) -> Result<Vec<f64>, ExchangeError>;
    /// Account long/short ratios newest-first.
    async fn long_short_ratio(&self, symbol: &str, limit: u32) -> Result<Vec<LongShortRatio>, ExchangeError>;
}
