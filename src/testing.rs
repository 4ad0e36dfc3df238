use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::exchange::{Exchange, ExchangeError, MarketData};
use crate::telegram::Notifier;
use crate::types::{
    Candle, ClosedPnl, ExchangePosition, Execution, InstrumentInfo, LongShortRatio, OrderBook,
    Side, Ticker,
};

#[derive(Debug, Clone, PartialEq)]
pub enum OrderCall {
    Entry { symbol: String, side: Side, qty: f64, stop_loss: f64, take_profit: f64 },
    Close { symbol: String, side: Side, qty: f64 },
    StopLoss { symbol: String, stop_loss: f64 },
}

pub struct MockState {
    pub equity: f64,
    pub prices: HashMap<String, f64>,
    pub positions: Vec<ExchangePosition>,
    pub instrument: InstrumentInfo,
    pub executions: Vec<Execution>,
    pub closed_pnl: Vec<ClosedPnl>,
    pub calls: Vec<OrderCall>,
    pub klines: HashMap<String, Vec<Candle>>,

    pub fail_equity: bool,
    pub fail_positions: bool,
    pub fail_entry: bool,
    pub fail_close: bool,
    /// The close is applied on the venue but the call still errors.
    pub close_times_out: bool,
    pub fail_closed_pnl: bool,
    /// Whether a filled entry shows its stop-loss on the position.
    pub attach_stop_loss: bool,
}

pub struct MockExchange {
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(symbol: &str, price: f64) -> Self {
        let mut prices = HashMap::new();
        prices.insert(symbol.to_string(), price);
        MockExchange {
            state: Mutex::new(MockState {
                equity: 10_000.0,
                prices,
                positions: Vec::new(),
                instrument: InstrumentInfo { symbol: symbol.to_string(), qty_step: 0.1, min_order_qty: 0.1 },
                executions: Vec::new(),
                closed_pnl: Vec::new(),
                calls: Vec::new(),
                klines: HashMap::new(),
                fail_equity: false,
                fail_positions: false,
                fail_entry: false,
                fail_close: false,
                close_times_out: false,
                fail_closed_pnl: false,
                attach_stop_loss: true,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.with(|s| {
            s.prices.insert(symbol.to_string(), price);
        });
    }

    pub fn add_position(&self, symbol: &str, side: Side, size: f64, avg_price: f64) {
        self.with(|s| {
            s.positions.push(ExchangePosition {
                symbol: symbol.to_string(),
                side,
                size,
                avg_price,
                stop_loss: 0.0,
                take_profit: 0.0,
                leverage: 10.0,
                created_time: 1_700_000_000,
            })
        });
    }

    pub fn calls(&self) -> Vec<OrderCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn closes(&self) -> Vec<(Side, f64)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OrderCall::Close { side, qty, .. } => Some((side, qty)),
                _ => None,
            })
            .collect()
    }

    pub fn stop_updates(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OrderCall::StopLoss { stop_loss, .. } => Some(stop_loss),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn wallet_equity(&self) -> Result<f64, ExchangeError> {
        self.with(|s| {
            if s.fail_equity {
                Err(ExchangeError::Transient("equity down".into()))
            } else {
                Ok(s.equity)
            }
        })
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.with(|s| {
            s.prices
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::Transient(format!("no price for {}", symbol)))
        })
    }

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        self.with(|s| {
            if s.fail_positions {
                Err(ExchangeError::Transient("positions down".into()))
            } else {
                Ok(s.positions.clone())
            }
        })
    }

    async fn position(&self, symbol: &str) -> Result<Option<ExchangePosition>, ExchangeError> {
        self.with(|s| {
            if s.fail_positions {
                Err(ExchangeError::Transient("positions down".into()))
            } else {
                Ok(s.positions.iter().find(|p| p.symbol == symbol).cloned())
            }
        })
    }

    async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        self.with(|s| Ok(s.instrument.clone()))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<String, ExchangeError> {
        self.with(|s| {
            s.calls.push(OrderCall::Entry {
                symbol: symbol.to_string(),
                side,
                qty,
                stop_loss,
                take_profit,
            });
            if s.fail_entry {
                return Err(ExchangeError::Permanent("insufficient balance".into()));
            }
            let price = s.prices.get(symbol).copied().unwrap_or(0.0);
            s.positions.push(ExchangePosition {
                symbol: symbol.to_string(),
                side,
                size: qty,
                avg_price: price,
                stop_loss: if s.attach_stop_loss { stop_loss } else { 0.0 },
                take_profit,
                leverage: 10.0,
                created_time: 1_700_000_000,
            });
            Ok(format!("order-{}", s.calls.len()))
        })
    }

    async fn set_stop_loss(&self, symbol: &str, stop_loss: f64) -> Result<(), ExchangeError> {
        self.with(|s| {
            s.calls.push(OrderCall::StopLoss { symbol: symbol.to_string(), stop_loss });
            if let Some(p) = s.positions.iter_mut().find(|p| p.symbol == symbol) {
                p.stop_loss = stop_loss;
            }
            Ok(())
        })
    }

    async fn close_position(&self, symbol: &str, side: Side, qty: f64) -> Result<String, ExchangeError> {
        self.with(|s| {
            s.calls.push(OrderCall::Close { symbol: symbol.to_string(), side, qty });
            if s.fail_close {
                return Err(ExchangeError::Transient("close rejected".into()));
            }
            if let Some(p) = s.positions.iter_mut().find(|p| p.symbol == symbol) {
                p.size = crate::types::clean_float((p.size - qty).max(0.0));
            }
            s.positions.retain(|p| p.size > 0.0);
            if s.close_times_out {
                return Err(ExchangeError::Transient("request timed out".into()));
            }
            Ok(format!("close-{}", s.calls.len()))
        })
    }

    async fn recent_executions(&self, _symbol: &str, _limit: u32) -> Result<Vec<Execution>, ExchangeError> {
        self.with(|s| Ok(s.executions.clone()))
    }

    async fn closed_pnl(&self, _symbol: &str, _limit: u32) -> Result<Vec<ClosedPnl>, ExchangeError> {
        self.with(|s| {
            if s.fail_closed_pnl {
                Err(ExchangeError::Transient("closed-pnl down".into()))
            } else {
                Ok(s.closed_pnl.clone())
            }
        })
    }
}

#[async_trait]
impl MarketData for MockExchange {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let key = format!("{}:{}", symbol, interval);
        self.with(|s| {
            s.klines
                .get(&key)
                .map(|c| c.iter().rev().take(limit).rev().cloned().collect())
                .ok_or_else(|| ExchangeError::Transient(format!("no klines for {}", key)))
        })
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let price = self.last_price(symbol).await?;
        Ok(Ticker {
            last_price: price,
            high_24h: price * 1.02,
            low_24h: price * 0.98,
            ..Ticker::default()
        })
    }

    async fn orderbook(&self, _symbol: &str, _depth: u32) -> Result<OrderBook, ExchangeError> {
        Err(ExchangeError::Transient("orderbook down".into()))
    }

    async fn funding_history(&self, _symbol: &str, _limit: u32) -> Result<Vec<f64>, ExchangeError> {
        Ok(vec![0.0001, 0.00008, 0.00005])
    }

    async fn long_short_ratio(&self, _symbol: &str, _limit: u32) -> Result<Vec<LongShortRatio>, ExchangeError> {
        Ok(Vec::new())
    }
}

/// Collects every message instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn any_contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}
