use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Trade direction. Serialized with Bybit's order-side names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "Buy", alias = "Long")]
    Long,
    #[serde(rename = "Sell", alias = "Short")]
    Short,
}

impl Side {
    /// Order side used to open a position in this direction.
    pub fn as_order_side(self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
        }
    }

    /// Order side of a reduce-only close.
    pub fn closing_order_side(self) -> &'static str {
        self.opposite().as_order_side()
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn from_order_side(s: &str) -> Option<Side> {
        match s {
            "Buy" => Some(Side::Long),
            "Sell" => Some(Side::Short),
            _ => None,
        }
    }

    /// +1 for long, −1 for short: PnL = (exit − entry) × qty × sign.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_order_side())
    }
}

/// A fully-populated trade proposal. Only ever built after the decision
/// provider's payload passed parsing and the action whitelist.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: Side,
    pub confidence: u8,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    /// 0.0 when the provider gave no second target.
    pub take_profit_2: f64,
    /// 0.0 when not supplied; the risk engine derives it from prices.
    pub risk_reward_ratio: f64,
    pub reasoning: String,
    /// 4H ATR at decision time, used for trailing after TP1.
    pub atr: f64,
}

impl TradeSignal {
    pub fn risk_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn reward_distance(&self) -> f64 {
        (self.take_profit_1 - self.entry_price).abs()
    }

    /// Supplied R:R, or reward/risk computed from prices when missing.
    pub fn effective_rr(&self) -> f64 {
        if self.risk_reward_ratio > 0.0 {
            return self.risk_reward_ratio;
        }
        let risk = self.risk_distance();
        if self.entry_price > 0.0 && self.stop_loss > 0.0 && self.take_profit_1 > 0.0 && risk > 0.0 {
            ((self.reward_distance() / risk) * 100.0).round() / 100.0
        } else {
            0.0
        }
    }
}

/// Output of the decision provider.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Hold { confidence: u8, reasoning: String },
    Trade(TradeSignal),
}

/// How a position ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitType {
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "MAX_HOLD")]
    MaxHold,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ExitType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitType::StopLoss => "SL",
            ExitType::TakeProfit => "TP",
            ExitType::Manual => "MANUAL",
            ExitType::MaxHold => "MAX_HOLD",
            ExitType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_side() -> Side {
    Side::Long
}

fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// An open position owned by `TradingState`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub order_id: String,
    pub symbol: String,
    #[serde(default = "default_side")]
    pub side: Side,
    pub qty: f64,
    pub original_qty: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub confidence: u8,
    pub risk_reward_ratio: f64,
    pub reasoning: String,
    #[serde(rename = "timestamp", default = "now_utc")]
    pub entry_timestamp: DateTime<Utc>,
    pub atr: f64,
    pub partial_filled: bool,
    pub breakeven_activated: bool,
    pub trailing_activated: bool,
    /// Estimated PnL booked by the TP1 partial close.
    #[serde(default)]
    pub partial_pnl: f64,
}

impl Default for Position {
    fn default() -> Self {
        Position {
            order_id: String::new(),
            symbol: String::new(),
            side: Side::Long,
            qty: 0.0,
            original_qty: 0.0,
            entry_price: 0.0,
            stop_loss: 0.0,
            take_profit_1: 0.0,
            take_profit_2: 0.0,
            confidence: 0,
            risk_reward_ratio: 0.0,
            reasoning: String::new(),
            entry_timestamp: Utc::now(),
            atr: 0.0,
            partial_filled: false,
            breakeven_activated: false,
            trailing_activated: false,
            partial_pnl: 0.0,
        }
    }
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.qty * self.side.sign()
    }

    pub fn hours_open(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_timestamp).num_seconds() as f64 / 3600.0
    }
}

/// One closed trade, kept in the bounded history ring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub pnl: f64,
    pub exit_type: ExitType,
    pub daily_pnl: f64,
    pub total_pnl: f64,
}

// ─── Exchange DTOs ────────────────────────────────────────────────────────────

/// A live position as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol:       String,
    pub side:         Side,
    pub size:         f64,
    pub avg_price:    f64,
    pub stop_loss:    f64,
    pub take_profit:  f64,
    pub leverage:     f64,
    pub created_time: i64, // Unix seconds
}

impl ExchangePosition {
    /// Margin consumed by this position (notional / leverage).
    pub fn margin(&self) -> f64 {
        if self.size > 0.0 && self.leverage > 0.0 {
            self.size * self.avg_price / self.leverage
        } else {
            0.0
        }
    }
}

/// Lot-size filter of a linear instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub qty_step: f64,
    pub min_order_qty: f64,
}

impl InstrumentInfo {
    pub fn is_valid(&self) -> bool {
        self.qty_step > 0.0 && self.min_order_qty >= 0.0
    }

    /// Round to the nearest lot step and floor at the minimum order quantity.
    pub fn round_qty(&self, qty: f64) -> f64 {
        let stepped = (qty / self.qty_step).round() * self.qty_step;
        clean_float(stepped.max(self.min_order_qty))
    }
}

/// Strip accumulated binary noise (e.g. 24.999999999999996 → 25).
pub fn clean_float(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub exec_time_ms:    i64,
    pub closed_size:     f64,
    pub order_type:      String,
    pub stop_order_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPnl {
    pub created_time_ms: i64,
    pub closed_pnl:      f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Ticker {
    pub last_price:    f64,
    pub price_24h_pct: f64,
    pub high_24h:      f64,
    pub low_24h:       f64,
    pub volume_24h:    f64,
    pub turnover_24h:  f64,
    pub open_interest: f64,
    pub funding_rate:  f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongShortRatio {
    pub buy_ratio:  f64,
    pub sell_ratio: f64,
}
