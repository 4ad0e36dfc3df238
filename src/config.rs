// ─── Bybit endpoints ──────────────────────────────────────────────────────────
pub const BYBIT_DEMO_REST_URL: &str = "https://api-demo.bybit.com";
pub const BYBIT_LIVE_REST_URL: &str = "https://api.bybit.com";
// BYBIT_API_KEY, BYBIT_SECRET, GEMINI_API_KEY, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime (see .env.example)

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/";
pub const DEFAULT_STATE_FILE: &str = "trading_state.json";
pub const DEFAULT_SYMBOLS: &[&str] = &["SOLUSDT"];

// ─── Hardcoded safety limits (never loaded from env) ──────────────────────────
pub const ACCOUNT_SIZE: f64 = 10_000.0;
pub const FIXED_RISK_AMOUNT: f64 = 50.0;         // USDT risked per trade
pub const DAILY_LOSS_LIMIT_PCT: f64 = 0.0275;    // $275
pub const MAX_DRAWDOWN_PCT: f64 = 0.045;         // $450
pub const MIN_TRADE_VALUE_PCT: f64 = 0.06;       // 6 % of balance as notional floor
pub const MAX_MARGIN_EXPOSURE_PCT: f64 = 0.15;   // 15 % of balance as margin
pub const ASSUMED_LEVERAGE: f64 = 10.0;
pub const MAX_TRADES_PER_DAY: u32 = 2;
pub const DAILY_PROFIT_CAP_PCT: f64 = 0.03;      // $300
pub const MIN_RR_RATIO: f64 = 1.5;
pub const MIN_CONFIDENCE: u8 = 7;
pub const MIN_REWARD_TO_RISK_DISTANCE: f64 = 0.8;
pub const CIRCUIT_BREAKER_LOSSES: u32 = 3;
pub const CIRCUIT_BREAKER_PAUSE_HOURS: i64 = 24;
pub const PROFIT_DISTRIBUTION_MAX: f64 = 0.30;   // no single day > 30 % of lifetime profit
pub const PROFIT_DISTRIBUTION_MIN_DAYS: usize = 5;
pub const PROFIT_DISTRIBUTION_MIN_PROFIT: f64 = 500.0;

// ─── Timing ───────────────────────────────────────────────────────────────────
pub const ANALYSIS_INTERVAL_SECS: u64 = 900;
pub const MONITOR_INTERVAL_SECS: u64 = 30;
pub const MIN_LOOP_SLEEP_SECS: u64 = 5;
pub const LOOP_ERROR_COOLDOWN_SECS: u64 = 30;
pub const SL_VERIFY_TIMEOUT_SECS: u64 = 30;
pub const SL_VERIFY_POLL_SECS: u64 = 2;

// ─── Position management ──────────────────────────────────────────────────────
pub const PARTIAL_CLOSE_PCT: f64 = 0.50;         // close 50 % of original qty at TP1
pub const TRAILING_ATR_MULT: f64 = 1.0;
pub const MAX_HOLD_HOURS: i64 = 48;
pub const TRADE_HISTORY_CAP: usize = 100;

// ─── Decision provider ────────────────────────────────────────────────────────
pub const DECISION_MAX_ATTEMPTS: u32 = 3;
pub const DECISION_TEMPERATURE: f64 = 0.2;
pub const DECISION_MAX_TOKENS: u32 = 1024;

/// Every bound the risk engine enforces, gathered so the engine can be built
/// with tighter or looser numbers in tests while production always uses
/// [`RiskLimits::HARDCODED`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    pub account_size:             f64,
    pub fixed_risk_amount:        f64,
    pub daily_loss_limit_pct:     f64,
    pub max_drawdown_pct:         f64,
    pub min_trade_value_pct:      f64,
    pub max_margin_exposure_pct:  f64,
    pub assumed_leverage:         f64,
    pub max_trades_per_day:       u32,
    pub daily_profit_cap_pct:     f64,
    pub min_rr_ratio:             f64,
    pub min_confidence:           u8,
    pub min_reward_to_risk:       f64,
    pub profit_distribution_max:  f64,
    pub distribution_min_days:    usize,
    pub distribution_min_profit:  f64,
}

impl RiskLimits {
    pub const HARDCODED: RiskLimits = RiskLimits {
        account_size:            ACCOUNT_SIZE,
        fixed_risk_amount:       FIXED_RISK_AMOUNT,
        daily_loss_limit_pct:    DAILY_LOSS_LIMIT_PCT,
        max_drawdown_pct:        MAX_DRAWDOWN_PCT,
        min_trade_value_pct:     MIN_TRADE_VALUE_PCT,
        max_margin_exposure_pct: MAX_MARGIN_EXPOSURE_PCT,
        assumed_leverage:        ASSUMED_LEVERAGE,
        max_trades_per_day:      MAX_TRADES_PER_DAY,
        daily_profit_cap_pct:    DAILY_PROFIT_CAP_PCT,
        min_rr_ratio:            MIN_RR_RATIO,
        min_confidence:          MIN_CONFIDENCE,
        min_reward_to_risk:      MIN_REWARD_TO_RISK_DISTANCE,
        profit_distribution_max: PROFIT_DISTRIBUTION_MAX,
        distribution_min_days:   PROFIT_DISTRIBUTION_MIN_DAYS,
        distribution_min_profit: PROFIT_DISTRIBUTION_MIN_PROFIT,
    };

    pub fn max_daily_loss(&self) -> f64 {
        self.account_size * self.daily_loss_limit_pct
    }

    pub fn max_drawdown(&self) -> f64 {
        self.account_size * self.max_drawdown_pct
    }

    pub fn daily_profit_cap(&self) -> f64 {
        self.account_size * self.daily_profit_cap_pct
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self::HARDCODED
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} env var not set")]
    Missing(&'static str),
}

/// Credentials and endpoints. Everything risk-related stays in the constants above.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bybit_api_key:    String,
    pub bybit_api_secret: String,
    pub bybit_testnet:    bool,
    pub gemini_api_key:   String,
    pub gemini_model:     String,
    pub gemini_base_url:  String,
    pub telegram_token:   Option<String>,
    pub telegram_chat_id: Option<String>,
    pub state_file:       String,
    pub symbols:          Vec<String>,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(BotConfig {
            bybit_api_key:    required("BYBIT_API_KEY")?,
            bybit_api_secret: required("BYBIT_SECRET")?,
            bybit_testnet:    optional("BYBIT_TESTNET")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            gemini_api_key:   required("GEMINI_API_KEY")?,
            gemini_model:     optional("GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url:  optional("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            telegram_token:   optional("TELEGRAM_TOKEN"),
            telegram_chat_id: optional("TELEGRAM_CHAT_ID"),
            state_file:       optional("STATE_FILE")
                .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            symbols:          optional("SYMBOLS")
                .map(|s| parse_symbols(&s))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()),
        })
    }

    pub fn bybit_rest_url(&self) -> &'static str {
        if self.bybit_testnet { BYBIT_DEMO_REST_URL } else { BYBIT_LIVE_REST_URL }
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
