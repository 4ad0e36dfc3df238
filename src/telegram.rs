use async_trait::async_trait;
use std::time::Duration;

use crate::types::{ExitType, Side};

const BASE_URL: &str = "https://api.telegram.org";

/// Daily figures rendered in the summary message.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyStats {
    pub trades_today:   u32,
    pub wins:           u32,
    pub losses:         u32,
    pub daily_pnl:      f64,
    pub total_pnl:      f64,
    pub balance:        f64,
    pub drawdown_pct:   f64,
    pub trading_days:   usize,
    pub open_positions: usize,
}

/// One-way alert channel. Implementations swallow their own failures:
/// nothing here returns an error to the trading path.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);

    // ── Convenience helpers ──────────────────────────────────────────────────

    async fn notify_startup(&self, balance: f64, testnet: bool, symbols: &[String]) {
        let mode = if testnet { "TESTNET" } else { "LIVE" };
        let msg = format!(
            "🤖 <b>Gemini Trader started</b>\n\
             Mode: {mode}\n\
             Symbols: {}\n\
             Balance: <code>${balance:.2}</code>",
            symbols.join(", ")
        );
        self.send(&msg).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn notify_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        entry: f64,
        sl: f64,
        tp1: f64,
        tp2: f64,
        confidence: u8,
        reasoning: &str,
    ) {
        let emoji = if side == Side::Long { "🟢" } else { "🔴" };
        let msg = format!(
            "{emoji} <b>New entry: {side} {symbol}</b>\n\
             Qty:    <code>{qty}</code>\n\
             Entry:  <code>{entry:.4}</code>\n\
             SL:     <code>{sl:.4}</code>\n\
             TP1:    <code>{tp1:.4}</code>\n\
             TP2:    <code>{tp2:.4}</code>\n\
             Confidence: <code>{confidence}/10</code>\n\n\
             {}",
            escape_html(reasoning)
        );
        self.send(&msg).await;
    }

    async fn notify_exit(
        &self,
        symbol: &str,
        side: Side,
        pnl: f64,
        exit_type: ExitType,
        daily_pnl: f64,
        balance: f64,
    ) {
        let (emoji, result) = if pnl > 0.0 { ("✅", "WIN") } else { ("❌", "LOSS") };
        let msg = format!(
            "{emoji} <b>{result}: {side} {symbol}</b>\n\
             PnL:   <code>{pnl:+.2} USDT</code>\n\
             Exit:  {exit_type}\n\
             Daily PnL: <code>{daily_pnl:+.2}</code>\n\
             Balance:   <code>${balance:.2}</code>",
        );
        self.send(&msg).await;
    }

    async fn notify_partial_close(&self, symbol: &str, side: Side, qty_closed: f64, pnl_locked: f64) {
        let msg = format!(
            "🎯 <b>TP1 partial: {side} {symbol}</b>\n\
             Closed: <code>{qty_closed}</code> (50%)\n\
             PnL locked: <code>{pnl_locked:+.2} USDT</code>\n\
             SL moved to break-even, remainder rides to TP2",
        );
        self.send(&msg).await;
    }

    async fn notify_risk_rejection(&self, symbol: &str, side: Side, reason: &str) {
        let msg = format!(
            "⛔ <b>Trade rejected: {side} {symbol}</b>\nReason: {}",
            escape_html(reason)
        );
        self.send(&msg).await;
    }

    async fn notify_circuit_breaker(&self, losses: u32, pause_hours: i64) {
        let msg = format!(
            "🚨 <b>Circuit breaker</b>\n\
             Consecutive losses: <code>{losses}</code>\n\
             Trading paused for {pause_hours}h",
        );
        self.send(&msg).await;
    }

    async fn notify_orphan(&self, symbol: &str, side: Side, size: f64, avg_price: f64) {
        let msg = format!(
            "⚠️ <b>Orphan position adopted</b>\n\
             {side} {symbol} size <code>{size}</code> @ <code>{avg_price:.4}</code>\n\
             Not in local state; now tracked, no new entries until it closes",
        );
        self.send(&msg).await;
    }

    async fn notify_manual_close(&self, symbol: &str, pnl: f64) {
        let msg = format!(
            "✋ <b>Manual close detected: {symbol}</b>\n\
             PnL: <code>{pnl:+.2} USDT</code>\n\
             Bot is free to open new trades",
        );
        self.send(&msg).await;
    }

    async fn notify_daily_summary(&self, stats: &DailyStats) {
        let msg = format!(
            "📊 <b>Daily Summary</b>\n\
             Trades: <code>{}</code>  Wins: <code>{}</code>  Losses: <code>{}</code>\n\
             Daily PnL: <code>{:+.2} USDT</code>\n\
             Total PnL: <code>{:+.2} USDT</code>\n\
             Balance:   <code>${:.2}</code>\n\
             Drawdown:  <code>{:.1}%</code>\n\
             Trading days: <code>{}</code>  Open positions: <code>{}</code>",
            stats.trades_today,
            stats.wins,
            stats.losses,
            stats.daily_pnl,
            stats.total_pnl,
            stats.balance,
            stats.drawdown_pct,
            stats.trading_days,
            stats.open_positions,
        );
        self.send(&msg).await;
    }

    async fn notify_error(&self, error: &str) {
        self.send(&format!("⚠️ <b>Error</b>\n{}", escape_html(error))).await;
    }

    async fn notify_critical(&self, message: &str) {
        self.send(&format!("🆘 <b>CRITICAL</b>\n{}", escape_html(message))).await;
    }

    async fn notify_shutdown(&self) {
        self.send("🛑 <b>Gemini Trader stopped</b>\nState saved").await;
    }
}

// ── Telegram Bot API ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: Option<String>,
    chat_id: String,
}

impl TelegramBot {
    /// Missing token or chat id leaves the bot disabled; sends become no-ops.
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        match (token, chat_id) {
            (Some(token), Some(chat_id)) => TelegramBot {
                client,
                url: Some(format!("{}/bot{}/sendMessage", BASE_URL, token)),
                chat_id,
            },
            _ => {
                log::warn!("Telegram notifications disabled (missing TELEGRAM_TOKEN / TELEGRAM_CHAT_ID)");
                TelegramBot { client, url: None, chat_id: String::new() }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl Notifier for TelegramBot {
    async fn send(&self, text: &str) {
        let url = match &self.url {
            Some(u) => u,
            None => return,
        };
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }
}

/// Free text (model reasoning, error messages) must not break HTML parse mode.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
