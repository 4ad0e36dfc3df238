use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::{SL_VERIFY_POLL_SECS, SL_VERIFY_TIMEOUT_SECS};
use crate::exchange::{close_once_confirmed, equity_or_account_size, Exchange};
use crate::risk_validator::RiskValidator;
use crate::telegram::Notifier;
use crate::trading_state::TradingState;
use crate::types::{ExchangePosition, Position, TradeSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Proposed,
    Precheck,
    Validated,
    Sized,
    Submitted,
    SlVerified,
    Recorded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Opened(Position),
    /// Nothing reached the exchange, or the order was refused.
    Aborted { stage: ExecutionStage, reason: String },
    /// The order filled but its stop-loss never showed up.
    EmergencyClosed { reason: String, flattened: bool },
}

impl ExecutionOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, ExecutionOutcome::Opened(_))
    }
}

pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    risk: RiskValidator,
    pub sl_verify_timeout: Duration,
    pub sl_verify_poll: Duration,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, notifier: Arc<dyn Notifier>, risk: RiskValidator) -> Self {
        OrderExecutor {
            exchange,
            notifier,
            risk,
            sl_verify_timeout: Duration::from_secs(SL_VERIFY_TIMEOUT_SECS),
            sl_verify_poll: Duration::from_secs(SL_VERIFY_POLL_SECS),
        }
    }

    pub async fn execute_trade(&self, state: &mut TradingState, mut signal: TradeSignal) -> ExecutionOutcome {
        let symbol = signal.symbol.clone();
        let side = signal.side;

        // ── PROPOSED ─────────────────────────────────────────────────────────
        if signal.take_profit_2 <= 0.0 && signal.take_profit_1 > 0.0 {
            signal.take_profit_2 = signal.take_profit_1;
        }
        if signal.entry_price <= 0.0 || signal.stop_loss <= 0.0 || signal.take_profit_1 <= 0.0 {
            let reason = format!(
                "Invalid signal prices: entry={} sl={} tp1={}",
                signal.entry_price, signal.stop_loss, signal.take_profit_1
            );
            log::error!("{}", reason);
            return abort(ExecutionStage::Proposed, reason);
        }

        // ── PRECHECK ─────────────────────────────────────────────────────────
        if state.has_open_position() {
            let reason = format!("already tracking {} position(s) locally", state.open_positions.len());
            log::warn!("Cannot open {}: {}", symbol, reason);
            return abort(ExecutionStage::Precheck, reason);
        }
        let exchange_positions = match self.exchange.open_positions().await {
            Ok(list) => list,
            Err(e) => {
                let reason = format!("exchange position check failed: {}", e);
                log::error!("Cannot open {}: {}", symbol, reason);
                return abort(ExecutionStage::Precheck, reason);
            }
        };
        if let Some(p) = exchange_positions.iter().find(|p| p.size > 0.0) {
            let reason = format!("exchange has an open {} position in {}", p.side, p.symbol);
            log::warn!("Cannot open {}: {}", symbol, reason);
            return abort(ExecutionStage::Precheck, reason);
        }

        // ── VALIDATED ────────────────────────────────────────────────────────
        let balance = equity_or_account_size(self.exchange.as_ref()).await;
        if let Err(rejection) = self.risk.validate_trade(state, &signal, balance, &exchange_positions) {
            self.notifier.notify_risk_rejection(&symbol, side, &rejection.reason).await;
            return abort(ExecutionStage::Validated, rejection.to_string());
        }

        // ── SIZED ────────────────────────────────────────────────────────────
        let live_price = self.exchange.last_price(&symbol).await.ok().filter(|p| *p > 0.0);
        let sizing_price = live_price.unwrap_or(signal.entry_price);
        if (sizing_price - signal.entry_price).abs() > f64::EPSILON {
            log::info!(
                "Position sizing: using live price {:.4} (signal entry was {:.4})",
                sizing_price, signal.entry_price
            );
        }
        let instrument = match self.exchange.instrument_info(&symbol).await {
            Ok(info) => info,
            Err(e) => return abort(ExecutionStage::Sized, format!("instrument info failed: {}", e)),
        };
        let qty = self.risk.calculate_position_size(
            &instrument,
            sizing_price,
            signal.stop_loss,
            signal.confidence,
            balance,
        );
        if qty <= 0.0 {
            log::warn!("Position size is 0 for {}", symbol);
            return abort(ExecutionStage::Sized, "position size resolved to 0".into());
        }

        // ── SUBMITTED ────────────────────────────────────────────────────────
        let order_id = match self
            .exchange
            .place_market_order(&symbol, side, qty, signal.stop_loss, signal.take_profit_1)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                log::error!("Order failed for {}: {}", symbol, e);
                self.notifier.notify_error(&format!("Order failed for {} {}: {}", side, symbol, e)).await;
                return abort(ExecutionStage::Submitted, format!("order placement failed: {}", e));
            }
        };

        // ── SL_VERIFIED ──────────────────────────────────────────────────────
        let (verified, last_seen) = self.verify_stop_loss(&symbol).await;
        let live = match verified {
            Some(p) => p,
            None => {
                let close_qty = last_seen.map(|p| p.size).unwrap_or(qty);
                return self.emergency_close(&signal, close_qty).await;
            }
        };

        // ── RECORDED ─────────────────────────────────────────────────────────
        let entry_price = if live.avg_price > 0.0 {
            live.avg_price
        } else {
            self.exchange.last_price(&symbol).await.unwrap_or(0.0)
        };
        let position = Position {
            order_id,
            symbol: symbol.clone(),
            side,
            qty,
            original_qty: qty,
            entry_price,
            stop_loss: signal.stop_loss,
            take_profit_1: signal.take_profit_1,
            take_profit_2: signal.take_profit_2,
            confidence: signal.confidence,
            risk_reward_ratio: signal.effective_rr(),
            reasoning: signal.reasoning.clone(),
            entry_timestamp: Utc::now(),
            atr: signal.atr,
            partial_filled: false,
            breakeven_activated: false,
            trailing_activated: false,
            partial_pnl: 0.0,
        };
        state.add_position(position.clone());
        state.persist();

        let reasoning_preview: String = signal.reasoning.chars().take(200).collect();
        log::info!(
            target: "trades",
            "ENTRY | symbol={} | side={} | qty={} | entry={:.4} | sl={:.4} | tp1={:.4} | tp2={:.4} | confidence={} | rr={:.2} | reasoning={}",
            symbol, side, qty, entry_price, signal.stop_loss, signal.take_profit_1,
            signal.take_profit_2, signal.confidence, position.risk_reward_ratio, reasoning_preview
        );
        log::info!(
            "ENTRY: {} {} {} @ {:.4} | SL={:.4} | TP1={:.4} | TP2={:.4} | Confidence: {}/10",
            side, qty, symbol, entry_price, signal.stop_loss, signal.take_profit_1,
            signal.take_profit_2, signal.confidence
        );
        self.notifier
            .notify_entry(
                &symbol,
                side,
                qty,
                entry_price,
                signal.stop_loss,
                signal.take_profit_1,
                signal.take_profit_2,
                signal.confidence,
                &signal.reasoning,
            )
            .await;

        ExecutionOutcome::Opened(position)
    }

    /// Polls until the live position carries a stop-loss. Returns the verified
    /// position, plus the last position seen either way.
    async fn verify_stop_loss(&self, symbol: &str) -> (Option<ExchangePosition>, Option<ExchangePosition>) {
        let deadline = tokio::time::Instant::now() + self.sl_verify_timeout;
        let mut last_seen = None;
        loop {
            match self.exchange.position(symbol).await {
                Ok(Some(p)) if p.size > 0.0 => {
                    if p.stop_loss > 0.0 {
                        log::info!("SL verified for {}: {:.4}", symbol, p.stop_loss);
                        return (Some(p.clone()), Some(p));
                    }
                    last_seen = Some(p);
                }
                Ok(_) => {}
                Err(e) => log::error!("Error verifying SL for {}: {}", symbol, e),
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.sl_verify_poll).await;
        }
        log::error!("SL NOT VERIFIED within {:?} for {}", self.sl_verify_timeout, symbol);
        (None, last_seen)
    }

    async fn emergency_close(&self, signal: &TradeSignal, qty: f64) -> ExecutionOutcome {
        let symbol = &signal.symbol;
        let reason = format!("stop-loss not confirmed within {:?}", self.sl_verify_timeout);
        match close_once_confirmed(self.exchange.as_ref(), symbol, signal.side, qty, qty).await {
            Ok(order_id) => {
                log::warn!("Emergency close executed for {} ({})", symbol, order_id);
                log::info!(
                    target: "trades",
                    "EMERGENCY_CLOSE | symbol={} | side={} | qty={} | flattened=true | reason={}",
                    symbol, signal.side, qty, reason
                );
                self.notifier
                    .notify_error(&format!("SL verification failed for {}: position closed", symbol))
                    .await;
                ExecutionOutcome::EmergencyClosed { reason, flattened: true }
            }
            Err(e) => {
                log::error!("CRITICAL: Emergency close failed for {}: {}", symbol, e);
                log::info!(
                    target: "trades",
                    "EMERGENCY_CLOSE | symbol={} | side={} | qty={} | flattened=false | reason={}",
                    symbol, signal.side, qty, reason
                );
                self.notifier
                    .notify_critical(&format!(
                        "Emergency close FAILED for {} {} qty {}: {}. Position is live without a stop-loss.",
                        signal.side, symbol, qty, e
                    ))
                    .await;
                ExecutionOutcome::EmergencyClosed { reason, flattened: false }
            }
        }
    }
}

fn abort(stage: ExecutionStage, reason: String) -> ExecutionOutcome {
    ExecutionOutcome::Aborted { stage, reason }
}
