use chrono::{DateTime, Utc};

use crate::config::RiskLimits;
use crate::trading_state::TradingState;
use crate::types::{ExchangePosition, InstrumentInfo, Side, TradeSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCheck {
    CircuitBreaker,
    DailyLossLimit,
    TotalDrawdown,
    DailyTradeCount,
    DailyProfitCap,
    Confidence,
    StopLoss,
    TakeProfitPlacement,
    EntryPrice,
    MarginExposure,
    RewardRisk,
    ProfitDistribution,
}

impl RiskCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskCheck::CircuitBreaker      => "circuit_breaker",
            RiskCheck::DailyLossLimit      => "daily_loss_limit",
            RiskCheck::TotalDrawdown       => "total_drawdown",
            RiskCheck::DailyTradeCount     => "daily_trade_count",
            RiskCheck::DailyProfitCap      => "daily_profit_cap",
            RiskCheck::Confidence          => "confidence",
            RiskCheck::StopLoss            => "stop_loss",
            RiskCheck::TakeProfitPlacement => "tp_placement",
            RiskCheck::EntryPrice          => "entry_price",
            RiskCheck::MarginExposure      => "margin_exposure",
            RiskCheck::RewardRisk          => "rr_ratio",
            RiskCheck::ProfitDistribution  => "profit_distribution",
        }
    }

    /// Rejections that depend only on the signal, not on the account.
    pub fn is_signal_specific(self) -> bool {
        matches!(self, RiskCheck::Confidence | RiskCheck::RewardRisk)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskRejection {
    pub check:  RiskCheck,
    pub reason: String,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.check.as_str(), self.reason)
    }
}

type CheckResult = Result<(), RiskRejection>;

fn reject(check: RiskCheck, reason: String) -> CheckResult {
    Err(RiskRejection { check, reason })
}

#[derive(Debug, Clone, Default)]
pub struct RiskValidator {
    limits: RiskLimits,
}

impl RiskValidator {
    pub fn new(limits: RiskLimits) -> Self {
        RiskValidator { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Runs every check in order. `exchange_positions` is the live account
    /// position list used for the margin check.
    pub fn validate_trade(
        &self,
        state: &mut TradingState,
        signal: &TradeSignal,
        balance: f64,
        exchange_positions: &[ExchangePosition],
    ) -> CheckResult {
        self.validate_trade_at(Utc::now(), state, signal, balance, exchange_positions)
    }

    pub fn validate_trade_at(
        &self,
        now: DateTime<Utc>,
        state: &mut TradingState,
        signal: &TradeSignal,
        balance: f64,
        exchange_positions: &[ExchangePosition],
    ) -> CheckResult {
        state.reset_daily_if_needed_at(now.date_naive());

        let result = self
            .check_circuit_breaker(state, now)
            .and_then(|_| self.check_daily_loss_limit(state))
            .and_then(|_| self.check_total_drawdown(state, balance))
            .and_then(|_| self.check_daily_trade_count(state))
            .and_then(|_| self.check_daily_profit_cap(state))
            .and_then(|_| self.check_confidence(signal))
            .and_then(|_| self.check_stop_loss(signal))
            .and_then(|_| self.check_tp_placement(signal))
            .and_then(|_| self.check_entry_price(signal))
            .and_then(|_| self.check_margin_exposure(exchange_positions, balance))
            .and_then(|_| self.check_rr_ratio(signal))
            .and_then(|_| self.check_profit_distribution(state));

        if let Err(r) = &result {
            log::warn!("RISK REJECTION {} {}: {}", signal.side, signal.symbol, r);
        }
        result
    }

    // ── Account-level checks ─────────────────────────────────────────────────

    pub fn check_circuit_breaker(&self, state: &mut TradingState, now: DateTime<Utc>) -> CheckResult {
        if state.is_circuit_breaker_active_at(now) {
            return reject(
                RiskCheck::CircuitBreaker,
                format!(
                    "Circuit breaker active ({:.1}h remaining, {} consecutive losses)",
                    state.circuit_breaker_remaining_hours_at(now),
                    state.consecutive_losses
                ),
            );
        }
        Ok(())
    }

    pub fn check_daily_loss_limit(&self, state: &TradingState) -> CheckResult {
        let max_loss = self.limits.max_daily_loss();
        if state.daily_pnl <= -max_loss {
            return reject(
                RiskCheck::DailyLossLimit,
                format!("Daily loss limit hit (${:+.2} <= -${:.2})", state.daily_pnl, max_loss),
            );
        }
        Ok(())
    }

    /// Raises the peak first when `balance` is a new high.
    pub fn check_total_drawdown(&self, state: &mut TradingState, balance: f64) -> CheckResult {
        let drawdown = state.drawdown(balance);
        let max_dd = self.limits.max_drawdown();
        if drawdown >= max_dd {
            return reject(
                RiskCheck::TotalDrawdown,
                format!(
                    "Total drawdown limit (${:.2} >= ${:.2}, peak ${:.2})",
                    drawdown, max_dd, state.peak_balance
                ),
            );
        }
        Ok(())
    }

    pub fn check_daily_trade_count(&self, state: &TradingState) -> CheckResult {
        if state.trades_today >= self.limits.max_trades_per_day {
            return reject(
                RiskCheck::DailyTradeCount,
                format!(
                    "Max trades/day reached ({}/{})",
                    state.trades_today, self.limits.max_trades_per_day
                ),
            );
        }
        Ok(())
    }

    pub fn check_daily_profit_cap(&self, state: &TradingState) -> CheckResult {
        let cap = self.limits.daily_profit_cap();
        if state.daily_pnl >= cap {
            return reject(
                RiskCheck::DailyProfitCap,
                format!("Daily profit cap reached (${:+.2} >= ${:.2})", state.daily_pnl, cap),
            );
        }
        Ok(())
    }

    /// Existing margin across every live position plus the new trade's
    /// minimum-notional margin must stay under the exposure cap.
    pub fn check_margin_exposure(&self, positions: &[ExchangePosition], balance: f64) -> CheckResult {
        let max_margin = balance * self.limits.max_margin_exposure_pct;
        let current: f64 = positions.iter().map(ExchangePosition::margin).sum();
        let proposed = balance * self.limits.min_trade_value_pct / self.limits.assumed_leverage;
        if current + proposed >= max_margin {
            return reject(
                RiskCheck::MarginExposure,
                format!(
                    "Max margin exposure (${:.2} current + ${:.2} new >= ${:.2})",
                    current, proposed, max_margin
                ),
            );
        }
        Ok(())
    }

    /// Skipped until enough trading days and lifetime profit exist.
    pub fn check_profit_distribution(&self, state: &TradingState) -> CheckResult {
        let days = state.trading_days_count();
        if days < self.limits.distribution_min_days {
            return Ok(());
        }
        if state.total_pnl < self.limits.distribution_min_profit {
            return Ok(());
        }
        let ratio = state.profit_distribution_ratio();
        if ratio > self.limits.profit_distribution_max {
            return reject(
                RiskCheck::ProfitDistribution,
                format!(
                    "Profit distribution limit ({:.0}% of ${:.2} > {:.0}%)",
                    ratio * 100.0,
                    state.total_pnl,
                    self.limits.profit_distribution_max * 100.0
                ),
            );
        }
        Ok(())
    }

    // ── Signal checks ────────────────────────────────────────────────────────

    pub fn check_confidence(&self, signal: &TradeSignal) -> CheckResult {
        if signal.confidence < self.limits.min_confidence {
            return reject(
                RiskCheck::Confidence,
                format!("Confidence too low ({} < {})", signal.confidence, self.limits.min_confidence),
            );
        }
        Ok(())
    }

    /// Dollar risk is bounded at sizing; this only rejects unusable stops.
    pub fn check_stop_loss(&self, signal: &TradeSignal) -> CheckResult {
        if signal.entry_price <= 0.0 || signal.stop_loss <= 0.0 {
            return reject(
                RiskCheck::StopLoss,
                format!("Invalid entry/SL prices (entry {}, SL {})", signal.entry_price, signal.stop_loss),
            );
        }
        if signal.risk_distance() <= 0.0 {
            return reject(
                RiskCheck::StopLoss,
                format!("SL distance is zero (entry {} == SL {})", signal.entry_price, signal.stop_loss),
            );
        }
        Ok(())
    }

    pub fn check_tp_placement(&self, signal: &TradeSignal) -> CheckResult {
        let (entry, sl, tp1) = (signal.entry_price, signal.stop_loss, signal.take_profit_1);
        if entry <= 0.0 || sl <= 0.0 || tp1 <= 0.0 {
            return reject(
                RiskCheck::TakeProfitPlacement,
                format!("Missing prices (entry {}, SL {}, TP1 {})", entry, sl, tp1),
            );
        }
        match signal.side {
            Side::Long if tp1 <= entry => {
                return reject(
                    RiskCheck::TakeProfitPlacement,
                    format!("LONG TP1 ({}) is not above entry ({})", tp1, entry),
                );
            }
            Side::Short if tp1 >= entry => {
                return reject(
                    RiskCheck::TakeProfitPlacement,
                    format!("SHORT TP1 ({}) is not below entry ({})", tp1, entry),
                );
            }
            Side::Long if sl >= entry => {
                return reject(
                    RiskCheck::TakeProfitPlacement,
                    format!("LONG SL ({}) is not below entry ({})", sl, entry),
                );
            }
            Side::Short if sl <= entry => {
                return reject(
                    RiskCheck::TakeProfitPlacement,
                    format!("SHORT SL ({}) is not above entry ({})", sl, entry),
                );
            }
            _ => {}
        }
        let sl_dist = signal.risk_distance();
        let tp_dist = signal.reward_distance();
        let min_reward = sl_dist * self.limits.min_reward_to_risk;
        if tp_dist < min_reward {
            return reject(
                RiskCheck::TakeProfitPlacement,
                format!(
                    "TP1 too close: reward {:.4} < {:.0}% of risk {:.4}",
                    tp_dist,
                    self.limits.min_reward_to_risk * 100.0,
                    sl_dist
                ),
            );
        }
        Ok(())
    }

    pub fn check_entry_price(&self, signal: &TradeSignal) -> CheckResult {
        if signal.entry_price <= 0.0 {
            return reject(
                RiskCheck::EntryPrice,
                format!("Invalid entry price ({})", signal.entry_price),
            );
        }
        Ok(())
    }

    pub fn check_rr_ratio(&self, signal: &TradeSignal) -> CheckResult {
        let rr = signal.effective_rr();
        if rr < self.limits.min_rr_ratio {
            return reject(
                RiskCheck::RewardRisk,
                format!("R:R too low ({:.2} < {:.2})", rr, self.limits.min_rr_ratio),
            );
        }
        Ok(())
    }

    // ── Sizing ───────────────────────────────────────────────────────────────

    /// Quantity whose stop-out loses at most the fixed risk amount (plus one
    /// lot step of rounding). Returns 0.0 when no such quantity exists.
    pub fn calculate_position_size(
        &self,
        instrument: &InstrumentInfo,
        entry: f64,
        stop_loss: f64,
        confidence: u8,
        balance: f64,
    ) -> f64 {
        if !instrument.is_valid() || entry <= 0.0 || stop_loss <= 0.0 {
            log::error!(
                "Position size: unusable inputs for {} (step {}, min {}, entry {}, SL {})",
                instrument.symbol, instrument.qty_step, instrument.min_order_qty, entry, stop_loss
            );
            return 0.0;
        }
        let risk_amount = self.limits.fixed_risk_amount;
        let risk_per_unit = (entry - stop_loss).abs();
        if risk_per_unit <= 0.0 {
            return 0.0;
        }

        let mut qty = risk_amount / risk_per_unit;

        let min_value = balance * self.limits.min_trade_value_pct;
        if qty * entry < min_value {
            qty = min_value / entry;
        }

        let max_position_value =
            balance * self.limits.max_margin_exposure_pct * self.limits.assumed_leverage;
        if qty * entry > max_position_value {
            qty = max_position_value / entry;
        }

        // The notional floor must never lift risk past the fixed amount.
        if qty * risk_per_unit > risk_amount {
            qty = risk_amount / risk_per_unit;
        }

        let qty = instrument.round_qty(qty);
        let final_risk = qty * risk_per_unit;
        let tolerance = instrument.qty_step * risk_per_unit;
        if final_risk > risk_amount + tolerance + 1e-9 {
            log::warn!(
                "Position size: min order qty {} {} risks ${:.2} > ${:.2}, not trading",
                instrument.min_order_qty, instrument.symbol, final_risk, risk_amount
            );
            return 0.0;
        }

        log::info!(
            "Position size: {} {} | Risk: ${:.2} [fixed ${:.0}] | Value: ${:.2} | Entry: {:.4} | SL: {:.4} | conf {}",
            qty, instrument.symbol, final_risk, risk_amount, qty * entry, entry, stop_loss, confidence
        );
        qty
    }

    /// Drawdown from the high-water mark as a percent of account size.
    pub fn drawdown_pct(&self, state: &mut TradingState, balance: f64) -> f64 {
        state.drawdown(balance) / self.limits.account_size * 100.0
    }
}
