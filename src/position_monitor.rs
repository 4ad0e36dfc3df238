use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::{
    CIRCUIT_BREAKER_PAUSE_HOURS, MAX_HOLD_HOURS, PARTIAL_CLOSE_PCT, TRAILING_ATR_MULT,
};
use crate::exchange::{close_once_confirmed, equity_or_account_size, Exchange, ExchangeError};
use crate::telegram::Notifier;
use crate::trading_state::TradingState;
use crate::types::{clean_float, ExchangePosition, Execution, ExitType, Position, Side};

const CLOSED_PNL_LOOKBACK: u32 = 10;
const EXECUTION_LOOKBACK: u32 = 20;

pub struct PositionMonitor {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
}

impl PositionMonitor {
    pub fn new(exchange: Arc<dyn Exchange>, notifier: Arc<dyn Notifier>) -> Self {
        PositionMonitor { exchange, notifier }
    }

    pub async fn check_positions(&self, state: &mut TradingState) {
        self.check_positions_at(Utc::now(), state).await
    }

    pub async fn check_positions_at(&self, now: DateTime<Utc>, state: &mut TradingState) {
        if !state.has_open_position() {
            self.adopt_orphans(now, state).await;
            return;
        }

        let symbols: Vec<String> = state.open_positions.iter().map(|p| p.symbol.clone()).collect();
        for symbol in symbols {
            let price = match self.exchange.last_price(&symbol).await {
                Ok(p) if p > 0.0 => p,
                Ok(_) | Err(_) => {
                    log::warn!("[{}] No live price, skipping this pass", symbol);
                    continue;
                }
            };
            let live = match self.exchange.position(&symbol).await {
                Ok(live) => live,
                Err(e) => {
                    // Unknown is not zero: never finalize on a failed query.
                    log::error!("[{}] Position query failed: {}", symbol, e);
                    continue;
                }
            };

            let live = match live {
                Some(p) if p.size > 0.0 => p,
                _ => {
                    self.handle_closed(now, state, &symbol, price, None).await;
                    continue;
                }
            };

            let mut pos = match state.open_positions.iter().find(|p| p.symbol == symbol) {
                Some(p) => p.clone(),
                None => continue,
            };
            reconcile_with_exchange(&mut pos, &live);

            if !pos.partial_filled {
                self.check_tp1_partial(&mut pos, price).await;
            }
            if pos.partial_filled && !pos.breakeven_activated {
                self.move_stop_to_breakeven(&mut pos).await;
            } else if pos.partial_filled {
                self.update_trailing_stop(&mut pos, price).await;
            }

            let hours_open = pos.hours_open(now);
            if let Some(slot) = state.position_mut(&symbol) {
                *slot = pos.clone();
            }

            if hours_open >= MAX_HOLD_HOURS as f64 {
                log::warn!("[{}] Max hold time ({}h) reached after {:.1}h", symbol, MAX_HOLD_HOURS, hours_open);
                match close_once_confirmed(self.exchange.as_ref(), &symbol, pos.side, pos.qty, pos.qty).await {
                    Ok(order_id) => {
                        log::info!("[{}] Force closed ({}), max hold time", symbol, order_id);
                        self.handle_closed(now, state, &symbol, price, Some(ExitType::MaxHold)).await;
                    }
                    Err(e) => log::error!("[{}] Force close failed: {}", symbol, e),
                }
            }
        }
        state.persist();
    }

    // ── Orphans ──────────────────────────────────────────────────────────────

    async fn adopt_orphans(&self, now: DateTime<Utc>, state: &mut TradingState) {
        let positions = match self.exchange.open_positions().await {
            Ok(list) => list,
            Err(e) => {
                log::error!("Error checking orphaned positions: {}", e);
                return;
            }
        };
        let mut adopted = false;
        for info in positions.into_iter().filter(|p| p.size > 0.0) {
            log::warn!(
                "[{}] ORPHANED position on exchange: {} size={} @ {:.4}, adding to local state",
                info.symbol, info.side, info.size, info.avg_price
            );
            self.notifier.notify_orphan(&info.symbol, info.side, info.size, info.avg_price).await;
            state.add_position(orphan_to_position(&info, now));
            adopted = true;
        }
        if adopted {
            state.persist();
        }
    }

    // ── TP1 partial / breakeven / trailing ───────────────────────────────────

    async fn check_tp1_partial(&self, pos: &mut Position, price: f64) {
        if !tp1_reached(pos, price) {
            return;
        }
        let raw_qty = pos.original_qty * PARTIAL_CLOSE_PCT;
        let close_qty = match self.exchange.instrument_info(&pos.symbol).await {
            Ok(info) if info.is_valid() => info.round_qty(raw_qty),
            _ => clean_float(raw_qty),
        }
        .min(pos.qty);

        match close_once_confirmed(self.exchange.as_ref(), &pos.symbol, pos.side, close_qty, pos.qty).await {
            Ok(_) => {
                pos.partial_filled = true;
                pos.qty = clean_float((pos.qty - close_qty).max(0.0));
                let locked = (price - pos.entry_price) * close_qty * pos.side.sign();
                pos.partial_pnl += locked;
                log::info!(
                    "TP1 PARTIAL: Closed {} of {} {} | PnL: {:+.2}",
                    close_qty, pos.original_qty, pos.symbol, locked
                );
                log::info!(
                    target: "trades",
                    "TP1_PARTIAL | symbol={} | side={} | qty_closed={} | pnl={:+.4} | price={:.4}",
                    pos.symbol, pos.side, close_qty, locked, price
                );
                self.notifier.notify_partial_close(&pos.symbol, pos.side, close_qty, locked).await;
            }
            Err(e) => log::error!("[{}] TP1 partial close failed: {}", pos.symbol, e),
        }
    }

    async fn move_stop_to_breakeven(&self, pos: &mut Position) {
        let be = round_price(pos.entry_price);
        if be <= 0.0 {
            return;
        }
        match self.exchange.set_stop_loss(&pos.symbol, be).await {
            Ok(()) => {
                pos.stop_loss = be;
                pos.breakeven_activated = true;
                log::info!("SL moved to break-even: {} SL={:.4}", pos.symbol, be);
            }
            Err(e) => log::error!("[{}] Error moving SL to break-even: {}", pos.symbol, e),
        }
    }

    async fn update_trailing_stop(&self, pos: &mut Position, price: f64) {
        let new_sl = match trailing_candidate(pos, price) {
            Some(sl) => sl,
            None => return,
        };
        match self.exchange.set_stop_loss(&pos.symbol, new_sl).await {
            Ok(()) => {
                pos.stop_loss = new_sl;
                pos.trailing_activated = true;
                log::info!("Trailing SL: {} SL={:.4}", pos.symbol, new_sl);
            }
            Err(e) => log::error!("[{}] Error updating trailing stop: {}", pos.symbol, e),
        }
    }

    // ── Exit handling ────────────────────────────────────────────────────────

    async fn handle_closed(
        &self,
        now: DateTime<Utc>,
        state: &mut TradingState,
        symbol: &str,
        last_price: f64,
        exit_override: Option<ExitType>,
    ) {
        let pos = match state.open_positions.iter().find(|p| p.symbol == symbol) {
            Some(p) => p.clone(),
            None => return,
        };
        let entry_ms = pos.entry_timestamp.timestamp_millis();

        let realized: Vec<f64> = match self.exchange.closed_pnl(symbol, CLOSED_PNL_LOOKBACK).await {
            Ok(records) => records
                .iter()
                .filter(|r| r.created_time_ms >= entry_ms)
                .map(|r| r.closed_pnl)
                .collect(),
            Err(e) => {
                log::error!("[{}] Error fetching closed PnL: {}", symbol, e);
                Vec::new()
            }
        };
        let pnl = trade_pnl(&pos, &realized, last_price);

        let exit_type = match exit_override {
            Some(t) => t,
            None => {
                let executions = self.exchange.recent_executions(symbol, EXECUTION_LOOKBACK).await;
                detect_exit_type(executions, entry_ms, pnl)
            }
        };

        let newly_tripped = state.record_trade_at(now, pnl, symbol, pos.side, exit_type);
        let duration_h = pos.hours_open(now);

        log::info!(
            "EXIT: {} {} | PnL={:+.2} | Type={} | Duration={:.1}h",
            symbol, pos.side, pnl, exit_type, duration_h
        );
        log::info!(
            target: "trades",
            "EXIT | symbol={} | side={} | pnl={:+.4} | exit_type={} | duration_h={:.1} | partial={} | trailing={} | daily_pnl={:.2} | total_pnl={:.2}",
            symbol, pos.side, pnl, exit_type, duration_h, pos.partial_filled,
            pos.trailing_activated, state.daily_pnl, state.total_pnl
        );

        let balance = equity_or_account_size(self.exchange.as_ref()).await;
        self.notifier
            .notify_exit(symbol, pos.side, pnl, exit_type, state.daily_pnl, balance)
            .await;
        if exit_type == ExitType::Manual {
            self.notifier.notify_manual_close(symbol, pnl).await;
        }
        if newly_tripped {
            state.activate_circuit_breaker_at(now);
            self.notifier
                .notify_circuit_breaker(state.consecutive_losses, CIRCUIT_BREAKER_PAUSE_HOURS)
                .await;
        }

        state.remove_position(symbol);
        state.persist();
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Overwrites local size and unknown entry price with exchange values.
fn reconcile_with_exchange(pos: &mut Position, live: &ExchangePosition) {
    if live.size < pos.qty {
        log::warn!(
            "[{}] Size mismatch: local={}, exchange={}. Using exchange.",
            pos.symbol, pos.qty, live.size
        );
        pos.qty = live.size;
    }
    if pos.entry_price <= 0.0 && live.avg_price > 0.0 {
        log::info!("[{}] Entry price refreshed from exchange: {:.4}", pos.symbol, live.avg_price);
        pos.entry_price = live.avg_price;
    }
}

/// Whole-trade PnL from the realized records at or after entry (one per
/// close, so a TP1 partial adds a second). Records not posted yet are
/// estimated: the partial from its local figure, the rest at `last_price`.
fn trade_pnl(pos: &Position, realized: &[f64], last_price: f64) -> f64 {
    let expected = if pos.partial_filled { 2 } else { 1 };
    if realized.len() >= expected {
        return realized.iter().sum();
    }
    let booked = if realized.is_empty() { pos.partial_pnl } else { realized.iter().sum() };
    let exit = if last_price > 0.0 { last_price } else { pos.entry_price };
    let remainder = pos.unrealized_pnl(exit);
    log::warn!(
        "[{}] {} of {} realized PnL records found, estimating the remainder {:+.2} at {:.4}",
        pos.symbol, realized.len(), expected, remainder, exit
    );
    booked + remainder
}

fn tp1_reached(pos: &Position, price: f64) -> bool {
    if pos.take_profit_1 <= 0.0 {
        return false;
    }
    match pos.side {
        Side::Long => price >= pos.take_profit_1,
        Side::Short => price <= pos.take_profit_1,
    }
}

/// Next trailing stop, only when it tightens the current one.
fn trailing_candidate(pos: &Position, price: f64) -> Option<f64> {
    if pos.atr <= 0.0 {
        return None;
    }
    let distance = pos.atr * TRAILING_ATR_MULT;
    match pos.side {
        Side::Long => {
            let sl = round_price(price - distance);
            (sl > pos.stop_loss).then_some(sl)
        }
        Side::Short => {
            let sl = round_price(price + distance);
            (pos.stop_loss <= 0.0 || sl < pos.stop_loss).then_some(sl)
        }
    }
}

/// Classifies the close from the first closing execution at or after entry.
/// Falls back to the PnL sign when nothing conclusive is found.
pub fn detect_exit_type(
    executions: Result<Vec<Execution>, ExchangeError>,
    entry_ms: i64,
    pnl: f64,
) -> ExitType {
    match executions {
        Ok(list) => {
            for ex in list.iter().filter(|e| e.exec_time_ms >= entry_ms && e.closed_size > 0.0) {
                match ex.stop_order_type.as_str() {
                    "StopLoss" | "Stop" => return ExitType::StopLoss,
                    "TakeProfit" | "PartialTakeProfit" => return ExitType::TakeProfit,
                    "" if ex.order_type == "Market" => return ExitType::Manual,
                    _ => {}
                }
            }
        }
        Err(e) => log::error!("Error detecting exit type: {}", e),
    }
    if pnl > 0.0 {
        ExitType::TakeProfit
    } else {
        ExitType::StopLoss
    }
}

fn orphan_to_position(info: &ExchangePosition, now: DateTime<Utc>) -> Position {
    let opened = Utc.timestamp_opt(info.created_time, 0).single().unwrap_or(now);
    log::info!(
        "[{}] Imported {} @ {:.4} | sl={:.4} tp={:.4} qty={} | opened {}",
        info.symbol, info.side, info.avg_price, info.stop_loss, info.take_profit, info.size,
        opened.to_rfc3339()
    );
    Position {
        order_id: "orphan_reconciled".into(),
        symbol: info.symbol.clone(),
        side: info.side,
        qty: info.size,
        original_qty: info.size,
        entry_price: info.avg_price,
        stop_loss: info.stop_loss,
        take_profit_1: info.take_profit,
        take_profit_2: info.take_profit,
        confidence: 0,
        risk_reward_ratio: 0.0,
        reasoning: "Orphan reconciled from exchange".into(),
        // Adoption time, so max-hold never force-closes a foreign position on sight.
        entry_timestamp: now,
        atr: 0.0,
        partial_filled: false,
        breakeven_activated: false,
        trailing_activated: false,
        partial_pnl: 0.0,
    }
}

fn round_price(p: f64) -> f64 {
    (p * 1e4).round() / 1e4
}
