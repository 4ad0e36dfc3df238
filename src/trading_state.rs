use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    ACCOUNT_SIZE, CIRCUIT_BREAKER_LOSSES, CIRCUIT_BREAKER_PAUSE_HOURS, TRADE_HISTORY_CAP,
};
use crate::types::{ExitType, Position, Side, TradeRecord};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("state file rename: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingState {
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub peak_balance: f64,
    pub trades_today: u32,
    pub wins_today: u32,
    pub losses_today: u32,
    pub consecutive_losses: u32,
    pub winning_streak: u32,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    pub last_daily_reset: NaiveDate,
    pub open_positions: Vec<Position>,
    pub trade_history: VecDeque<TradeRecord>,
    pub daily_profit_by_date: BTreeMap<NaiveDate, f64>,
    pub start_date: NaiveDate,
    pub trading_days: BTreeSet<NaiveDate>,
    #[serde(skip)]
    state_file: Option<PathBuf>,
}

impl Default for TradingState {
    fn default() -> Self {
        let today = Utc::now().date_naive();
        TradingState {
            daily_pnl: 0.0,
            total_pnl: 0.0,
            peak_balance: ACCOUNT_SIZE,
            trades_today: 0,
            wins_today: 0,
            losses_today: 0,
            consecutive_losses: 0,
            winning_streak: 0,
            circuit_breaker_until: None,
            last_daily_reset: today,
            open_positions: Vec::new(),
            trade_history: VecDeque::new(),
            daily_profit_by_date: BTreeMap::new(),
            start_date: today,
            trading_days: BTreeSet::new(),
            state_file: None,
        }
    }
}

impl TradingState {
    /// Fresh in-memory state; `persist` is a no-op until a file is bound.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_file(&mut self, path: impl Into<PathBuf>) {
        self.state_file = Some(path.into());
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    // ── Daily reset ──────────────────────────────────────────────────────────

    /// Rolls the daily counters when the UTC date has changed. Idempotent.
    pub fn reset_daily_if_needed(&mut self) -> bool {
        self.reset_daily_if_needed_at(Utc::now().date_naive())
    }

    pub fn reset_daily_if_needed_at(&mut self, today: NaiveDate) -> bool {
        if today == self.last_daily_reset {
            return false;
        }
        let prev = self.last_daily_reset;
        if self.daily_pnl != 0.0 || self.trades_today > 0 {
            *self.daily_profit_by_date.entry(prev).or_insert(0.0) += self.daily_pnl;
        }
        if self.trades_today > 0 {
            self.trading_days.insert(prev);
        }
        log::info!(
            "Daily reset {} → {}: PnL was {:+.2}, trades={}",
            prev, today, self.daily_pnl, self.trades_today
        );
        self.daily_pnl = 0.0;
        self.trades_today = 0;
        self.wins_today = 0;
        self.losses_today = 0;
        self.last_daily_reset = today;
        true
    }

    // ── Trade recording ──────────────────────────────────────────────────────

    /// Records a closed trade. Returns true when the consecutive-loss threshold
    /// is met and the breaker is not already running; the caller activates it.
    pub fn record_trade(&mut self, pnl: f64, symbol: &str, side: Side, exit_type: ExitType) -> bool {
        self.record_trade_at(Utc::now(), pnl, symbol, side, exit_type)
    }

    pub fn record_trade_at(
        &mut self,
        now: DateTime<Utc>,
        pnl: f64,
        symbol: &str,
        side: Side,
        exit_type: ExitType,
    ) -> bool {
        self.reset_daily_if_needed_at(now.date_naive());
        self.daily_pnl += pnl;
        self.total_pnl += pnl;
        self.trades_today += 1;
        self.trading_days.insert(now.date_naive());

        if pnl > 0.0 {
            self.consecutive_losses = 0;
            self.winning_streak += 1;
            self.wins_today += 1;
        } else if pnl < 0.0 {
            self.consecutive_losses += 1;
            self.winning_streak = 0;
            self.losses_today += 1;
        }

        self.trade_history.push_back(TradeRecord {
            timestamp: now,
            symbol: symbol.to_string(),
            side,
            pnl,
            exit_type,
            daily_pnl: self.daily_pnl,
            total_pnl: self.total_pnl,
        });
        while self.trade_history.len() > TRADE_HISTORY_CAP {
            self.trade_history.pop_front();
        }

        self.is_circuit_breaker_triggered() && !self.is_circuit_breaker_active_at(now)
    }

    // ── Circuit breaker ──────────────────────────────────────────────────────

    pub fn is_circuit_breaker_triggered(&self) -> bool {
        self.consecutive_losses >= CIRCUIT_BREAKER_LOSSES
    }

    pub fn activate_circuit_breaker(&mut self) {
        self.activate_circuit_breaker_at(Utc::now());
    }

    pub fn activate_circuit_breaker_at(&mut self, now: DateTime<Utc>) {
        let until = now + Duration::hours(CIRCUIT_BREAKER_PAUSE_HOURS);
        self.circuit_breaker_until = Some(until);
        log::warn!(
            "CIRCUIT BREAKER: {} consecutive losses, pausing until {}",
            self.consecutive_losses,
            until.to_rfc3339()
        );
    }

    /// True while the pause is in the future. An expired pause is cleared here,
    /// never eagerly.
    pub fn is_circuit_breaker_active(&mut self) -> bool {
        self.is_circuit_breaker_active_at(Utc::now())
    }

    pub fn is_circuit_breaker_active_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.circuit_breaker_until {
            None => false,
            Some(until) if now < until => true,
            Some(_) => {
                self.circuit_breaker_until = None;
                log::info!("Circuit breaker expired, resuming trading");
                false
            }
        }
    }

    pub fn circuit_breaker_remaining_hours(&self) -> f64 {
        self.circuit_breaker_remaining_hours_at(Utc::now())
    }

    pub fn circuit_breaker_remaining_hours_at(&self, now: DateTime<Utc>) -> f64 {
        match self.circuit_breaker_until {
            Some(until) => ((until - now).num_seconds() as f64 / 3600.0).max(0.0),
            None => 0.0,
        }
    }

    // ── Profit distribution ──────────────────────────────────────────────────

    /// Today's realized profit (archived + in progress) over lifetime profit.
    /// Zero when either side is not a profit.
    pub fn profit_distribution_ratio(&self) -> f64 {
        self.profit_distribution_ratio_at(self.last_daily_reset)
    }

    pub fn profit_distribution_ratio_at(&self, today: NaiveDate) -> f64 {
        if self.total_pnl <= 0.0 {
            return 0.0;
        }
        let today_profit =
            self.daily_profit_by_date.get(&today).copied().unwrap_or(0.0) + self.daily_pnl;
        if today_profit <= 0.0 {
            return 0.0;
        }
        today_profit / self.total_pnl
    }

    pub fn trading_days_count(&self) -> usize {
        self.trading_days.len()
    }

    // ── Equity high-water mark ───────────────────────────────────────────────

    /// Raises `peak_balance` when `balance` is a new high. Returns true if it moved.
    pub fn update_peak_balance(&mut self, balance: f64) -> bool {
        if balance > self.peak_balance {
            self.peak_balance = balance;
            true
        } else {
            false
        }
    }

    /// Dollar drawdown from the high-water mark (peak updated first).
    pub fn drawdown(&mut self, balance: f64) -> f64 {
        self.update_peak_balance(balance);
        (self.peak_balance - balance).max(0.0)
    }

    // ── Positions ────────────────────────────────────────────────────────────

    pub fn has_open_position(&self) -> bool {
        !self.open_positions.is_empty()
    }

    pub fn add_position(&mut self, position: Position) {
        self.open_positions.push(position);
    }

    pub fn position_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.open_positions.iter_mut().find(|p| p.symbol == symbol)
    }

    pub fn remove_position(&mut self, symbol: &str) -> Option<Position> {
        let idx = self.open_positions.iter().position(|p| p.symbol == symbol)?;
        Some(self.open_positions.remove(idx))
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Writes to the bound file, logging instead of failing.
    pub fn persist(&self) {
        if let Some(path) = &self.state_file {
            if let Err(e) = self.save_to_file(path) {
                log::error!("Error saving state to {}: {}", path.display(), e);
            }
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), StateError> {
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        // Dropping an unpersisted NamedTempFile removes it.
        let mut tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }

    /// Loads state from `path` and binds it for later saves. A missing or
    /// unreadable file yields a fresh state; this never fails.
    pub fn load_from_file(path: &Path) -> Self {
        let mut state = match std::fs::read_to_string(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state file at {}, starting fresh", path.display());
                TradingState::new()
            }
            Err(e) => {
                log::error!("Error reading state {}: {}, starting fresh", path.display(), e);
                TradingState::new()
            }
            Ok(raw) => match serde_json::from_str::<TradingState>(&raw) {
                Ok(mut s) => {
                    s.reset_daily_if_needed();
                    log::info!(
                        "State restored: total_pnl={:+.2}, trades_today={}, open_positions={}",
                        s.total_pnl,
                        s.trades_today,
                        s.open_positions.len()
                    );
                    s
                }
                Err(e) => {
                    log::error!("Corrupt state file {}: {}, starting fresh", path.display(), e);
                    TradingState::new()
                }
            },
        };
        state.bind_file(path);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn state_on(day: DateTime<Utc>) -> TradingState {
        let mut s = TradingState::new();
        s.last_daily_reset = day.date_naive();
        s.start_date = day.date_naive();
        s
    }

    #[test]
    fn three_consecutive_losses_trip_the_breaker() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        assert!(!s.record_trade_at(now, -20.0, "SOLUSDT", Side::Long, ExitType::StopLoss));
        assert!(!s.record_trade_at(now, -20.0, "SOLUSDT", Side::Long, ExitType::StopLoss));
        assert!(s.record_trade_at(now, -20.0, "SOLUSDT", Side::Short, ExitType::StopLoss));
        assert!(s.is_circuit_breaker_triggered());
        assert_eq!(s.losses_today, 3);
        assert_eq!(s.winning_streak, 0);
    }

    #[test]
    fn win_resets_loss_streak_and_zero_pnl_changes_nothing() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        s.record_trade_at(now, -10.0, "SOLUSDT", Side::Long, ExitType::StopLoss);
        s.record_trade_at(now, -10.0, "SOLUSDT", Side::Long, ExitType::StopLoss);
        s.record_trade_at(now, 0.0, "SOLUSDT", Side::Long, ExitType::Manual);
        assert_eq!(s.consecutive_losses, 2);
        assert_eq!(s.trades_today, 3);
        s.record_trade_at(now, 30.0, "SOLUSDT", Side::Long, ExitType::TakeProfit);
        assert_eq!(s.consecutive_losses, 0);
        assert_eq!(s.winning_streak, 1);
        assert!((s.daily_pnl - 10.0).abs() < 1e-9);
        assert_eq!(s.trade_history.back().map(|t| t.total_pnl), Some(10.0));
    }

    #[test]
    fn breaker_expires_lazily_without_manual_reset() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        for _ in 0..3 {
            s.record_trade_at(now, -10.0, "SOLUSDT", Side::Long, ExitType::StopLoss);
        }
        s.activate_circuit_breaker_at(now);
        assert!(s.is_circuit_breaker_active_at(now + Duration::hours(23)));
        assert!(s.circuit_breaker_until.is_some());
        assert!(!s.is_circuit_breaker_active_at(now + Duration::hours(24)));
        assert!(s.circuit_breaker_until.is_none());
    }

    #[test]
    fn fourth_loss_during_pause_is_not_newly_triggered() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        for _ in 0..3 {
            s.record_trade_at(now, -10.0, "SOLUSDT", Side::Long, ExitType::StopLoss);
        }
        s.activate_circuit_breaker_at(now);
        assert!(!s.record_trade_at(now, -10.0, "SOLUSDT", Side::Long, ExitType::StopLoss));
    }

    #[test]
    fn daily_reset_is_idempotent_and_archives_prior_day() {
        let day1 = at(2026, 3, 2, 10);
        let mut s = state_on(day1);
        s.record_trade_at(day1, 42.0, "SOLUSDT", Side::Long, ExitType::TakeProfit);

        assert!(!s.reset_daily_if_needed_at(day1.date_naive()));
        assert_eq!(s.trades_today, 1);

        let day2 = at(2026, 3, 3, 0).date_naive();
        assert!(s.reset_daily_if_needed_at(day2));
        assert_eq!(s.trades_today, 0);
        assert_eq!(s.daily_pnl, 0.0);
        assert_eq!(s.daily_profit_by_date.get(&day1.date_naive()), Some(&42.0));
        assert!(s.trading_days.contains(&day1.date_naive()));

        let snapshot = s.clone();
        assert!(!s.reset_daily_if_needed_at(day2));
        assert_eq!(s, snapshot);
    }

    #[test]
    fn history_is_capped_oldest_first() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        for i in 0..(TRADE_HISTORY_CAP + 5) {
            s.record_trade_at(now, i as f64, "SOLUSDT", Side::Long, ExitType::TakeProfit);
        }
        assert_eq!(s.trade_history.len(), TRADE_HISTORY_CAP);
        assert_eq!(s.trade_history.front().map(|t| t.pnl), Some(5.0));
    }

    #[test]
    fn profit_distribution_ratio_uses_today_share() {
        let now = at(2026, 3, 2, 10);
        let mut s = state_on(now);
        s.total_pnl = 1000.0;
        s.daily_pnl = 250.0;
        assert!((s.profit_distribution_ratio_at(now.date_naive()) - 0.25).abs() < 1e-9);
        s.daily_pnl = -50.0;
        assert_eq!(s.profit_distribution_ratio_at(now.date_naive()), 0.0);
        s.total_pnl = -1.0;
        assert_eq!(s.profit_distribution_ratio_at(now.date_naive()), 0.0);
    }

    #[test]
    fn peak_balance_only_moves_up() {
        let mut s = TradingState::new();
        assert!(s.update_peak_balance(10_200.0));
        assert!(!s.update_peak_balance(10_100.0));
        assert_eq!(s.peak_balance, 10_200.0);
        assert!((s.drawdown(10_000.0) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let now = Utc::now();
        let mut s = TradingState::new();
        s.record_trade_at(now, -12.5, "SOLUSDT", Side::Short, ExitType::StopLoss);
        s.peak_balance = 10_321.0;
        s.winning_streak = 0;
        s.circuit_breaker_until = Some(now + Duration::hours(3));
        s.daily_profit_by_date.insert(now.date_naive() - Duration::days(1), 77.0);
        s.trading_days.insert(now.date_naive() - Duration::days(1));
        s.add_position(Position {
            order_id: "abc".into(),
            symbol: "SOLUSDT".into(),
            side: Side::Short,
            qty: 12.0,
            original_qty: 24.0,
            entry_price: 170.0,
            stop_loss: 170.0,
            take_profit_1: 165.0,
            take_profit_2: 160.0,
            confidence: 8,
            risk_reward_ratio: 2.5,
            reasoning: "test".into(),
            entry_timestamp: now,
            atr: 1.75,
            partial_filled: true,
            breakeven_activated: true,
            trailing_activated: false,
            partial_pnl: 0.0,
        });

        s.save_to_file(&path).unwrap();
        let loaded = TradingState::load_from_file(&path);

        let mut expected = s.clone();
        expected.bind_file(&path);
        assert_eq!(loaded, expected);
        assert_eq!(loaded.state_file(), Some(path.as_path()));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_and_corrupt_files_fall_back_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let s = TradingState::load_from_file(&missing);
        assert_eq!(s.total_pnl, 0.0);
        assert_eq!(s.peak_balance, ACCOUNT_SIZE);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{\"daily_pnl\": 12.0, \"trades_").unwrap();
        let s = TradingState::load_from_file(&corrupt);
        assert_eq!(s.daily_pnl, 0.0);
        assert_eq!(s.state_file(), Some(corrupt.as_path()));
    }

    #[test]
    fn missing_fields_default_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        let today = Utc::now().date_naive();
        std::fs::write(
            &path,
            format!("{{\"total_pnl\": 321.5, \"last_daily_reset\": \"{}\"}}", today),
        )
        .unwrap();
        let s = TradingState::load_from_file(&path);
        assert_eq!(s.total_pnl, 321.5);
        assert_eq!(s.peak_balance, ACCOUNT_SIZE);
        assert!(s.open_positions.is_empty());
        assert!(s.circuit_breaker_until.is_none());
    }

    #[test]
    fn wall_clock_breaker_round_trip() {
        let mut s = TradingState::new();
        assert!(!s.record_trade(-10.0, "SOLUSDT", Side::Long, ExitType::StopLoss));
        assert!(!s.record_trade(-10.0, "SOLUSDT", Side::Long, ExitType::StopLoss));
        assert!(s.record_trade(-10.0, "SOLUSDT", Side::Short, ExitType::StopLoss));

        s.activate_circuit_breaker();
        assert!(s.is_circuit_breaker_active());
        let left = s.circuit_breaker_remaining_hours();
        assert!(left > 23.9 && left <= 24.0);
    }
}
