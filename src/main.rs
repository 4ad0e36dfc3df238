mod bybit_api;
mod config;
mod data_collector;
mod exchange;
mod gemini_analyzer;
mod indicators;
mod order_executor;
mod position_monitor;
mod risk_validator;
mod telegram;
mod trading_state;
mod types;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use bybit_api::BybitClient;
use config::{
    BotConfig, ANALYSIS_INTERVAL_SECS, LOOP_ERROR_COOLDOWN_SECS, MIN_LOOP_SLEEP_SECS,
    MONITOR_INTERVAL_SECS,
};
use data_collector::DataCollector;
use exchange::{equity_or_account_size, Exchange, ExchangeError, MarketData};
use gemini_analyzer::{DecisionProvider, GeminiAnalyzer};
use order_executor::OrderExecutor;
use position_monitor::PositionMonitor;
use risk_validator::RiskValidator;
use telegram::{DailyStats, Notifier, TelegramBot};
use trading_state::TradingState;
use types::{Decision, Side, TradeSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BotConfig::from_env()?;

    let bybit = Arc::new(BybitClient::new(
        config.bybit_rest_url(),
        config.bybit_api_key.clone(),
        config.bybit_api_secret.clone(),
    )?);
    let tg: Arc<dyn Notifier> =
        Arc::new(TelegramBot::new(config.telegram_token.clone(), config.telegram_chat_id.clone()));
    let analyzer = Arc::new(GeminiAnalyzer::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        &config.gemini_base_url,
    )?);
    let state = TradingState::load_from_file(Path::new(&config.state_file));

    let mut bot = TradingBot::new(bybit.clone(), bybit, tg.clone(), analyzer, state, config.symbols.clone());

    let balance = equity_or_account_size(bot.exchange.as_ref()).await;
    log::info!("Gemini Trader starting");
    log::info!("Symbols: {}", config.symbols.join(", "));
    log::info!("Balance: ${:.2}", balance);
    log::info!(
        "Mode: {} | model: {}",
        if config.bybit_testnet { "TESTNET" } else { "LIVE" },
        config.gemini_model
    );
    log::info!("Analysis every {}s, monitor every {}s", ANALYSIS_INTERVAL_SECS, MONITOR_INTERVAL_SECS);
    log::info!(
        "State: total_pnl={:+.2} trades_today={} open_positions={}",
        bot.state.total_pnl,
        bot.state.trades_today,
        bot.state.open_positions.len()
    );
    tg.notify_startup(balance, config.bybit_testnet, &config.symbols).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("Shutdown signal received, finishing current iteration…");
        let _ = shutdown_tx.send(true);
    });

    bot.run(shutdown_rx).await;
    bot.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable ({}), listening for Ctrl-C only", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── Bot ───────────────────────────────────────────────────────────────────────

/// Single owner of the trading state. Monitoring and analysis run on the same
/// loop, so no lock ever guards `state`.
struct TradingBot {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    collector: DataCollector,
    analyzer: Arc<dyn DecisionProvider>,
    risk: RiskValidator,
    executor: OrderExecutor,
    monitor: PositionMonitor,
    state: TradingState,
    symbols: Vec<String>,
    last_monitor: Option<Instant>,
    last_analysis: Option<Instant>,
    last_summary: Option<NaiveDate>,
}

impl TradingBot {
    fn new(
        exchange: Arc<dyn Exchange>,
        market: Arc<dyn MarketData>,
        notifier: Arc<dyn Notifier>,
        analyzer: Arc<dyn DecisionProvider>,
        state: TradingState,
        symbols: Vec<String>,
    ) -> Self {
        let risk = RiskValidator::default();
        TradingBot {
            executor: OrderExecutor::new(exchange.clone(), notifier.clone(), risk.clone()),
            monitor: PositionMonitor::new(exchange.clone(), notifier.clone()),
            collector: DataCollector::new(market),
            exchange,
            notifier,
            analyzer,
            risk,
            state,
            symbols,
            last_monitor: None,
            last_analysis: None,
            last_summary: None,
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let monitor_every = Duration::from_secs(MONITOR_INTERVAL_SECS);
        let analysis_every = Duration::from_secs(ANALYSIS_INTERVAL_SECS);
        let mut iteration: u64 = 0;

        while !*shutdown.borrow() {
            iteration += 1;
            let started = Instant::now();

            let pause = match self.tick(iteration).await {
                Ok(()) => {
                    let next_monitor = monitor_every.saturating_sub(started.elapsed());
                    let next_analysis = self
                        .last_analysis
                        .map(|t| analysis_every.saturating_sub(t.elapsed()))
                        .unwrap_or(Duration::ZERO);
                    next_monitor.min(next_analysis).max(Duration::from_secs(MIN_LOOP_SLEEP_SECS))
                }
                Err(e) => {
                    log::error!("Main loop error: {}", e);
                    let text: String = format!("Main loop error: {}", e).chars().take(200).collect();
                    self.notifier.notify_error(&text).await;
                    self.state.persist();
                    Duration::from_secs(LOOP_ERROR_COOLDOWN_SECS)
                }
            };
            sleep_or_shutdown(&mut shutdown, pause).await;
        }
    }

    /// One loop iteration: whatever is due, then a state save.
    async fn tick(&mut self, iteration: u64) -> Result<(), ExchangeError> {
        let monitor_due = is_due(self.last_monitor, Duration::from_secs(MONITOR_INTERVAL_SECS));
        let analysis_due = is_due(self.last_analysis, Duration::from_secs(ANALYSIS_INTERVAL_SECS));

        if monitor_due {
            self.last_monitor = Some(Instant::now());
            self.monitor.check_positions(&mut self.state).await;
        }

        self.send_daily_summary_at(Utc::now()).await;

        if analysis_due {
            self.last_analysis = Some(Instant::now());
            log::info!("--- Analysis cycle #{} ---", iteration);
            self.run_analysis_cycle().await?;
        }

        self.state.persist();
        Ok(())
    }

    async fn run_analysis_cycle(&mut self) -> Result<(), ExchangeError> {
        self.state.reset_daily_if_needed();

        if let Some(p) = self.state.open_positions.first() {
            log::info!("Position open ({} {}), skipping analysis", p.symbol, p.side);
            return Ok(());
        }
        let exchange_positions = self.exchange.open_positions().await?;
        if let Some(p) = exchange_positions.iter().find(|p| p.size > 0.0) {
            log::info!("Exchange has open position ({}), skipping analysis", p.symbol);
            return Ok(());
        }

        let balance = equity_or_account_size(self.exchange.as_ref()).await;
        for symbol in self.symbols.clone() {
            // Account-level gates first, before paying for a model call.
            let probe = probe_signal(&symbol);
            if let Err(rejection) =
                self.risk.validate_trade(&mut self.state, &probe, balance, &exchange_positions)
            {
                if !rejection.check.is_signal_specific() {
                    log::info!("[{}] Cannot trade: {}", symbol, rejection.reason);
                    continue;
                }
            }

            let snapshot = self.collector.collect(&symbol).await;
            let decision = match self.analyzer.decide(&snapshot).await {
                Ok(d) => d,
                Err(e) => {
                    log::info!("[{}] No decision this cycle: {}", symbol, e);
                    continue;
                }
            };

            let mut signal = match decision {
                Decision::Hold { confidence, .. } => {
                    log::info!("[{}] HOLD (confidence={})", symbol, confidence);
                    continue;
                }
                Decision::Trade(signal) => signal,
            };
            let min_confidence = self.risk.limits().min_confidence;
            if signal.confidence < min_confidence {
                log::info!(
                    "[{}] Confidence {} < {}, skipping",
                    symbol, signal.confidence, min_confidence
                );
                continue;
            }

            signal.atr = snapshot.atr_4h();
            log::info!(
                "[{}] Signal: {} | confidence {}/10 | RR {:.2} | ATR(4H) {}",
                symbol, signal.side, signal.confidence, signal.effective_rr(), signal.atr
            );
            let outcome = self.executor.execute_trade(&mut self.state, signal).await;
            if outcome.is_opened() {
                break;
            }
        }
        Ok(())
    }

    /// Once per UTC day, in the first five minutes after midnight.
    async fn send_daily_summary_at(&mut self, now: DateTime<Utc>) {
        if !summary_due(now, self.last_summary) {
            return;
        }
        self.last_summary = Some(now.date_naive());

        let balance = equity_or_account_size(self.exchange.as_ref()).await;
        let stats = DailyStats {
            trades_today: self.state.trades_today,
            wins: self.state.wins_today,
            losses: self.state.losses_today,
            daily_pnl: self.state.daily_pnl,
            total_pnl: self.state.total_pnl,
            balance,
            drawdown_pct: self.risk.drawdown_pct(&mut self.state, balance),
            trading_days: self.state.trading_days_count(),
            open_positions: self.state.open_positions.len(),
        };
        self.notifier.notify_daily_summary(&stats).await;
    }

    async fn shutdown(&mut self) {
        log::info!("Shutting down...");
        self.state.persist();
        self.notifier.notify_shutdown().await;
        log::info!("Bot stopped.");
    }
}

fn is_due(last: Option<Instant>, every: Duration) -> bool {
    last.map_or(true, |t| t.elapsed() >= every)
}

fn summary_due(now: DateTime<Utc>, last_sent: Option<NaiveDate>) -> bool {
    now.hour() == 0 && now.minute() < 5 && last_sent != Some(now.date_naive())
}

/// Best-case proposal: passes every signal check, so any rejection it
/// gets is account-level.
fn probe_signal(symbol: &str) -> TradeSignal {
    TradeSignal {
        symbol: symbol.to_string(),
        side: Side::Long,
        confidence: 10,
        entry_price: 100.0,
        stop_loss: 99.0,
        take_profit_1: 110.0,
        take_profit_2: 0.0,
        risk_reward_ratio: 10.0,
        reasoning: "probe".into(),
        atr: 0.0,
    }
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        changed = shutdown.changed() => {
            // Sender gone: keep the cadence instead of spinning.
            if changed.is_err() {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::data_collector::MarketSnapshot;
    use crate::gemini_analyzer::DecisionError;
    use crate::testing::{MockExchange, OrderCall, RecordingNotifier};
    use crate::types::{Candle, Position};

    struct ScriptedProvider {
        reply: Result<Decision, DecisionError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(reply: Result<Decision, DecisionError>) -> Arc<Self> {
            Arc::new(ScriptedProvider { reply, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DecisionProvider for ScriptedProvider {
        async fn decide(&self, _snapshot: &MarketSnapshot) -> Result<Decision, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn long_signal(confidence: u8) -> TradeSignal {
        TradeSignal {
            symbol: "SOLUSDT".into(),
            side: Side::Long,
            confidence,
            entry_price: 170.0,
            stop_loss: 168.0,
            take_profit_1: 174.0,
            take_profit_2: 178.0,
            risk_reward_ratio: 2.0,
            reasoning: "trend + vwap".into(),
            atr: 0.0,
        }
    }

    fn bot_with(
        reply: Result<Decision, DecisionError>,
    ) -> (TradingBot, Arc<MockExchange>, Arc<ScriptedProvider>, Arc<RecordingNotifier>) {
        let exchange = Arc::new(MockExchange::new("SOLUSDT", 170.0));
        let notifier = Arc::new(RecordingNotifier::default());
        let provider = ScriptedProvider::new(reply);
        let mut bot = TradingBot::new(
            exchange.clone(),
            exchange.clone(),
            notifier.clone(),
            provider.clone(),
            TradingState::new(),
            vec!["SOLUSDT".into()],
        );
        bot.collector = DataCollector::new(exchange.clone()).with_fear_greed_url("http://127.0.0.1:9/fng");
        bot.executor.sl_verify_timeout = Duration::from_millis(30);
        bot.executor.sl_verify_poll = Duration::from_millis(5);
        (bot, exchange, provider, notifier)
    }

    fn entries(exchange: &MockExchange) -> usize {
        exchange.calls().iter().filter(|c| matches!(c, OrderCall::Entry { .. })).count()
    }

    #[tokio::test]
    async fn trade_decision_is_executed_with_snapshot_atr() {
        let (mut bot, exchange, provider, notifier) = bot_with(Ok(Decision::Trade(long_signal(8))));
        let candles: Vec<Candle> = (0..60)
            .map(|i| Candle {
                timestamp: 1_700_000_000_000 + i * 14_400_000,
                open: 170.0,
                high: 171.0,
                low: 169.0,
                close: 170.0,
                volume: 100.0,
            })
            .collect();
        exchange.with(|s| {
            s.klines.insert("SOLUSDT:240".into(), candles);
        });

        bot.run_analysis_cycle().await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(entries(&exchange), 1);
        assert_eq!(bot.state.open_positions.len(), 1);
        assert_eq!(bot.state.open_positions[0].atr, 2.0);
        assert!(notifier.any_contains("New entry"));
    }

    #[tokio::test]
    async fn local_position_skips_the_cycle() {
        let (mut bot, exchange, provider, _n) = bot_with(Ok(Decision::Trade(long_signal(8))));
        bot.state.add_position(Position {
            symbol: "SOLUSDT".into(),
            side: Side::Long,
            qty: 10.0,
            original_qty: 10.0,
            entry_price: 170.0,
            ..Position::default()
        });

        bot.run_analysis_cycle().await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(entries(&exchange), 0);
    }

    #[tokio::test]
    async fn exchange_position_skips_the_cycle() {
        let (mut bot, exchange, provider, _n) = bot_with(Ok(Decision::Trade(long_signal(8))));
        exchange.add_position("ETHUSDT", Side::Short, 1.0, 3000.0);

        bot.run_analysis_cycle().await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(entries(&exchange), 0);
    }

    #[tokio::test]
    async fn failed_position_query_is_a_loop_error() {
        let (mut bot, exchange, provider, _n) = bot_with(Ok(Decision::Trade(long_signal(8))));
        exchange.with(|s| s.fail_positions = true);

        assert!(bot.run_analysis_cycle().await.is_err());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn account_level_block_saves_the_model_call() {
        let (mut bot, exchange, provider, _n) = bot_with(Ok(Decision::Trade(long_signal(8))));
        bot.state.daily_pnl = -300.0;

        bot.run_analysis_cycle().await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(entries(&exchange), 0);
    }

    #[tokio::test]
    async fn hold_and_low_confidence_do_not_trade() {
        let hold = Decision::Hold { confidence: 4, reasoning: "chop".into() };
        let (mut bot, exchange, provider, _n) = bot_with(Ok(hold));
        bot.run_analysis_cycle().await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(entries(&exchange), 0);

        let (mut bot, exchange, provider, notifier) = bot_with(Ok(Decision::Trade(long_signal(6))));
        bot.run_analysis_cycle().await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(entries(&exchange), 0);
        // Skipped before the executor, so no rejection alert either.
        assert!(!notifier.any_contains("Trade rejected"));
    }

    #[tokio::test]
    async fn provider_failure_abstains() {
        let (mut bot, exchange, provider, _n) = bot_with(Err(DecisionError::MissingField("action")));
        bot.run_analysis_cycle().await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(entries(&exchange), 0);
        assert!(bot.state.open_positions.is_empty());
    }

    #[test]
    fn summary_window_is_first_five_minutes_once_per_day() {
        let at = |h, m| Utc.with_ymd_and_hms(2025, 3, 2, h, m, 0).unwrap();
        let today = at(0, 0).date_naive();
        let yesterday = today.pred_opt().unwrap();

        assert!(summary_due(at(0, 0), None));
        assert!(summary_due(at(0, 4), Some(yesterday)));
        assert!(!summary_due(at(0, 5), Some(yesterday)));
        assert!(!summary_due(at(12, 0), None));
        assert!(!summary_due(at(0, 2), Some(today)));
    }

    #[tokio::test]
    async fn daily_summary_sent_once() {
        let (mut bot, _e, _p, notifier) = bot_with(Ok(Decision::Hold { confidence: 1, reasoning: String::new() }));
        let midnight = Utc.with_ymd_and_hms(2025, 3, 2, 0, 1, 0).unwrap();

        bot.send_daily_summary_at(midnight).await;
        bot.send_daily_summary_at(midnight + chrono::Duration::minutes(2)).await;

        assert_eq!(notifier.messages().len(), 1);
        assert_eq!(bot.last_summary, Some(midnight.date_naive()));
    }

    #[test]
    fn probe_passes_every_signal_check() {
        let risk = RiskValidator::default();
        let probe = probe_signal("SOLUSDT");
        assert!(risk.check_confidence(&probe).is_ok());
        assert!(risk.check_stop_loss(&probe).is_ok());
        assert!(risk.check_tp_placement(&probe).is_ok());
        assert!(risk.check_entry_price(&probe).is_ok());
        assert!(risk.check_rr_ratio(&probe).is_ok());
    }

    #[test]
    fn cadence_bookkeeping() {
        assert!(is_due(None, Duration::from_secs(30)));
        assert!(!is_due(Some(Instant::now()), Duration::from_secs(30)));
    }
}
