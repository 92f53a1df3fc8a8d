use crate::config::BotConfig;
use crate::state::{BotState, LifecycleStatus, LogKind, StatusSnapshot};
use ai_oracle::AiOracle;
use broker_trait::{BrokerAdapter, Direction, Timeframe};
use consensus::{should_enter, timeframe_alignment, ConsensusResult, Opinion, Signal};
use instrument_identity::{pip_size, PriceGuard};
use news_blackout::NewsBlackoutOracle;
use notification::NotificationSink;
use order_pipeline::{AccountSnapshot, ExposureState, PipelineConfig, PipelineOutcome, TradeProposal};
use risk_evaluator::RiskEvaluator;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// One tick's worth of sleep, inserted between symbols to avoid bursting
/// the oracle/broker in the same instant.
const ANTI_BURST_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
const TRADING_HOURS_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(60);
const DAILY_LIMIT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("bot is already running")]
    AlreadyRunning,
    #[error("bot is already stopped")]
    AlreadyStopped,
    #[error("bot is not running")]
    NotRunning,
    #[error("bot is not paused")]
    NotPaused,
    #[error("cannot start a bot in the error state without reset()")]
    InErrorState,
}

/// Everything a single account's bot needs to run one analysis tick:
/// broker, oracle, news calendar, and the stateless evaluators. Owned by
/// the manager, one instance per account.
pub struct Bot {
    pub account_id: String,
    config: Mutex<BotConfig>,
    state: Mutex<BotState>,
    broker: Arc<dyn BrokerAdapter>,
    oracle: Arc<dyn AiOracle>,
    news: Arc<NewsBlackoutOracle>,
    notifications: Arc<dyn NotificationSink>,
    risk: RiskEvaluator,
    price_guard: PriceGuard,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Bot {
    pub fn new(
        account_id: impl Into<String>,
        config: BotConfig,
        broker: Arc<dyn BrokerAdapter>,
        oracle: Arc<dyn AiOracle>,
        news: Arc<NewsBlackoutOracle>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            account_id: account_id.into(),
            config: Mutex::new(config),
            state: Mutex::new(BotState::default()),
            broker,
            oracle,
            news,
            notifications,
            risk: RiskEvaluator::new(),
            price_guard: PriceGuard::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn open_positions(&self) -> Vec<position_supervisor::TradeRecord> {
        self.state.lock().await.open_trades.clone()
    }

    pub async fn logs(&self, limit: usize) -> Vec<crate::state::LogEntry> {
        self.state.lock().await.logs.last(limit)
    }

    pub fn broker(&self) -> Arc<dyn BrokerAdapter> {
        self.broker.clone()
    }

    /// Transitions `Stopped|Error → Starting → Running` and spawns the
    /// cooperative loop. A bot already `Running`/`Paused`/`Starting` rejects
    /// the call with `AlreadyRunning` rather than silently no-opping.
    ///
    /// Connects the broker and, once connected, cancels any broker-side
    /// open order not backed by a locally-tracked trade. This cleanup runs
    /// once per successful start(), never on resume() of an already-running
    /// loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.lock().await;
            match state.status {
                LifecycleStatus::Running | LifecycleStatus::Paused | LifecycleStatus::Starting => {
                    return Err(LifecycleError::AlreadyRunning);
                }
                LifecycleStatus::Stopped | LifecycleStatus::Error => {
                    state.status = LifecycleStatus::Starting;
                    state.manually_halted = false;
                    state.started_at = Some(chrono::Utc::now());
                    state.cycles_completed = 0;
                    state.log(LogKind::Info, None, "bot starting");
                }
            }
        }
        let _ = self.shutdown_tx.send(false);

        match self.broker.connect().await {
            Ok(()) => self.cancel_stale_orders().await,
            Err(err) => {
                self.state
                    .lock()
                    .await
                    .log_error(None, format!("broker connect failed: {err}"));
            }
        }

        self.state.lock().await.status = LifecycleStatus::Running;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_loop().await;
        });
        Ok(())
    }

    /// Cancels broker-side open orders that have no matching locally-tracked
    /// trade. Called once from `start()` after a successful `connect()`;
    /// never called from `resume()` or the run loop.
    async fn cancel_stale_orders(&self) {
        let open_orders = match self.broker.open_orders(None).await {
            Ok(orders) => orders,
            Err(err) => {
                self.state
                    .lock()
                    .await
                    .log_error(None, format!("could not list open orders for stale cleanup: {err}"));
                return;
            }
        };
        if open_orders.is_empty() {
            return;
        }

        let tracked: HashSet<String> = {
            let state = self.state.lock().await;
            state.open_trades.iter().map(|t| t.id.clone()).collect()
        };

        for order in open_orders {
            let Some(order_id) = order.order_id else { continue };
            if tracked.contains(&order_id) {
                continue;
            }
            if self.broker.cancel_order(&order_id).await {
                self.state.lock().await.log(
                    LogKind::Info,
                    None,
                    format!("cancelled stale broker order {order_id} on startup"),
                );
            }
        }
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        if state.status == LifecycleStatus::Stopped {
            return Err(LifecycleError::AlreadyStopped);
        }
        state.status = LifecycleStatus::Stopped;
        state.log(LogKind::Info, None, "bot stopping");
        drop(state);
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        if state.status != LifecycleStatus::Running {
            return Err(LifecycleError::NotRunning);
        }
        state.status = LifecycleStatus::Paused;
        state.log(LogKind::Info, None, "bot paused");
        Ok(())
    }

    /// Resumes to `Running` without resetting today's counters or restarting
    /// the loop — a paused bot's loop is still alive, just gated. Never
    /// re-runs the startup stale-order cleanup; that is start()'s job alone.
    pub async fn resume(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        if state.status != LifecycleStatus::Paused {
            return Err(LifecycleError::NotPaused);
        }
        state.status = LifecycleStatus::Running;
        state.log(LogKind::Info, None, "bot resumed");
        Ok(())
    }

    /// Clears today's counters and the error sink, returning to `Stopped`.
    pub async fn reset(&self) -> Result<(), LifecycleError> {
        let _ = self.shutdown_tx.send(true);
        let mut state = self.state.lock().await;
        *state = BotState::default();
        Ok(())
    }

    /// Applies a new config immediately; if the bot is paused, the new
    /// settings take effect on the next tick after `resume()` without a
    /// restart.
    pub async fn configure(&self, config: BotConfig) -> Result<(), crate::config::ConfigError> {
        config.validate()?;
        *self.config.lock().await = config;
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let paused = { self.state.lock().await.status == LifecycleStatus::Paused };
            if paused {
                if sleep_or_shutdown(&mut shutdown_rx, TRADING_HOURS_RETRY_DELAY).await {
                    return;
                }
                continue;
            }

            let cfg = self.config.lock().await.clone();
            let now = chrono::Utc::now();
            if !cfg.is_within_trading_hours(now) {
                if sleep_or_shutdown(&mut shutdown_rx, TRADING_HOURS_RETRY_DELAY).await {
                    return;
                }
                continue;
            }

            let breaker = {
                let state = self.state.lock().await;
                self.risk.check_circuit_breakers(
                    &cfg.risk_config(),
                    state.today.to_daily_counters(state.manually_halted),
                )
            };
            if !breaker.can_trade {
                self.state.lock().await.log(
                    LogKind::Info,
                    None,
                    format!(
                        "daily limits reached, sleeping: {}",
                        breaker.reason.unwrap_or_default()
                    ),
                );
                if sleep_or_shutdown(&mut shutdown_rx, DAILY_LIMIT_RETRY_DELAY).await {
                    return;
                }
                continue;
            }

            if let Err(err) = self.tick(&cfg).await {
                let mut state = self.state.lock().await;
                state.log_error(None, format!("tick failed: {err}"));
            }

            if sleep_or_shutdown(
                &mut shutdown_rx,
                std::time::Duration::from_secs(cfg.interval_seconds),
            )
                .await
            {
                return;
            }
        }
    }

    /// One full analysis tick: manage open positions, refresh the news
    /// calendar if due, then walk the watch list running consensus and,
    /// where it clears every gate, handing off to the order pipeline.
    pub async fn tick(&self, cfg: &BotConfig) -> anyhow::Result<()> {
        self.manage_open_positions(cfg).await;

        if let Err(err) = self.news.refresh_if_due().await {
            tracing::warn!(account = %self.account_id, error = %err, "news calendar refresh failed");
        }

        let account_info = self.broker.account_info().await?;
        let account = AccountSnapshot {
            balance: account_info.balance,
            margin_available: account_info.margin_available,
            leverage: account_info.leverage,
        };

        let exposed: HashSet<String> = {
            let state = self.state.lock().await;
            state.open_trades.iter().map(|t| t.symbol.clone()).collect()
        };
        let exposure = ExposureState {
            local_open: exposed.len(),
            broker_open: exposed.len(),
            broker_pending_market_orders: 0,
            exposed_symbols: exposed,
            max_open_positions: cfg.max_open_positions as usize,
        };

        for symbol in &cfg.watch_list {
            self.run_symbol(cfg, symbol, &account, &exposure).await;
            tokio::time::sleep(ANTI_BURST_DELAY).await;
        }

        self.maybe_send_heartbeat(cfg).await;

        Ok(())
    }

    /// Sends a periodic status notification every `heartbeat_interval_cycles`
    /// completed ticks. Disabled by default; opt in by setting the config
    /// field.
    async fn maybe_send_heartbeat(&self, cfg: &BotConfig) {
        let Some(interval) = cfg.heartbeat_interval_cycles else {
            return;
        };
        if interval == 0 {
            return;
        }

        let (cycles, open_positions, analyses_today) = {
            let mut state = self.state.lock().await;
            state.cycles_completed += 1;
            (state.cycles_completed, state.open_trades.len(), state.today.analyses)
        };

        if cycles % interval != 0 {
            return;
        }

        self.notifications
            .notify(&format!(
                "[{}] heartbeat: {cycles} cycles completed, {open_positions} open positions, {analyses_today} analyses today",
                self.account_id
        ))
            .await;
    }

    async fn manage_open_positions(&self, cfg: &BotConfig) {
        let mut trades = std::mem::take(&mut self.state.lock().await.open_trades);
        let smart_exit = cfg.smart_exit;
        let (closed, events) =
        position_supervisor::supervise(&*self.broker, &mut trades, pip_size, &smart_exit).await;

        let account_balance = self
            .broker
            .account_info()
            .await
            .map(|a| a.balance)
            .unwrap_or(Decimal::from(1));

        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.open_trades = trades;
            for trade in closed {
                state.retire_trade(trade, account_balance);
            }
            for event in events {
                match event {
                    position_supervisor::SupervisionEvent::ReconciledClosed { symbol, profit_loss, .. } => {
                        state.log(LogKind::Trade, Some(symbol), format!("trade closed, pnl={:?}", profit_loss));
                    }
                    position_supervisor::SupervisionEvent::SmartExitClosed { symbol, profit_loss, .. } => {
                        let text = format!("{symbol} closed by smart exit, pnl={:?}", profit_loss);
                        state.log(LogKind::Trade, Some(symbol), text.clone());
                        notifications.push(text);
                    }
                    position_supervisor::SupervisionEvent::BreakEvenPromoted { symbol, new_stop_loss } => {
                        let text = format!("{symbol} moved to break-even, stop={new_stop_loss}");
                        state.log(LogKind::Info, Some(symbol), text.clone());
                        notifications.push(text);
                    }
                    position_supervisor::SupervisionEvent::TrailingStopUpdated { symbol, new_stop_loss } => {
                        state.log(LogKind::Info, Some(symbol), format!("trailing stop moved to {new_stop_loss}"));
                    }
                    position_supervisor::SupervisionEvent::Error { symbol, message } => {
                        state.log_error(Some(symbol), message);
                    }
                }
            }
        }
        for text in notifications {
            self.notifications.notify(&text).await;
        }
    }

    async fn run_symbol(
        &self,
        cfg: &BotConfig,
        symbol: &str,
        account: &AccountSnapshot,
        exposure: &ExposureState,
    ) {
        if let Err(reason) = exposure.allows(symbol) {
            self.skip(symbol, reason).await;
            return;
        }

        let (blocked, event) = self.news.should_avoid_trading(symbol, &cfg.news_filter);
        if blocked {
            let title = event.map(|e| e.title).unwrap_or_default();
            self.state
                .lock()
                .await
                .log(LogKind::News, Some(symbol.to_string()), format!("news blackout: {title}"));
            return;
        }

        let tradability = self.broker.can_trade_symbol(symbol, broker_trait::Side::Buy).await;
        if !tradability.tradable {
            self.skip(symbol, tradability.reason).await;
            return;
        }

        let timeframes = analysis_timeframes(cfg.analysis_mode);
        let decimals = instrument_identity::decimals(symbol);

        let mut per_timeframe_signal = Vec::with_capacity(timeframes.len());
        let mut overall_opinions: Vec<Opinion> = Vec::new();

        for timeframe in &timeframes {
            let opinions = ai_oracle::analyze_all(
                &*self.oracle,
                symbol,
                *timeframe,
                analysis_preset(cfg.analysis_mode),
                &cfg.enabled_models,
                None,
            )
                .await;
            let result = consensus::aggregate(&opinions, &HashMap::new(), decimals);
            per_timeframe_signal.push((*timeframe, result.direction));
            overall_opinions.extend(opinions);
        }

        self.state.lock().await.today.analyses += 1;
        self.state.lock().await.last_analysis_at = Some(chrono::Utc::now());

        let result: ConsensusResult = consensus::aggregate(&overall_opinions, &HashMap::new(), decimals);
        let alignment = if timeframes.len() > 1 {
            timeframe_alignment(result.direction, &per_timeframe_signal)
        } else {
            None
        };

        let eligible = should_enter(
            &result,
            cfg.min_confidence,
            cfg.min_models_agree as usize,
            cfg.enabled_models.len(),
            alignment,
        ) && meets_confluence(&result, cfg.min_confluence);

        if !eligible {
            self.skip(symbol, "consensus did not clear entry criteria").await;
            return;
        }

        let direction = match result.direction {
            Signal::Long => Direction::Long,
            Signal::Short => Direction::Short,
            Signal::Hold => {
                self.skip(symbol, "consensus held").await;
                return;
            }
        };
        let (Some(sl), Some(tp)) = (result.stop_loss, result.take_profit) else {
            self.skip(symbol, "consensus missing stop loss or take profit").await;
            return;
        };

        let proposal = TradeProposal {
            canonical_symbol: symbol.to_string(),
            direction,
            stop_loss: sl,
            take_profit: tp,
            break_even_trigger: result.break_even_trigger,
            trailing_stop_pips: result.trailing_stop_pips,
            confidence: result.mean_confidence.to_string().parse().unwrap_or(0.0),
            timeframes_analyzed: timeframes.len() as u32,
            models_agreed: result.models_agreed as u32,
            total_models: cfg.enabled_models.len() as u32,
        };

        let pipeline_cfg = PipelineConfig {
            min_risk_reward: cfg.min_risk_reward,
            max_risk_reward: cfg.max_risk_reward,
            risk_per_trade_percent: cfg.risk_per_trade_percent,
        };

        let outcome = order_pipeline::pipeline::submit_trade(
            &*self.broker,
            &self.price_guard,
            &self.risk,
            exposure,
            *account,
            &pipeline_cfg,
            proposal,
        )
            .await;

        match outcome {
            PipelineOutcome::Filled(trade) => {
                let mut state = self.state.lock().await;
                state.today.trades += 1;
                state.log(
                    LogKind::Trade,
                    Some(symbol.to_string()),
                    format!("opened {:?} at {}", trade.direction, trade.entry_price),
                );
                state.open_trades.push(*trade);
            }
            PipelineOutcome::Rejected { stage, reason } => {
                self.skip(symbol, format!("{stage}: {reason}")).await;
            }
        }
    }

    async fn skip(&self, symbol: &str, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .log(LogKind::Skip, Some(symbol.to_string()), reason.into());
    }
}

fn meets_confluence(result: &ConsensusResult, min_confluence: Decimal) -> bool {
    if result.total_valid == 0 {
        return false;
    }
    let ratio = Decimal::from(result.models_agreed as i64) * Decimal::from(100)
    / Decimal::from(result.total_valid as i64);
    ratio >= min_confluence
}

fn analysis_timeframes(mode: crate::config::AnalysisMode) -> Vec<Timeframe> {
    use crate::config::AnalysisMode::*;
    match mode {
        Quick => vec![Timeframe::H1],
        Standard => vec![Timeframe::M15, Timeframe::H1],
        Premium => vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
        Ultra => vec![Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1],
    }
}

fn analysis_preset(mode: crate::config::AnalysisMode) -> &'static str {
    use crate::config::AnalysisMode::*;
    match mode {
        Quick => "quick",
        Standard => "standard",
        Premium => "premium",
        Ultra => "ultra",
    }
}

/// Sleeps up to `duration`, waking early and returning `true` if shutdown
/// fires in the meantime; returns `false` if the sleep ran to completion.
async fn sleep_or_shutdown(rx: &mut watch::Receiver<bool>, duration: std::time::Duration) -> bool {
    if *rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = rx.changed() => {
            changed.is_err() || *rx.borrow()
        }
    }
}

