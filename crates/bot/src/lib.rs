//! Per-account state machine: owns one bot's config, lifecycle, and the
//! main analysis loop that ties the oracle, consensus, news blackout,
//! position supervisor and order pipeline together.

pub mod config;
pub mod machine;
pub mod state;

pub use config::{AnalysisMode, BotConfig, ConfigError, CredentialBundle};
pub use machine::{Bot, LifecycleError};
pub use state::{BotState, LifecycleStatus, LogEntry, LogKind, LogRing, StatusSnapshot, TodayCounters};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::*;
    use chrono::Utc;
    use futures_util::stream::BoxStream;
    use news_blackout::{CalendarFeed, Event, NewsBlackoutOracle};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct StubBroker {
        bid: Decimal,
        ask: Decimal,
        stale_order_ids: Vec<String>,
        cancelled: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BrokerAdapter for StubBroker {
        fn broker_name(&self) -> &str {
            "stub"
        }
        async fn connect(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn account_info(&self) -> BrokerResult<AccountInfo> {
            Ok(AccountInfo {
                balance: dec!(10000),
                equity: dec!(10000),
                margin_used: dec!(0),
                margin_available: dec!(5000),
                unrealized_pnl: dec!(0),
                realized_pnl_today: dec!(0),
                currency: "USD".to_string(),
                leverage: dec!(30),
            })
        }
        async fn instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
            Ok(vec![])
        }
        async fn symbol_spec(&self, _symbol: &str) -> BrokerResult<InstrumentSpec> {
            Ok(InstrumentSpec::default())
        }
        async fn current_price(&self, _symbol: &str) -> BrokerResult<Tick> {
            Ok(Tick {
                bid: self.bid,
                ask: self.ask,
                ts: Utc::now(),
            })
        }
        async fn prices(&self, _symbols: &[String]) -> BrokerResult<HashMap<String, Tick>> {
            Ok(HashMap::new())
        }
        fn stream_prices(&self, _symbols: Vec<String>) -> BoxStream<'static, BrokerResult<Tick>> {
            Box::pin(futures_util::stream::empty())
        }
        async fn candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _count: usize,
            _from: Option<chrono::DateTime<Utc>>,
            _to: Option<chrono::DateTime<Utc>>,
        ) -> BrokerResult<Vec<Candle>> {
            Ok(vec![])
        }
        async fn place_order(&self, _request: OrderRequest) -> OrderResult {
            OrderResult::rejected("stub never fills", RejectKind::Unknown)
        }
        async fn cancel_order(&self, order_id: &str) -> bool {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            true
        }
        async fn get_order(&self, _order_id: &str) -> BrokerResult<Option<OrderResult>> {
            Ok(None)
        }
        async fn open_orders(&self, _symbol: Option<&str>) -> BrokerResult<Vec<OrderResult>> {
            Ok(self
                .stale_order_ids
                .iter()
                .map(|id| OrderResult {
                    order_id: Some(id.clone()),
                    status: OrderStatus::Pending,
                    filled_price: None,
                    filled_volume: None,
                    error_message: None,
                    retcode: None,
                    reject_kind: None,
                })
                    .collect())
        }
        async fn positions(&self) -> BrokerResult<Vec<Position>> {
            Ok(vec![])
        }
        async fn position(&self, _symbol: &str) -> BrokerResult<Option<Position>> {
            Ok(None)
        }
        async fn close_position(&self, _symbol: &str, _size: Option<Decimal>) -> OrderResult {
            OrderResult::rejected("not used", RejectKind::Unknown)
        }
        async fn modify_position(
            &self,
            _symbol: &str,
            _stop_loss: Option<Decimal>,
            _take_profit: Option<Decimal>,
        ) -> BrokerResult<bool> {
            Ok(true)
        }
        async fn can_trade_symbol(&self, symbol: &str, _side: Side) -> Tradability {
            Tradability {
                tradable: true,
                reason: "ok".to_string(),
                resolved_symbol: symbol.to_string(),
            }
        }
        fn is_paper(&self) -> bool {
            true
        }
    }

    struct StubFeed;

    #[async_trait]
    impl CalendarFeed for StubFeed {
        async fn fetch_events(&self) -> anyhow::Result<Vec<Event>> {
            Ok(vec![])
        }
    }

    fn cfg() -> BotConfig {
        BotConfig {
            watch_list: vec!["EUR_USD".to_string()],
            analysis_mode: AnalysisMode::Quick,
            interval_seconds: 60,
            enabled_models: vec!["mock".to_string()],
            min_confidence: dec!(70),
            min_models_agree: 1,
            min_confluence: dec!(0),
            risk_per_trade_percent: dec!(1),
            max_open_positions: 5,
            max_daily_trades: 10,
            max_daily_loss_percent: dec!(5),
            max_consecutive_losses: 4,
            account_drawdown_limit_percent: dec!(15),
            trading_start_hour: 0,
            trading_end_hour: 24,
            trade_on_weekends: true,
            min_risk_reward: dec!(1.5),
            max_risk_reward: dec!(2.2),
            smart_exit: position_supervisor::SmartExitConfig {
                enabled: true,
                min_rr: dec!(1),
                drawdown_percent: dec!(45),
            },
            news_filter: news_blackout::NewsFilterConfig::default(),
            credentials: CredentialBundle::default(),
            heartbeat_interval_cycles: Some(2),
        }
    }

    fn stub_broker() -> StubBroker {
        StubBroker {
            bid: dec!(1.08000),
            ask: dec!(1.08010),
            stale_order_ids: vec![],
            cancelled: Arc::new(std::sync::Mutex::new(vec![])),
        }
    }

    struct CountingSink(std::sync::atomic::AtomicU32);

    #[async_trait]
    impl notification::NotificationSink for CountingSink {
        async fn notify(&self, _text: &str) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn make_bot() -> Arc<Bot> {
        make_bot_with(stub_broker(), Arc::new(notification::NullSink))
    }

    fn make_bot_with(
        broker: StubBroker,
        notifications: Arc<dyn notification::NotificationSink>,
    ) -> Arc<Bot> {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(broker);
        let oracle: Arc<dyn ai_oracle::AiOracle> =
        Arc::new(ai_oracle::MockOracle::new(vec!["mock".to_string()]));
        let news = Arc::new(NewsBlackoutOracle::new(Box::new(StubFeed)));
        Arc::new(Bot::new("acct-1", cfg(), broker, oracle, news, notifications))
    }

    #[tokio::test]
    async fn starting_a_stopped_bot_transitions_to_running() {
        let bot = make_bot();
        bot.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bot.status().await.status, LifecycleStatus::Running);
        bot.stop().await.unwrap();
    }

    #[tokio::test]
    async fn starting_an_already_running_bot_returns_already_running() {
        let bot = make_bot();
        bot.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(bot.start().await, Err(LifecycleError::AlreadyRunning)));
        assert_eq!(bot.status().await.status, LifecycleStatus::Running);
        bot.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopping_an_already_stopped_bot_returns_already_stopped() {
        let bot = make_bot();
        assert!(matches!(bot.stop().await, Err(LifecycleError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn pause_then_resume_preserves_today_counters() {
        let bot = make_bot();
        bot.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bot.tick(&cfg()).await.unwrap();
        let analyses_before = bot.status().await.today.analyses;
        assert!(analyses_before > 0);

        bot.pause().await.unwrap();
        assert_eq!(bot.status().await.status, LifecycleStatus::Paused);
        bot.resume().await.unwrap();
        assert_eq!(bot.status().await.status, LifecycleStatus::Running);
        assert_eq!(bot.status().await.today.analyses, analyses_before);
        bot.stop().await.unwrap();
    }

    #[tokio::test]
    async fn a_tick_with_a_never_filling_broker_only_produces_skips() {
        let bot = make_bot();
        bot.tick(&cfg()).await.unwrap();
        let snapshot = bot.status().await;
        assert!(snapshot.open_positions == 0);
        assert!(!snapshot.recent_logs.is_empty());
    }

    #[tokio::test]
    async fn resetting_clears_error_history_and_counters() {
        let bot = make_bot();
        bot.tick(&cfg()).await.unwrap();
        bot.reset().await.unwrap();
        let snapshot = bot.status().await;
        assert_eq!(snapshot.today.analyses, 0);
        assert_eq!(snapshot.status, LifecycleStatus::Stopped);
    }

    #[tokio::test]
    async fn start_cancels_untracked_broker_orders_once() {
        let cancelled = Arc::new(std::sync::Mutex::new(vec![]));
        let mut broker = stub_broker();
        broker.stale_order_ids = vec!["order-1".to_string(), "order-2".to_string()];
        broker.cancelled = Arc::clone(&cancelled);
        let bot = make_bot_with(broker, Arc::new(notification::NullSink));

        bot.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut ids = cancelled.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, vec!["order-1".to_string(), "order-2".to_string()]);
        bot.stop().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_fires_every_configured_number_of_cycles() {
        let sent = Arc::new(CountingSink(std::sync::atomic::AtomicU32::new(0)));
        let bot = make_bot_with(stub_broker(), sent.clone());

        let mut heartbeat_cfg = cfg();
        heartbeat_cfg.heartbeat_interval_cycles = Some(2);

        bot.tick(&heartbeat_cfg).await.unwrap();
        assert_eq!(sent.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        bot.tick(&heartbeat_cfg).await.unwrap();
        assert_eq!(sent.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        bot.tick(&heartbeat_cfg).await.unwrap();
        assert_eq!(sent.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_disabled_by_default_sends_nothing() {
        let sent = Arc::new(CountingSink(std::sync::atomic::AtomicU32::new(0)));
        let bot = make_bot_with(stub_broker(), sent.clone());

        let mut disabled_cfg = cfg();
        disabled_cfg.heartbeat_interval_cycles = None;
        bot.tick(&disabled_cfg).await.unwrap();
        bot.tick(&disabled_cfg).await.unwrap();
        assert_eq!(sent.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
