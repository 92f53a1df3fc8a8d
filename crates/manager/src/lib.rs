//! Fleet supervisor : owns every account's bot instance,
//! serializes lifecycle transitions with a single lock, and resolves
//! broker credentials per account without cross-contaminating them.

pub mod account;
pub mod factory;
pub mod manager;

pub use account::{Account, AccountStore, InMemoryAccountStore};
pub use factory::BrokerFactory;
pub use manager::{FleetResult, Manager, ManagerError};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{news_filter_config::NewsFilterRow, position_supervisor_config::SmartExitRow};
    use async_trait::async_trait;
    use bot::{AnalysisMode, CredentialBundle};
    use broker_trait::*;
    use chrono::Utc;
    use futures_util::stream::BoxStream;
    use news_blackout::{CalendarFeed, Event, NewsBlackoutOracle};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct StubBroker;

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
                bid: dec!(1.08000),
                ask: dec!(1.08010),
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
        async fn cancel_order(&self, _order_id: &str) -> bool {
            false
        }
        async fn get_order(&self, _order_id: &str) -> BrokerResult<Option<OrderResult>> {
            Ok(None)
        }
        async fn open_orders(&self, _symbol: Option<&str>) -> BrokerResult<Vec<OrderResult>> {
            Ok(vec![])
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

    struct StubFactory;

    #[async_trait]
    impl BrokerFactory for StubFactory {
        async fn build(&self, _account: &Account) -> anyhow::Result<Arc<dyn BrokerAdapter>> {
            Ok(Arc::new(StubBroker))
        }
    }

    struct StubFeed;

    #[async_trait]
    impl CalendarFeed for StubFeed {
        async fn fetch_events(&self) -> anyhow::Result<Vec<Event>> {
            Ok(vec![])
        }
    }

    fn account(id: &str, enabled: bool) -> Account {
        Account {
            id: id.to_string(),
            name: id.to_string(),
            broker_type: "oanda".to_string(),
            enabled,
            platform_id: None,
            credentials: CredentialBundle::default(),
            watch_list: vec!["EUR_USD".to_string()],
            analysis_mode: AnalysisMode::Quick,
            interval_seconds: 60,
            min_confidence: dec!(70),
            min_models_agree: 1,
            min_confluence: dec!(0),
            enabled_models: vec!["mock".to_string()],
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
            smart_exit: SmartExitRow {
                enabled: true,
                min_rr: dec!(1),
                drawdown_percent: dec!(45),
            },
            news_filter: NewsFilterRow {
                enabled: true,
                filter_high_impact: true,
                filter_medium_impact: true,
                filter_low_impact: false,
                minutes_before: 30,
                minutes_after: 30,
            },
            connected: false,
            last_connected_at: None,
            heartbeat_interval_cycles: None,
        }
    }

    fn make_manager() -> (Arc<Manager>, Arc<InMemoryAccountStore>) {
        let store = Arc::new(InMemoryAccountStore::new());
        store.insert(account("a1", true));
        store.insert(account("a2", false));
        let oracle: Arc<dyn ai_oracle::AiOracle> =
        Arc::new(ai_oracle::MockOracle::new(vec!["mock".to_string()]));
        let news = Arc::new(NewsBlackoutOracle::new(Box::new(StubFeed)));
        let notifications = Arc::new(notification::NullSink);
        let manager = Arc::new(Manager::new(
            store.clone(),
            Arc::new(StubFactory),
            oracle,
            news,
            notifications,
        ));
        (manager, store)
    }

    #[tokio::test]
    async fn starting_an_unknown_account_fails() {
        let (manager, _store) = make_manager();
        let err = manager.start("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn start_creates_a_bot_lazily_and_stop_leaves_it_in_place() {
        let (manager, _store) = make_manager();
        manager.start("a1").await.unwrap();
        assert!(manager.bot("a1").is_some());
        manager.stop("a1").await.unwrap();
        // Stop doesn't destroy the instance, only stops its loop.
        assert!(manager.bot("a1").is_some());
    }

    #[tokio::test]
    async fn start_all_enabled_only_starts_enabled_accounts() {
        let (manager, _store) = make_manager();
        let result = manager.start_all_enabled().await;
        assert_eq!(result.succeeded, vec!["a1".to_string()]);
        assert!(result.failed.is_empty());
        assert!(manager.bot("a2").is_none());
    }

    #[tokio::test]
    async fn ensure_broker_connection_never_requires_a_running_bot() {
        let (manager, _store) = make_manager();
        let broker = manager.ensure_broker_connection("a1").await.unwrap();
        assert!(manager.bot("a1").is_none());
        let info = broker.account_info().await.unwrap();
        assert_eq!(info.balance, dec!(10000));
    }

    #[tokio::test]
    async fn stop_all_reports_failures_for_accounts_without_a_bot() {
        let (manager, _store) = make_manager();
        manager.start("a1").await.unwrap();
        let result = manager.stop_all().await;
        assert_eq!(result.succeeded, vec!["a1".to_string()]);
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn starting_an_already_running_account_surfaces_already_running() {
        let (manager, _store) = make_manager();
        manager.start("a1").await.unwrap();
        let err = manager.start("a1").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(id) if id == "a1"));
    }

    #[tokio::test]
    async fn stopping_an_already_stopped_account_surfaces_already_stopped() {
        let (manager, _store) = make_manager();
        manager.start("a1").await.unwrap();
        manager.stop("a1").await.unwrap();
        let err = manager.stop("a1").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyStopped(id) if id == "a1"));
    }
}
