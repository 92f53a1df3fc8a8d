//! Validate → normalize → size → submit → adaptive retry. Turns
//! an approved consensus direction into a broker-filled [`TradeRecord`],
//! or a tagged rejection naming the stage that stopped it.

pub mod defaults;
pub mod exposure;
pub mod pipeline;

pub use exposure::ExposureState;
pub use pipeline::{AccountSnapshot, PipelineConfig, PipelineOutcome, TradeProposal};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::*;
    use chrono::Utc;
    use futures_util::stream::BoxStream;
    use instrument_identity::PriceGuard;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use risk_evaluator::RiskEvaluator;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct MockBroker {
        tradable: bool,
        bid: Decimal,
        ask: Decimal,
        spec: InstrumentSpec,
        place_results: Mutex<Vec<OrderResult>>,
        modify_ok: bool,
    }

    impl MockBroker {
        fn new(bid: Decimal, ask: Decimal) -> Self {
            Self {
                tradable: true,
                bid,
                ask,
                spec: InstrumentSpec::default(),
                place_results: Mutex::new(Vec::new()),
                modify_ok: true,
            }
        }

        fn queue(mut self, results: Vec<OrderResult>) -> Self {
            self.place_results = Mutex::new(results);
            self
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        fn broker_name(&self) -> &str {
            "mock"
        }
        async fn connect(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn account_info(&self) -> BrokerResult<AccountInfo> {
            unimplemented!()
        }
        async fn instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
            Ok(vec![])
        }
        async fn symbol_spec(&self, _symbol: &str) -> BrokerResult<InstrumentSpec> {
            Ok(self.spec.clone())
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
            let mut results = self.place_results.lock().unwrap();
            if results.is_empty() {
                return OrderResult::rejected("no more queued results", RejectKind::Unknown);
            }
            results.remove(0)
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
            Ok(self.modify_ok)
        }
        async fn can_trade_symbol(&self, symbol: &str, _side: Side) -> Tradability {
            Tradability {
                tradable: self.tradable,
                reason: if self.tradable { "ok".to_string() } else { "disabled".to_string() },
                resolved_symbol: symbol.to_string(),
            }
        }
        fn is_paper(&self) -> bool {
            true
        }
    }

    fn filled(price: Decimal, volume: Decimal) -> OrderResult {
        OrderResult {
            order_id: Some("o1".to_string()),
            status: OrderStatus::Filled,
            filled_price: Some(price),
            filled_volume: Some(volume),
            error_message: None,
            retcode: None,
            reject_kind: None,
        }
    }

    fn proposal() -> TradeProposal {
        TradeProposal {
            canonical_symbol: "EUR_USD".to_string(),
            direction: Direction::Long,
            stop_loss: dec!(1.07800),
            take_profit: dec!(1.08600),
            break_even_trigger: None,
            trailing_stop_pips: None,
            confidence: 75.0,
            timeframes_analyzed: 1,
            models_agreed: 4,
            total_models: 5,
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            balance: dec!(10000),
            margin_available: dec!(5000),
            leverage: dec!(30),
        }
    }

    fn cfg() -> PipelineConfig {
        PipelineConfig {
            min_risk_reward: dec!(1.5),
            max_risk_reward: dec!(2.2),
            risk_per_trade_percent: dec!(1),
        }
    }

    #[tokio::test]
    async fn exposure_gate_blocks_before_any_broker_call() {
        let broker = MockBroker::new(dec!(1.08000), dec!(1.08010));
        let mut exposed = HashSet::new();
        exposed.insert("EUR_USD".to_string());
        let exposure = ExposureState {
            local_open: 0,
            broker_open: 0,
            broker_pending_market_orders: 0,
            exposed_symbols: exposed,
            max_open_positions: 5,
        };
        let guard = PriceGuard::default();
        let risk = RiskEvaluator::new();
        let outcome =
        pipeline::submit_trade(&broker, &guard, &risk, &exposure, account(), &cfg(), proposal())
            .await;
        match outcome {
            PipelineOutcome::Rejected { stage, .. } => assert_eq!(stage, "exposure_gate"),
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn untradable_symbol_is_rejected_at_tradability_gate() {
        let mut broker = MockBroker::new(dec!(1.08000), dec!(1.08010));
        broker.tradable = false;
        let exposure = ExposureState {
            local_open: 0,
            broker_open: 0,
            broker_pending_market_orders: 0,
            exposed_symbols: HashSet::new(),
            max_open_positions: 5,
        };
        let guard = PriceGuard::default();
        let risk = RiskEvaluator::new();
        let outcome =
        pipeline::submit_trade(&broker, &guard, &risk, &exposure, account(), &cfg(), proposal())
            .await;
        match outcome {
            PipelineOutcome::Rejected { stage, .. } => assert_eq!(stage, "tradability_gate"),
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn clean_fill_produces_an_open_trade_record() {
        let broker = MockBroker::new(dec!(1.08000), dec!(1.08010))
            .queue(vec![filled(dec!(1.08005), dec!(0.50))]);
        let exposure = ExposureState {
            local_open: 0,
            broker_open: 0,
            broker_pending_market_orders: 0,
            exposed_symbols: HashSet::new(),
            max_open_positions: 5,
        };
        let guard = PriceGuard::default();
        let risk = RiskEvaluator::new();
        let outcome =
        pipeline::submit_trade(&broker, &guard, &risk, &exposure, account(), &cfg(), proposal())
            .await;
        match outcome {
            PipelineOutcome::Filled(trade) => {
                assert_eq!(trade.status, position_supervisor::TradeStatus::Open);
                assert_eq!(trade.symbol, "EUR_USD");
                assert!(trade.stop_loss < trade.entry_price);
                assert!(trade.take_profit > trade.entry_price);
            }
            PipelineOutcome::Rejected { stage, reason } => {
                panic!("expected fill, got rejection at {stage}: {reason}")
            }
        }
    }

    #[tokio::test]
    async fn no_money_reduces_lot_and_retries_until_fill() {
        let broker = MockBroker::new(dec!(1.08000), dec!(1.08010)).queue(vec![
                OrderResult::rejected("no money", RejectKind::NoMoney),
                filled(dec!(1.08005), dec!(0.375)),
        ]);
        let exposure = ExposureState {
            local_open: 0,
            broker_open: 0,
            broker_pending_market_orders: 0,
            exposed_symbols: HashSet::new(),
            max_open_positions: 5,
        };
        let guard = PriceGuard::default();
        let risk = RiskEvaluator::new();
        let outcome =
        pipeline::submit_trade(&broker, &guard, &risk, &exposure, account(), &cfg(), proposal())
            .await;
        assert!(matches!(outcome, PipelineOutcome::Filled(_)));
    }

    #[tokio::test]
    async fn exhausting_retries_rejects_at_submit() {
        let rejections = vec![OrderResult::rejected("down", RejectKind::Unknown); 6];
        let broker = MockBroker::new(dec!(1.08000), dec!(1.08010)).queue(rejections);
        let exposure = ExposureState {
            local_open: 0,
            broker_open: 0,
            broker_pending_market_orders: 0,
            exposed_symbols: HashSet::new(),
            max_open_positions: 5,
        };
        let guard = PriceGuard::default();
        let risk = RiskEvaluator::new();
        let outcome =
        pipeline::submit_trade(&broker, &guard, &risk, &exposure, account(), &cfg(), proposal())
            .await;
        match outcome {
            PipelineOutcome::Rejected { stage, .. } => assert_eq!(stage, "submit"),
            _ => panic!("expected rejection"),
        }
    }
}
