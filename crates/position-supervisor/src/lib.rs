//! Break-even promotion, trailing stop, smart exit and broker↔local
//! reconciliation for open trades. Runs at the start of every
//! analysis tick, before new-trade consideration.

pub mod supervisor;
pub mod trade;

pub use supervisor::{manage_one, reconcile, supervise, SmartExitConfig, SupervisionEvent};
pub use trade::{TradeRecord, TradeStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::*;
    use chrono::Utc;
    use futures_util::stream::BoxStream;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn open_trade(direction: Direction, entry: Decimal, sl: Decimal, tp: Decimal) -> TradeRecord {
        TradeRecord {
            id: "t1".to_string(),
            symbol: "EUR_USD".to_string(),
            direction,
            entry_price: entry,
            initial_stop_loss: sl,
            stop_loss: sl,
            take_profit: tp,
            units: dec!(1),
            opened_at: Utc::now(),
            confidence: 80.0,
            timeframes_analyzed: 1,
            models_agreed: 5,
            total_models: 6,
            status: TradeStatus::Open,
            exit_price: None,
            exit_timestamp: None,
            profit_loss: None,
            break_even_trigger: None,
            trailing_stop_pips: None,
            partial_tp_percent: None,
            is_break_even: false,
            extreme_price: entry,
            max_favorable_rr: Decimal::ZERO,
        }
    }

    struct MockBroker {
        price: Decimal,
        positions: Vec<Position>,
        modify_ok: bool,
        close_fill: bool,
        modify_calls: Mutex<Vec<(Option<Decimal>, Option<Decimal>)>>,
    }

    impl MockBroker {
        fn new(price: Decimal, symbols: &[&str]) -> Self {
            let positions = symbols
                .iter()
                .map(|s| Position {
                symbol: s.to_string(),
                side: Side::Buy,
                volume: dec!(1),
                entry_price: price,
                current_price: price,
                unrealized_pnl: Decimal::ZERO,
                stop_loss: None,
                take_profit: None,
                opened_at: Utc::now(),
            })
                .collect();
            Self {
                price,
                positions,
                modify_ok: true,
                close_fill: true,
                modify_calls: Mutex::new(Vec::new()),
            }
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
            Ok(InstrumentSpec::default())
        }
        async fn current_price(&self, _symbol: &str) -> BrokerResult<Tick> {
            Ok(Tick {
                bid: self.price,
                ask: self.price,
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
            OrderResult::rejected("not used", RejectKind::Unknown)
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
            Ok(self.positions.clone())
        }
        async fn position(&self, _symbol: &str) -> BrokerResult<Option<Position>> {
            Ok(None)
        }
        async fn close_position(&self, _symbol: &str, _size: Option<Decimal>) -> OrderResult {
            if self.close_fill {
                OrderResult {
                    order_id: Some("c1".to_string()),
                    status: OrderStatus::Filled,
                    filled_price: Some(self.price),
                    filled_volume: Some(dec!(1)),
                    error_message: None,
                    retcode: None,
                    reject_kind: None,
                }
            } else {
                OrderResult::rejected("no fill", RejectKind::Unknown)
            }
        }
        async fn modify_position(
            &self,
            _symbol: &str,
            stop_loss: Option<Decimal>,
            take_profit: Option<Decimal>,
        ) -> BrokerResult<bool> {
            self.modify_calls.lock().unwrap().push((stop_loss, take_profit));
            Ok(self.modify_ok)
        }
        async fn can_trade_symbol(&self, _symbol: &str, _side: Side) -> Tradability {
            Tradability {
                tradable: true,
                reason: "ok".to_string(),
                resolved_symbol: "EUR_USD".to_string(),
            }
        }
        fn is_paper(&self) -> bool {
            true
        }
    }

    #[test]
    fn extreme_price_is_monotone_for_long() {
        let mut t = open_trade(Direction::Long, dec!(1.1000), dec!(1.0950), dec!(1.1100));
        t.update_extreme_price(dec!(1.1050));
        t.update_extreme_price(dec!(1.1020));
        assert_eq!(t.extreme_price, dec!(1.1050));
    }

    #[test]
    fn max_favorable_rr_never_decreases() {
        let mut t = open_trade(Direction::Long, dec!(1.1000), dec!(1.0950), dec!(1.1100));
        t.update_extreme_price(dec!(1.1050));
        t.update_max_favorable_rr();
        let first = t.max_favorable_rr;
        assert_eq!(first, dec!(1.0)); // 0.0050 move / 0.0050 risk

        t.update_extreme_price(dec!(1.1010));
        t.update_max_favorable_rr();
        assert_eq!(t.max_favorable_rr, first);
    }

    #[test]
    fn crosses_break_even_respects_direction() {
        let mut t = open_trade(Direction::Short, dec!(1.1000), dec!(1.1050), dec!(1.0900));
        t.break_even_trigger = Some(dec!(1.0970));
        assert!(!t.crosses_break_even(dec!(1.0980)));
        assert!(t.crosses_break_even(dec!(1.0960)));
    }

    #[tokio::test]
    async fn reconcile_closes_trades_absent_from_broker() {
        let broker = MockBroker::new(dec!(1.1050), &[]);
        let mut trades = vec![open_trade(
            Direction::Long,
            dec!(1.1000),
            dec!(1.0950),
            dec!(1.1100),
        )];
        let (closed, events) = reconcile(&broker, &mut trades).await;
        assert!(trades.is_empty());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, TradeStatus::ClosedManual);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_classifies_a_close_near_take_profit() {
        let broker = MockBroker::new(dec!(1.1098), &[]);
        let mut trades = vec![open_trade(
            Direction::Long,
            dec!(1.1000),
            dec!(1.0950),
            dec!(1.1100),
        )];
        let (closed, _events) = reconcile(&broker, &mut trades).await;
        assert_eq!(closed[0].status, TradeStatus::ClosedTp);
    }

    #[tokio::test]
    async fn reconcile_classifies_a_close_near_stop_loss() {
        let broker = MockBroker::new(dec!(1.0952), &[]);
        let mut trades = vec![open_trade(
            Direction::Long,
            dec!(1.1000),
            dec!(1.0950),
            dec!(1.1100),
        )];
        let (closed, _events) = reconcile(&broker, &mut trades).await;
        assert_eq!(closed[0].status, TradeStatus::ClosedSl);
    }

    #[tokio::test]
    async fn reconcile_classifies_a_break_even_stop_as_closed_be() {
        let broker = MockBroker::new(dec!(1.1001), &[]);
        let mut trade = open_trade(Direction::Long, dec!(1.1000), dec!(1.0950), dec!(1.1100));
        trade.is_break_even = true;
        trade.stop_loss = trade.entry_price;
        let mut trades = vec![trade];
        let (closed, _events) = reconcile(&broker, &mut trades).await;
        assert_eq!(closed[0].status, TradeStatus::ClosedBe);
    }

    #[tokio::test]
    async fn reconcile_leaves_trades_still_open_at_broker() {
        let broker = MockBroker::new(dec!(1.1050), &["EUR_USD"]);
        let mut trades = vec![open_trade(
            Direction::Long,
            dec!(1.1000),
            dec!(1.0950),
            dec!(1.1100),
        )];
        let (closed, events) = reconcile(&broker, &mut trades).await;
        assert_eq!(trades.len(), 1);
        assert!(closed.is_empty());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn break_even_promotion_sets_stop_to_entry() {
        let broker = MockBroker::new(dec!(1.1050), &["EUR_USD"]);
        let mut t = open_trade(Direction::Long, dec!(1.1000), dec!(1.0950), dec!(1.1100));
        t.break_even_trigger = Some(dec!(1.1030));
        let smart_exit = SmartExitConfig {
            enabled: false,
            min_rr: dec!(1.5),
            drawdown_percent: dec!(30),
        };
        let (events, closed) =
        manage_one(&broker, &mut t, dec!(1.1050), dec!(0.0001), &smart_exit).await;
        assert!(!closed);
        assert!(t.is_break_even);
        assert_eq!(t.stop_loss, dec!(1.1000));
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisionEvent::BreakEvenPromoted { .. })));
    }

    #[tokio::test]
    async fn smart_exit_closes_on_deep_retrace() {
        let broker = MockBroker::new(dec!(1.1020), &["EUR_USD"]);
        let mut t = open_trade(Direction::Long, dec!(1.1000), dec!(1.0950), dec!(1.1200));
        t.is_break_even = true;
        t.extreme_price = dec!(1.1100); // best favorable move = 0.0100, risk = 0.0050 -> rr = 2.0
        t.max_favorable_rr = dec!(2.0);
        let smart_exit = SmartExitConfig {
            enabled: true,
            min_rr: dec!(1.5),
            drawdown_percent: dec!(50),
        };
        // current 1.1020 -> favorable_move_now = 0.0020, drawdown = (0.0100-0.0020)/0.0100 = 0.80 >= 0.50
        let (events, closed) =
        manage_one(&broker, &mut t, dec!(1.1020), dec!(0.0001), &smart_exit).await;
        assert!(closed);
        assert_eq!(t.status, TradeStatus::ClosedSmartExit);
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisionEvent::SmartExitClosed { .. })));
    }
}
