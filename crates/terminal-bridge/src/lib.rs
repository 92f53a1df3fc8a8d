//! In-process MT4/MT5 terminal adapter: simulates a locally-attached
//! terminal rather than talking to a remote bridge process over HTTP, for
//! environments where no gateway service is available (local development,
//! demo accounts, CI). State lives entirely in memory behind one mutex;
//! prices are synthesized from a small base-price table plus a per-session
//! seeded random walk so the same login/server/platform triple always
//! produces the same sequence.

use async_trait::async_trait;
use broker_trait::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::stream::BoxStream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct TerminalPosition {
    id: String,
    symbol: String,
    side: Side,
    volume: Decimal,
    open_price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    opened_at: DateTime<Utc>,
}

struct TerminalState {
    connected: bool,
    balance: Decimal,
    positions: Vec<TerminalPosition>,
    rng: StdRng,
}

pub struct TerminalBridge {
    login: String,
    server: String,
    platform: String,
    state: Mutex<TerminalState>,
    paper: bool,
}

fn seed_from(login: &str, server: &str, platform: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (login, server, platform).hash(&mut hasher);
    hasher.finish()
}

fn base_price(symbol: &str) -> Decimal {
    let normalized = symbol.to_ascii_uppercase().replace(['/', '_'], "");
    let defaults: HashMap<&str, &str> = HashMap::from([
        ("EURUSD", "1.08"),
        ("GBPUSD", "1.26"),
        ("USDJPY", "153.20"),
        ("XAUUSD", "2650.0"),
        ("US30", "42100.0"),
    ]);
    defaults
        .get(normalized.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| Decimal::from(100))
}

impl TerminalBridge {
    pub fn new(login: impl Into<String>, server: impl Into<String>, platform: impl Into<String>) -> Self {
        let login = login.into();
        let server = server.into();
        let platform = platform.into();
        let rng = StdRng::seed_from_u64(seed_from(&login, &server, &platform));
        Self {
            login,
            server,
            platform,
            state: Mutex::new(TerminalState {
                connected: false,
                balance: Decimal::from(10_000),
                positions: Vec::new(),
                rng,
            }),
            paper: true,
        }
    }

    async fn tick(&self, symbol: &str) -> Tick {
        let base = base_price(symbol);
        let variance = if base < Decimal::from(10) { 0.0008 } else { 0.2 };
        let spread = if base < Decimal::from(10) { 0.0001 } else { 0.1 };
        let mut state = self.state.lock().await;
        let offset = state.rng.gen_range(-variance..variance);
        let mid = base + Decimal::from_f64(offset).unwrap_or_default();
        let half_spread = Decimal::from_f64(spread / 2.0).unwrap_or_default();
        Tick {
            bid: mid - half_spread,
            ask: mid + half_spread,
            ts: Utc::now(),
        }
    }

    fn to_position(raw: &TerminalPosition, current: Decimal) -> Position {
        let unrealized_pnl = match raw.side {
            Side::Buy => (current - raw.open_price) * raw.volume,
            Side::Sell => (raw.open_price - current) * raw.volume,
        };
        Position {
            symbol: raw.symbol.clone(),
            side: raw.side,
            volume: raw.volume,
            entry_price: raw.open_price,
            current_price: current,
            unrealized_pnl,
            stop_loss: raw.stop_loss,
            take_profit: raw.take_profit,
            opened_at: raw.opened_at,
        }
    }
}

#[async_trait]
impl BrokerAdapter for TerminalBridge {
    fn broker_name(&self) -> &str {
        if self.platform.eq_ignore_ascii_case("mt4") {
            "terminal-mt4"
        } else {
            "terminal-mt5"
        }
    }

    async fn connect(&self) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        state.connected = true;
        tracing::debug!(login = %self.login, server = %self.server, "in-process terminal attached");
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(BrokerError::ConnectionFailed("terminal not attached".to_string()));
        }
        let mut floating = Decimal::ZERO;
        let mut margin = Decimal::ZERO;
        for position in &state.positions {
            let tick = self.tick(&position.symbol).await;
            floating += Self::to_position(position, tick.mid()).unrealized_pnl;
            margin += position.volume.abs() * Decimal::from(30);
        }
        let equity = state.balance + floating;
        Ok(AccountInfo {
            balance: state.balance,
            equity,
            margin_used: margin,
            margin_available: (equity - margin).max(Decimal::ZERO),
            unrealized_pnl: floating,
            realized_pnl_today: Decimal::ZERO,
            currency: "USD".to_string(),
            leverage: Decimal::from(100),
        })
    }

    async fn instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        Ok(["EURUSD", "GBPUSD", "USDJPY", "XAUUSD", "US30"]
            .into_iter()
            .map(|s| InstrumentRecord {
                broker_symbol: s.to_string(),
                description: None,
            })
                .collect())
    }

    async fn symbol_spec(&self, _symbol: &str) -> BrokerResult<InstrumentSpec> {
        Ok(InstrumentSpec::default())
    }

    async fn current_price(&self, symbol: &str) -> BrokerResult<Tick> {
        Ok(self.tick(symbol).await)
    }

    async fn prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, Tick>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            out.insert(symbol.clone(), self.tick(symbol).await);
        }
        Ok(out)
    }

    fn stream_prices(&self, symbols: Vec<String>) -> BoxStream<'static, BrokerResult<Tick>> {
        // No `&self` borrow can outlive a `'static` stream, so this polls
        // the deterministic base-price table directly instead of sharing
        // the session rng used by `tick()`.
        Box::pin(futures_util::stream::unfold((symbols, 0usize), |(symbols, idx)| async move {
            if symbols.is_empty() {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            let symbol = symbols[idx % symbols.len()].clone();
            let base = base_price(&symbol);
            let tick = Tick {
                bid: base,
                ask: base,
                ts: Utc::now(),
            };
            let next_idx = (idx + 1) % symbols.len();
            Some((Ok(tick), (symbols, next_idx)))
        }))
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        _from: Option<DateTime<Utc>>,
        _to: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<Candle>> {
        let safe_count = count.clamp(1, 2000);
        let minutes = match timeframe {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        };
        let base = base_price(symbol);
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut candles = Vec::with_capacity(safe_count);
        for i in 0..safe_count {
            let time = now - ChronoDuration::minutes(((safe_count - i) * minutes) as i64);
            let drift = Decimal::from_f64(state.rng.gen_range(-0.002..0.002)).unwrap_or_default() * base / Decimal::from(100);
            let open = base + drift;
            let wiggle = Decimal::from_f64(state.rng.gen_range(0.0002..0.0012)).unwrap_or_default() * base / Decimal::from(100);
            let high = open + wiggle;
            let low = open - wiggle;
            let close = low + (high - low) * Decimal::from_f64(state.rng.gen_range(0.0..1.0)).unwrap_or_default();
            candles.push(Candle {
                time,
                open,
                high,
                low,
                close,
                volume: Decimal::from(state.rng.gen_range(800..2200)),
            });
        }
        Ok(candles)
    }

    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if request.volume <= Decimal::ZERO {
            return OrderResult::rejected("invalid volume", RejectKind::Unknown);
        }
        let tick = self.tick(&request.symbol).await;
        let fill_price = match request.side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };
        let position = TerminalPosition {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            open_price: fill_price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            opened_at: Utc::now(),
        };
        let order_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.positions.push(position);
        OrderResult {
            order_id: Some(order_id),
            status: OrderStatus::Filled,
            filled_price: Some(fill_price),
            filled_volume: Some(request.volume),
            error_message: None,
            retcode: None,
            reject_kind: None,
        }
    }

    async fn cancel_order(&self, _order_id: &str) -> bool {
        // Every order fills synchronously in `place_order`; there is never
        // a pending order to cancel.
        false
    }

    async fn get_order(&self, _order_id: &str) -> BrokerResult<Option<OrderResult>> {
        Ok(None)
    }

    async fn open_orders(&self, _symbol: Option<&str>) -> BrokerResult<Vec<OrderResult>> {
        Ok(vec![])
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(state.positions.len());
        for position in &state.positions {
            let tick = self.tick(&position.symbol).await;
            out.push(Self::to_position(position, tick.mid()));
        }
        Ok(out)
    }

    async fn position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
        Ok(self.positions().await?.into_iter().find(|p| p.symbol == symbol))
    }

    async fn close_position(&self, symbol: &str, size: Option<Decimal>) -> OrderResult {
        let tick = self.tick(symbol).await;
        let mut state = self.state.lock().await;
        let Some(idx) = state.positions.iter().position(|p| p.symbol == symbol) else {
            return OrderResult::rejected(format!("no open position for {symbol}"), RejectKind::Unknown);
        };
        let position = state.positions[idx].clone();
        let close_volume = size.unwrap_or(position.volume).min(position.volume);
        let close_price = match position.side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };
        let pnl = match position.side {
            Side::Buy => (close_price - position.open_price) * close_volume,
            Side::Sell => (position.open_price - close_price) * close_volume,
        };
        state.balance += pnl;
        if close_volume >= position.volume {
            state.positions.remove(idx);
        } else {
            state.positions[idx].volume -= close_volume;
        }
        OrderResult {
            order_id: Some(uuid::Uuid::new_v4().to_string()),
            status: OrderStatus::Filled,
            filled_price: Some(close_price),
            filled_volume: Some(close_volume),
            error_message: None,
            retcode: None,
            reject_kind: None,
        }
    }

    async fn modify_position(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<bool> {
        let mut state = self.state.lock().await;
        let Some(position) = state.positions.iter_mut().find(|p| p.symbol == symbol) else {
            return Ok(false);
        };
        if stop_loss.is_some() {
            position.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        Ok(true)
    }

    async fn can_trade_symbol(&self, symbol: &str, _side: Side) -> Tradability {
        Tradability {
            tradable: true,
            reason: "ok".to_string(),
            resolved_symbol: symbol.to_uppercase(),
        }
    }

    fn is_paper(&self) -> bool {
        self.paper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn same_login_server_platform_seeds_identical_price_sequences() {
        let a = TerminalBridge::new("demo1", "demo.server", "mt5");
        let b = TerminalBridge::new("demo1", "demo.server", "mt5");
        let tick_a = a.tick("EURUSD").await;
        let tick_b = b.tick("EURUSD").await;
        assert_eq!(tick_a.bid, tick_b.bid);
        assert_eq!(tick_a.ask, tick_b.ask);
    }

    #[tokio::test]
    async fn place_order_opens_a_position_and_account_info_reflects_floating_pnl() {
        let bridge = TerminalBridge::new("demo1", "demo.server", "mt5");
        bridge.connect().await.unwrap();
        let result = bridge
            .place_order(OrderRequest {
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(1),
            stop_loss: None,
            take_profit: None,
            client_order_id: None,
        })
            .await;
        assert_eq!(result.status, OrderStatus::Filled);
        let positions = bridge.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        let info = bridge.account_info().await.unwrap();
        assert_eq!(info.balance, dec!(10000));
    }

    #[tokio::test]
    async fn closing_a_position_realizes_pnl_into_balance() {
        let bridge = TerminalBridge::new("demo1", "demo.server", "mt5");
        bridge.connect().await.unwrap();
        bridge
            .place_order(OrderRequest {
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(1),
            stop_loss: None,
            take_profit: None,
            client_order_id: None,
        })
            .await;
        let closed = bridge.close_position("EURUSD", None).await;
        assert_eq!(closed.status, OrderStatus::Filled);
        assert!(bridge.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn account_info_fails_before_connect() {
        let bridge = TerminalBridge::new("demo1", "demo.server", "mt5");
        assert!(bridge.account_info().await.is_err());
    }
}
