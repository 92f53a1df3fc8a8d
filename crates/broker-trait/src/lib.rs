//! The uniform contract every broker adapter implements: account, instruments,
//! orders, positions, prices, candles and streams. Concrete adapters (the
//! MetaTrader gateway, OANDA v20, the generic REST platforms, the in-process
//! terminal bridge) all implement [`BrokerAdapter`] and are otherwise
//! interchangeable to the rest of the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Errors an adapter call can fail with. Matches the taxonomy kinds that are
/// local to the broker boundary; higher layers (order pipeline, resolver)
/// translate these into their own handling per their error kind table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("symbol not tradable: {0} ({reason})", reason = .1)]
    SymbolNotTradable(String, String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Account snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl_today: Decimal,
    pub currency: String,
    pub leverage: Decimal,
}

/// One entry from `instruments()` — enough to drive watch-list diagnostics
/// and symbol indexing; adapters may carry richer native data internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub broker_symbol: String,
    pub description: Option<String>,
}

/// `trade_mode`: only `Full` allows new orders in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Full,
    LongOnly,
    ShortOnly,
    CloseOnly,
    Disabled,
}

/// Instrument spec cached per canonical symbol. Every field is
/// optional by design: absence must never crash the pipeline — conservative
/// fallbacks live in the order pipeline, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub point_size: Option<Decimal>,
    pub tick_size: Option<Decimal>,
    pub tick_value: Option<Decimal>,
    pub contract_size: Option<Decimal>,
    pub min_volume: Option<Decimal>,
    pub max_volume: Option<Decimal>,
    pub volume_step: Option<Decimal>,
    pub stops_level: Option<Decimal>,
    pub freeze_level: Option<Decimal>,
    pub filling_modes: Vec<String>,
    pub trade_mode: Option<TradeMode>,
}

/// A bid/ask quote,'s `Tick(bid,ask,ts)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

/// Timeframe codes accepted throughout. `FromStr`/`Display` round-trip
/// the wire codes; adapters translate further into their own native tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn code(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe code: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Trade direction, shared between order requests and open positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Trade direction as carried on a trade record : distinct from [`Side`]
/// because a trade's direction outlives the single order that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl From<Direction> for Side {
    fn from(d: Direction) -> Side {
        match d {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// An order request. `stop_loss`/`take_profit` are the caller's requested
/// protective levels; the adapter MUST attempt with them as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub client_order_id: Option<String>,
}

/// Adapter-local order outcome. `place_order` always returns one of these —
/// it never raises on a normal rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Pending,
    Rejected,
    Cancelled,
}

/// A taxonomy of broker reject/retcode reasons the order pipeline's retry
/// loop pattern-matches on. `Unknown` is the catch-all for
/// codes an adapter has not mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    NoMoney,
    InvalidStops,
    InvalidFilling,
    Connection,
    Timeout,
    ProtectionNotSet,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_price: Option<Decimal>,
    pub filled_volume: Option<Decimal>,
    pub error_message: Option<String>,
    pub retcode: Option<i32>,
    pub reject_kind: Option<RejectKind>,
}

impl OrderResult {
    pub fn rejected(message: impl Into<String>, kind: RejectKind) -> Self {
        Self {
            order_id: None,
            status: OrderStatus::Rejected,
            filled_price: None,
            filled_volume: None,
            error_message: Some(message.into()),
            retcode: None,
            reject_kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

/// Result of `can_trade_symbol`: failures return `tradable=true` with a note
/// rather than blocking on transient errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tradability {
    pub tradable: bool,
    pub reason: String,
    pub resolved_symbol: String,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker_name(&self) -> &str;

    async fn connect(&self) -> BrokerResult<()>;

    /// Idempotent: calling `disconnect` on an already-disconnected adapter
    /// must not error.
    async fn disconnect(&self) -> BrokerResult<()>;

    async fn account_info(&self) -> BrokerResult<AccountInfo>;

    async fn instruments(&self) -> BrokerResult<Vec<InstrumentRecord>>;

    /// Returns `InstrumentSpec::default()` (all fields `None`) rather than
    /// erroring when the broker has nothing cached for `symbol`.
    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<InstrumentSpec>;

    async fn current_price(&self, symbol: &str) -> BrokerResult<Tick>;

    /// Partial success is acceptable: symbols that fail to price are simply
    /// absent from the returned map rather than failing the whole batch.
    async fn prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, Tick>>;

    /// A restartable, cancellable, logically-infinite stream of ticks for
    /// `symbols`. Adapters that have no native push feed may synthesize one
    /// by polling `prices` on an interval.
    fn stream_prices(&self, symbols: Vec<String>) -> BoxStream<'static, BrokerResult<Tick>>;

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<Candle>>;

    /// Always returns a result; failures are carried as
    /// `OrderResult{status: Rejected, ..}`, never as an `Err`.
    async fn place_order(&self, request: OrderRequest) -> OrderResult;

    /// Never raises; an unknown order id or a no-op cancel both return
    /// `false` rather than erroring.
    async fn cancel_order(&self, order_id: &str) -> bool;

    async fn get_order(&self, order_id: &str) -> BrokerResult<Option<OrderResult>>;

    async fn open_orders(&self, symbol: Option<&str>) -> BrokerResult<Vec<OrderResult>>;

    /// Stale-on-rate-limit is acceptable: an adapter may return its last
    /// cached snapshot rather than erroring outright.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    async fn position(&self, symbol: &str) -> BrokerResult<Option<Position>>;

    async fn close_position(&self, symbol: &str, size: Option<Decimal>) -> OrderResult;

    async fn modify_position(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<bool>;

    /// Never blocks on a transient error: implementations must return
    /// `tradable=true` with an explanatory `reason` rather than propagate.
    async fn can_trade_symbol(&self, symbol: &str, side: Side) -> Tradability;

    fn is_paper(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_mid_is_average_of_bid_ask() {
        let t = Tick {
            bid: Decimal::new(11000, 4),
            ask: Decimal::new(11002, 4),
            ts: Utc::now(),
        };
        assert_eq!(t.mid(), Decimal::new(11001, 4));
    }

    #[test]
    fn timeframe_codes_round_trip() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ] {
            let code = tf.code();
            let parsed: Timeframe = code.parse().unwrap();
            assert_eq!(parsed, tf);
        }
    }

    #[test]
    fn rejected_order_carries_reject_kind() {
        let r = OrderResult::rejected("no money", RejectKind::NoMoney);
        assert_eq!(r.status, OrderStatus::Rejected);
        assert_eq!(r.reject_kind, Some(RejectKind::NoMoney));
    }
}
