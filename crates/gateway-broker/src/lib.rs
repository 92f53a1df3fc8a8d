//! MetaTrader gateway adapter: a REST bridge in front of an MT4/MT5
//! terminal, authenticated with a bearer token plus account id. Four TTL
//! classes (`account_info` 30s, `positions` 15s, `prices` 8s, `orders` 10s)
//! cap request volume against the gateway; an HTTP 429 opens a blackout on
//! the offending class for the `Retry-After` duration instead of retrying
//! immediately.

pub mod client;
pub mod models;

use async_trait::async_trait;
use broker_trait::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use client::{GatewayClient, GatewayError};
use futures_util::stream::BoxStream;
use models::{GatewayActionType, GatewayOrderRequest, GatewayPosition, GatewaySymbol};
use rate_limit_cache::{RateLimitGate, TtlCache};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use symbol_resolver::{ResolveError, SymbolResolver};

const ACCOUNT_INFO_TTL: ChronoDuration = ChronoDuration::seconds(30);
const POSITIONS_TTL: ChronoDuration = ChronoDuration::seconds(15);
const PRICES_TTL: ChronoDuration = ChronoDuration::seconds(8);

const CLASS_ACCOUNT_INFO: &str = "account_info";
const CLASS_POSITIONS: &str = "positions";
const CLASS_PRICES: &str = "prices";
const CLASS_ORDERS: &str = "orders";

pub struct GatewayBroker {
    client: GatewayClient,
    account_cache: TtlCache<(), AccountInfo>,
    positions_cache: TtlCache<(), Vec<Position>>,
    price_cache: TtlCache<String, Tick>,
    gate: RateLimitGate,
    resolver: SymbolResolver,
}

impl GatewayBroker {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            client: GatewayClient::new(base_url, token, account_id),
            account_cache: TtlCache::new(),
            positions_cache: TtlCache::new(),
            price_cache: TtlCache::new(),
            gate: RateLimitGate::new(),
            resolver: SymbolResolver::default(),
        }
    }

    /// Resolves a canonical symbol to this gateway's native spelling before
    /// any per-symbol REST call. The resolver's universe is warmed by
    /// `connect()`; until then resolution fails closed with `SymbolNotFound`.
    fn native_symbol(&self, canonical: &str, side: Side) -> BrokerResult<String> {
        match self.resolver.resolve(canonical, side) {
            Ok(native) => Ok(native),
            Err(ResolveError::NotFound { canonical }) => Err(BrokerError::SymbolNotFound(canonical)),
            Err(ResolveError::RecentlyFailed { canonical, .. }) => {
                Err(BrokerError::SymbolNotTradable(canonical, "recently failed to resolve".to_string()))
            }
        }
    }

    fn blackout(&self, class: &str, err: &GatewayError) -> BrokerError {
        if let GatewayError::RateLimited { retry_after_secs } = err {
            self.gate
                .block_for(class, ChronoDuration::seconds(retry_after_secs.unwrap_or(30) as i64));
            return BrokerError::RateLimited {
                retry_after_secs: *retry_after_secs,
            };
        }
        BrokerError::Transport(err.to_string())
    }

    fn timeframe_code(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    fn trade_mode_of(raw: Option<&str>) -> Option<TradeMode> {
        match raw?.to_ascii_uppercase().as_str() {
            "FULL" => Some(TradeMode::Full),
            "LONGONLY" => Some(TradeMode::LongOnly),
            "SHORTONLY" => Some(TradeMode::ShortOnly),
            "CLOSEONLY" => Some(TradeMode::CloseOnly),
            "DISABLED" => Some(TradeMode::Disabled),
            _ => None,
        }
    }

    fn side_of(raw: &str) -> Side {
        if raw.eq_ignore_ascii_case("sell") {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    fn to_position(raw: GatewayPosition) -> Position {
        Position {
            symbol: raw.symbol,
            side: Self::side_of(&raw.side),
            volume: raw.volume,
            entry_price: raw.open_price,
            current_price: raw.current_price,
            unrealized_pnl: raw.profit,
            stop_loss: raw.stop_loss,
            take_profit: raw.take_profit,
            opened_at: raw.open_time,
        }
    }

    fn reject_kind_of(retcode: i32) -> RejectKind {
        match retcode {
            10004 | 10021 => RejectKind::Connection,
            10006 | 10013 => RejectKind::Unknown,
            10015 | 10016 => RejectKind::InvalidStops,
            10018 => RejectKind::Connection,
            10019 => RejectKind::NoMoney,
            10030 => RejectKind::InvalidFilling,
            10033 | 10034 => RejectKind::ProtectionNotSet,
            _ => RejectKind::Unknown,
        }
    }

    fn spec_of(raw: GatewaySymbol) -> InstrumentSpec {
        InstrumentSpec {
            point_size: raw.point,
            tick_size: raw.tick_size,
            tick_value: raw.tick_value,
            contract_size: raw.contract_size,
            min_volume: raw.volume_min,
            max_volume: raw.volume_max,
            volume_step: raw.volume_step,
            stops_level: raw.stops_level,
            freeze_level: raw.freeze_level,
            filling_modes: raw.filling,
            trade_mode: Self::trade_mode_of(raw.trade_mode.as_deref()),
        }
    }
}

#[async_trait]
impl BrokerAdapter for GatewayBroker {
    fn broker_name(&self) -> &str {
        "metatrader-gateway"
    }

    /// Confirms the account is reachable, then warms the symbol resolver's
    /// universe from the gateway's full instrument list once at session start.
    async fn connect(&self) -> BrokerResult<()> {
        self.client
            .account()
            .await
            .map(|_| ())
            .map_err(|err| self.blackout(CLASS_ACCOUNT_INFO, &err))?;
        if let Ok(symbols) = self.client.symbols().await {
            let names: Vec<String> = symbols.into_iter().map(|s| s.symbol).collect();
            tracing::debug!(count = names.len(), "indexed metatrader gateway symbol universe");
            self.resolver.index_symbols(names);
        }
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        if self.gate.is_blocked(CLASS_ACCOUNT_INFO) {
            if let Some(cached) = self.account_cache.get_stale(&()) {
                return Ok(cached);
            }
        }
        if let Some(cached) = self.account_cache.get(&()) {
            return Ok(cached);
        }
        match self.client.account().await {
            Ok(raw) => {
                let info = AccountInfo {
                    balance: raw.balance,
                    equity: raw.equity,
                    margin_used: raw.margin,
                    margin_available: raw.free_margin,
                    unrealized_pnl: raw.unrealized_pnl,
                    realized_pnl_today: raw.realized_pnl_today,
                    currency: raw.currency,
                    leverage: raw.leverage,
                };
                self.account_cache.set((), info.clone(), ACCOUNT_INFO_TTL);
                Ok(info)
            }
            Err(err) => {
                let mapped = self.blackout(CLASS_ACCOUNT_INFO, &err);
                if let BrokerError::RateLimited { .. } = mapped {
                    if let Some(cached) = self.account_cache.get_stale(&()) {
                        return Ok(cached);
                    }
                }
                Err(mapped)
            }
        }
    }

    async fn instruments(&self) -> BrokerResult<Vec<InstrumentRecord>> {
        let symbols = self
            .client
            .symbols()
            .await
            .map_err(|err| self.blackout(CLASS_ACCOUNT_INFO, &err))?;
        Ok(symbols
            .into_iter()
            .map(|s| InstrumentRecord {
                broker_symbol: s.symbol,
                description: s.description,
            })
                .collect())
    }

    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<InstrumentSpec> {
        let native = match self.native_symbol(symbol, Side::Buy) {
            Ok(native) => native,
            Err(_) => return Ok(InstrumentSpec::default()),
        };
        match self.client.symbol_spec(&native).await {
            Ok(raw) => Ok(Self::spec_of(raw)),
            Err(GatewayError::Api { code: 404, .. }) => Ok(InstrumentSpec::default()),
            Err(err) => Err(self.blackout(CLASS_ACCOUNT_INFO, &err)),
        }
    }

    async fn current_price(&self, symbol: &str) -> BrokerResult<Tick> {
        if self.gate.is_blocked(CLASS_PRICES) {
            if let Some(cached) = self.price_cache.get_stale(&symbol.to_string()) {
                return Ok(cached);
            }
        }
        if let Some(cached) = self.price_cache.get(&symbol.to_string()) {
            return Ok(cached);
        }
        let native = self.native_symbol(symbol, Side::Buy)?;
        match self.client.quote(&native).await {
            Ok(raw) => {
                let tick = Tick {
                    bid: raw.bid,
                    ask: raw.ask,
                    ts: raw.time,
                };
                self.price_cache.set(symbol.to_string(), tick, PRICES_TTL);
                Ok(tick)
            }
            Err(err) => {
                let mapped = self.blackout(CLASS_PRICES, &err);
                if let BrokerError::RateLimited { .. } = mapped {
                    if let Some(cached) = self.price_cache.get_stale(&symbol.to_string()) {
                        return Ok(cached);
                    }
                }
                Err(mapped)
            }
        }
    }

    async fn prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, Tick>> {
        let mut out = HashMap::new();
        let mut native_to_canonical = HashMap::new();
        let mut natives = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.native_symbol(symbol, Side::Buy) {
                Ok(native) => {
                    native_to_canonical.insert(native.clone(), symbol.clone());
                    natives.push(native);
                }
                Err(_) => continue,
            }
        }
        match self.client.quotes(&natives).await {
            Ok(raws) => {
                for raw in raws {
                    let canonical = native_to_canonical.get(&raw.symbol).cloned().unwrap_or_else(|| raw.symbol.clone());
                    let tick = Tick {
                        bid: raw.bid,
                        ask: raw.ask,
                        ts: raw.time,
                    };
                    self.price_cache.set(canonical.clone(), tick, PRICES_TTL);
                    out.insert(canonical, tick);
                }
            }
            Err(err) => {
                self.blackout(CLASS_PRICES, &err);
                for symbol in symbols {
                    if let Some(cached) = self.price_cache.get_stale(symbol) {
                        out.insert(symbol.clone(), cached);
                    }
                }
            }
        }
        Ok(out)
    }

    fn stream_prices(&self, symbols: Vec<String>) -> BoxStream<'static, BrokerResult<Tick>> {
        // No native push feed; poll the quote endpoint on a round-robin
        // cycle, owning a cloned client so the stream can outlive `&self`.
        let client = self.client.clone();
        let state = (client, symbols, 0usize);
        Box::pin(futures_util::stream::unfold(state, |(client, symbols, idx)| async move {
            if symbols.is_empty() {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            let symbol = symbols[idx % symbols.len()].clone();
            let result = client
                .quote(&symbol)
                .await
                .map(|q| Tick {
                    bid: q.bid,
                    ask: q.ask,
                    ts: q.time,
                })
                .map_err(|err| BrokerError::Transport(err.to_string()));
            let next_idx = (idx + 1) % symbols.len();
            Some((result, (client, symbols, next_idx)))
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
        let native = self.native_symbol(symbol, Side::Buy)?;
        let raws = self
            .client
            .candles(&native, Self::timeframe_code(timeframe), count)
            .await
            .map_err(|err| self.blackout(CLASS_PRICES, &err))?;
        Ok(raws
            .into_iter()
            .map(|c| Candle {
                time: c.time,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })
                .collect())
    }

    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.gate.is_blocked(CLASS_ORDERS) {
            return OrderResult::rejected("orders endpoint in rate-limit blackout", RejectKind::Connection);
        }
        let native_symbol = match self.native_symbol(&request.symbol, request.side) {
            Ok(native) => native,
            Err(err) => return OrderResult::rejected(err.to_string(), RejectKind::Unknown),
        };
        let wire = GatewayOrderRequest {
            symbol: native_symbol,
            action_type: match request.side {
                Side::Buy => GatewayActionType::Buy,
                Side::Sell => GatewayActionType::Sell,
            },
            volume: request.volume,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            client_id: request.client_order_id,
        };
        match self.client.place_order(wire).await {
            Ok(response) if response.retcode == 0 || response.retcode == 10009 => OrderResult {
                order_id: response.order_id,
                status: OrderStatus::Filled,
                filled_price: response.price,
                filled_volume: response.volume,
                error_message: None,
                retcode: Some(response.retcode),
                reject_kind: None,
            },
            Ok(response) => OrderResult {
                order_id: response.order_id,
                status: OrderStatus::Rejected,
                filled_price: None,
                filled_volume: None,
                error_message: response.message,
                retcode: Some(response.retcode),
                reject_kind: Some(Self::reject_kind_of(response.retcode)),
            },
            Err(err) => {
                let mapped = self.blackout(CLASS_ORDERS, &err);
                let kind = if matches!(mapped, BrokerError::RateLimited { .. }) {
                    RejectKind::Connection
                } else {
                    RejectKind::Unknown
                };
                OrderResult::rejected(mapped.to_string(), kind)
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> bool {
        self.client.cancel_order(order_id).await.is_ok()
    }

    async fn get_order(&self, _order_id: &str) -> BrokerResult<Option<OrderResult>> {
        // The gateway exposes no standalone order-status lookup once an
        // order has settled into a position or vanished; callers rely on
        // `place_order`'s direct return for the outcome instead.
        Ok(None)
    }

    async fn open_orders(&self, _symbol: Option<&str>) -> BrokerResult<Vec<OrderResult>> {
        Ok(vec![])
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        if self.gate.is_blocked(CLASS_POSITIONS) {
            if let Some(cached) = self.positions_cache.get_stale(&()) {
                return Ok(cached);
            }
        }
        if let Some(cached) = self.positions_cache.get(&()) {
            return Ok(cached);
        }
        match self.client.positions().await {
            Ok(raws) => {
                let positions: Vec<Position> = raws.into_iter().map(Self::to_position).collect();
                self.positions_cache.set((), positions.clone(), POSITIONS_TTL);
                Ok(positions)
            }
            Err(err) => {
                let mapped = self.blackout(CLASS_POSITIONS, &err);
                if let BrokerError::RateLimited { .. } = mapped {
                    if let Some(cached) = self.positions_cache.get_stale(&()) {
                        return Ok(cached);
                    }
                }
                Err(mapped)
            }
        }
    }

    async fn position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
        let native = self.native_symbol(symbol, Side::Buy)?;
        Ok(self.positions().await?.into_iter().find(|p| p.symbol == native))
    }

    async fn close_position(&self, symbol: &str, size: Option<Decimal>) -> OrderResult {
        let native = match self.native_symbol(symbol, Side::Buy) {
            Ok(native) => native,
            Err(err) => return OrderResult::rejected(err.to_string(), RejectKind::Unknown),
        };
        let position_id = match self.client.position(&native).await {
            Ok(Some(p)) => p.id,
            Ok(None) => return OrderResult::rejected(format!("no open position for {symbol}"), RejectKind::Unknown),
            Err(err) => {
                return OrderResult::rejected(self.blackout(CLASS_POSITIONS, &err).to_string(), RejectKind::Unknown)
            }
        };
        match self.client.close_position(&position_id, size).await {
            Ok(response) => OrderResult {
                order_id: response.order_id,
                status: OrderStatus::Filled,
                filled_price: response.price,
                filled_volume: response.volume,
                error_message: None,
                retcode: Some(response.retcode),
                reject_kind: None,
            },
            Err(err) => OrderResult::rejected(self.blackout(CLASS_ORDERS, &err).to_string(), RejectKind::Unknown),
        }
    }

    async fn modify_position(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<bool> {
        let native = self.native_symbol(symbol, Side::Buy)?;
        let position_id = match self.client.position(&native).await {
            Ok(Some(p)) => p.id,
            Ok(None) => return Ok(false),
            Err(err) => return Err(self.blackout(CLASS_POSITIONS, &err)),
        };
        self.client
            .modify_position(&position_id, stop_loss, take_profit)
            .await
            .map(|_| true)
            .map_err(|err| self.blackout(CLASS_ORDERS, &err))
    }

    async fn can_trade_symbol(&self, symbol: &str, side: Side) -> Tradability {
        // Resolution failure is a metadata gap, not a hard block: don't stop
        // trading on a transient lookup error, just note it.
        let native = match self.native_symbol(symbol, side) {
            Ok(native) => native,
            Err(err) => {
                return Tradability {
                    tradable: true,
                    reason: format!("symbol resolution failed, assuming tradable: {err}"),
                    resolved_symbol: symbol.to_string(),
                }
            }
        };
        match self.client.symbol_spec(&native).await {
            Ok(raw) => {
                let tradable = match Self::trade_mode_of(raw.trade_mode.as_deref()) {
                    Some(TradeMode::Full) => true,
                    Some(TradeMode::LongOnly) => side == Side::Buy,
                    Some(TradeMode::ShortOnly) => side == Side::Sell,
                    Some(TradeMode::CloseOnly) | Some(TradeMode::Disabled) => false,
                    None => true,
                };
                Tradability {
                    tradable,
                    reason: if tradable {
                        "ok".to_string()
                    } else {
                        "trade mode disallows this side".to_string()
                    },
                    resolved_symbol: raw.symbol,
                }
            }
            Err(_) => Tradability {
                tradable: true,
                reason: "spec lookup failed, assuming tradable".to_string(),
                resolved_symbol: symbol.to_string(),
            },
        }
    }

    fn is_paper(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn no_money_retcode_maps_to_no_money_reject_kind() {
        assert_eq!(GatewayBroker::reject_kind_of(10019), RejectKind::NoMoney);
    }

    #[test]
    fn unmapped_retcode_falls_back_to_unknown() {
        assert_eq!(GatewayBroker::reject_kind_of(99999), RejectKind::Unknown);
    }

    #[test]
    fn long_only_trade_mode_blocks_sell_side() {
        let raw = GatewaySymbol {
            symbol: "EURUSD".to_string(),
            description: None,
            trade_mode: Some("LONGONLY".to_string()),
            point: None,
            tick_size: None,
            tick_value: None,
            contract_size: None,
            volume_min: None,
            volume_max: None,
            volume_step: None,
            stops_level: None,
            freeze_level: None,
            filling: vec![],
        };
        let spec = GatewayBroker::spec_of(raw);
        assert_eq!(spec.trade_mode, Some(TradeMode::LongOnly));
    }

    #[test]
    fn position_side_parses_case_insensitively() {
        let raw = GatewayPosition {
            id: "1".to_string(),
            symbol: "EURUSD".to_string(),
            side: "SELL".to_string(),
            volume: dec!(1),
            open_price: dec!(1.1),
            current_price: dec!(1.1),
            profit: dec!(0),
            stop_loss: None,
            take_profit: None,
            open_time: Utc::now(),
        };
        let position = GatewayBroker::to_position(raw);
        assert_eq!(position.side, Side::Sell);
    }

    #[test]
    fn native_symbol_matches_suffixed_broker_spelling_once_indexed() {
        let broker = GatewayBroker::new("http://gateway.local", "token", "acct-1");
        broker.resolver.index_symbols(vec!["EURUSD+".to_string()]);
        assert_eq!(broker.native_symbol("EUR_USD", Side::Buy).unwrap(), "EURUSD+");
    }

    #[test]
    fn native_symbol_fails_before_the_universe_is_indexed() {
        let broker = GatewayBroker::new("http://gateway.local", "token", "acct-1");
        assert!(broker.native_symbol("EUR_USD", Side::Buy).is_err());
    }
}
