//! Generic REST adapter for broker platforms that expose a login-then-bearer
//! REST API but don't warrant their own dedicated crate: cTrader, DXtrade,
//! MatchTrader. The wire shape is read through loose JSON probing rather
//! than fixed DTOs, since field names and nesting vary across platforms.
//! Caching and rate-limit handling mirror the dedicated gateway adapter.

pub mod client;
pub mod models;

use async_trait::async_trait;
use broker_trait::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use client::{price_bid_ask, PlatformClient, PlatformError};
use futures_util::stream::BoxStream;
use models::{pick_decimal, pick_str, Platform};
use rate_limit_cache::{RateLimitGate, TtlCache};
use rust_decimal::Decimal;
use serde_json::{json, Value};
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

pub struct PlatformBroker {
    client: PlatformClient,
    account_cache: TtlCache<(), AccountInfo>,
    positions_cache: TtlCache<(), Vec<Position>>,
    price_cache: TtlCache<String, Tick>,
    gate: RateLimitGate,
    resolver: SymbolResolver,
    paper: bool,
}

impl PlatformBroker {
    pub fn new(
        platform: Platform,
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        password: impl Into<String>,
        server_name: impl Into<String>,
        paper: bool,
    ) -> Self {
        Self {
            client: PlatformClient::new(platform, base_url, account_id, password, server_name),
            account_cache: TtlCache::new(),
            positions_cache: TtlCache::new(),
            price_cache: TtlCache::new(),
            gate: RateLimitGate::new(),
            resolver: SymbolResolver::default(),
            paper,
        }
    }

    fn native_symbol(&self, canonical: &str, side: Side) -> BrokerResult<String> {
        match self.resolver.resolve(canonical, side) {
            Ok(native) => Ok(native),
            Err(ResolveError::NotFound { canonical }) => Err(BrokerError::SymbolNotFound(canonical)),
            Err(ResolveError::RecentlyFailed { canonical, .. }) => {
                Err(BrokerError::SymbolNotTradable(canonical, "recently failed to resolve".to_string()))
            }
        }
    }

    fn map_err(&self, class: &str, err: PlatformError) -> BrokerError {
        if let PlatformError::RateLimited { retry_after_secs } = err {
            self.gate.block_for(class, ChronoDuration::seconds(retry_after_secs.unwrap_or(30) as i64));
            return BrokerError::RateLimited { retry_after_secs };
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

    fn side_of(raw: &Value) -> Side {
        match pick_str(raw, &["side", "direction", "positionSide"]).as_deref() {
            Some(s) if s.eq_ignore_ascii_case("sell") || s.eq_ignore_ascii_case("short") => Side::Sell,
            _ => Side::Buy,
        }
    }

    fn tick_of(raw: &Value) -> Option<Tick> {
        let (bid, ask) = price_bid_ask(raw)?;
        let ts = pick_str(raw, &["time", "timestamp", "ts"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(Tick { bid, ask, ts })
    }

    fn position_of(raw: &Value) -> Option<Position> {
        Some(Position {
            symbol: pick_str(raw, &["symbol", "instrument"])?,
            side: Self::side_of(raw),
            volume: pick_decimal(raw, &["volume", "quantity", "size"])?,
            entry_price: pick_decimal(raw, &["openPrice", "entryPrice", "open_price"])?,
            current_price: pick_decimal(raw, &["currentPrice", "marketPrice", "current_price"])?,
            unrealized_pnl: pick_decimal(raw, &["profit", "unrealizedPnl", "pnl"]).unwrap_or_default(),
            stop_loss: pick_decimal(raw, &["stopLoss", "stop_loss"]),
            take_profit: pick_decimal(raw, &["takeProfit", "take_profit"]),
            opened_at: pick_str(raw, &["openTime", "open_time", "createdAt"])
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }

    fn position_id_of(raw: &Value) -> Option<String> {
        pick_str(raw, &["id", "positionId", "position_id"])
    }
}

#[async_trait]
impl BrokerAdapter for PlatformBroker {
    fn broker_name(&self) -> &str {
        match self.client.platform() {
            Platform::CTrader => "ctrader",
            Platform::DxTrade => "dxtrade",
            Platform::MatchTrader => "matchtrader",
        }
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.client
            .ensure_logged_in()
            .await
            .map_err(|err| self.map_err(CLASS_ACCOUNT_INFO, err))?;
        self.client.account().await.map_err(|err| self.map_err(CLASS_ACCOUNT_INFO, err))?;
        if let Ok(symbols) = self.client.symbols().await {
            let names: Vec<String> = symbols.iter().filter_map(|s| pick_str(s, &["symbol", "name"])).collect();
            tracing::debug!(count = names.len(), broker = self.broker_name(), "indexed platform symbol universe");
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
                    balance: pick_decimal(&raw, &["balance"]).unwrap_or_default(),
                    equity: pick_decimal(&raw, &["equity"]).unwrap_or_default(),
                    margin_used: pick_decimal(&raw, &["marginUsed", "margin_used", "usedMargin"]).unwrap_or_default(),
                    margin_available: pick_decimal(&raw, &["marginAvailable", "freeMargin", "free_margin"])
                        .unwrap_or_default(),
                    unrealized_pnl: pick_decimal(&raw, &["unrealizedPnl", "unrealized_pnl"]).unwrap_or_default(),
                    realized_pnl_today: pick_decimal(&raw, &["realizedPnlToday", "realized_pnl_today"])
                        .unwrap_or_default(),
                    currency: pick_str(&raw, &["currency"]).unwrap_or_else(|| "USD".to_string()),
                    leverage: pick_decimal(&raw, &["leverage"]).unwrap_or_default(),
                };
                self.account_cache.set((), info.clone(), ACCOUNT_INFO_TTL);
                Ok(info)
            }
            Err(err) => {
                let mapped = self.map_err(CLASS_ACCOUNT_INFO, err);
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
        let symbols = self.client.symbols().await.map_err(|err| self.map_err(CLASS_ACCOUNT_INFO, err))?;
        Ok(symbols
            .into_iter()
            .filter_map(|s| {
                Some(InstrumentRecord {
                    broker_symbol: pick_str(&s, &["symbol", "name"])?,
                    description: pick_str(&s, &["description", "displayName"]),
                })
            })
                .collect())
    }

    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<InstrumentSpec> {
        let Ok(_native) = self.native_symbol(symbol, Side::Buy) else {
            return Ok(InstrumentSpec::default());
        };
        // These platforms don't expose a dedicated per-symbol spec endpoint
        // in their default template set; callers fall back to broker minima
        // enforced by the order pipeline instead.
        Ok(InstrumentSpec::default())
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
        match self.client.price(&native).await {
            Ok(raw) => match Self::tick_of(&raw) {
                Some(tick) => {
                    self.price_cache.set(symbol.to_string(), tick, PRICES_TTL);
                    Ok(tick)
                }
                None => Err(BrokerError::Transport("price response missing bid/ask".to_string())),
            },
            Err(err) => {
                let mapped = self.map_err(CLASS_PRICES, err);
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
        let natives: Vec<String> = symbols
            .iter()
            .filter_map(|s| self.native_symbol(s, Side::Buy).ok())
            .collect();
        let mut out = HashMap::new();
        match self.client.prices(&natives).await {
            Ok(raws) => {
                for raw in raws {
                    let Some(symbol) = pick_str(&raw, &["symbol", "instrument"]) else { continue };
                    if let Some(tick) = Self::tick_of(&raw) {
                        self.price_cache.set(symbol.clone(), tick, PRICES_TTL);
                        out.insert(symbol, tick);
                    }
                }
            }
            Err(err) => {
                self.map_err(CLASS_PRICES, err);
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
        // No native push feed on any of these platforms; poll on a
        // round-robin cycle like the dedicated gateway adapter does.
        let client = self.client.clone();
        Box::pin(futures_util::stream::unfold((client, symbols, 0usize), |(client, symbols, idx)| async move {
            if symbols.is_empty() {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            let symbol = symbols[idx % symbols.len()].clone();
            let result = client
                .price(&symbol)
                .await
                .ok()
                .and_then(|raw| Self::tick_of(&raw))
                .ok_or_else(|| BrokerError::Transport(format!("failed to poll price for {symbol}")));
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
            .map_err(|err| self.map_err(CLASS_PRICES, err))?;
        Ok(raws
            .into_iter()
            .filter_map(|c| {
                Some(Candle {
                    time: pick_str(&c, &["time", "timestamp"])
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc))?,
                    open: pick_decimal(&c, &["open", "o"])?,
                    high: pick_decimal(&c, &["high", "h"])?,
                    low: pick_decimal(&c, &["low", "l"])?,
                    close: pick_decimal(&c, &["close", "c"])?,
                    volume: pick_decimal(&c, &["volume", "v"]).unwrap_or_default(),
                })
            })
                .collect())
    }

    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.gate.is_blocked(CLASS_ORDERS) {
            return OrderResult::rejected("orders endpoint in rate-limit blackout", RejectKind::Connection);
        }
        let native = match self.native_symbol(&request.symbol, request.side) {
            Ok(native) => native,
            Err(err) => return OrderResult::rejected(err.to_string(), RejectKind::Unknown),
        };
        let body = json!({
            "symbol": native,
            "side": match request.side { Side::Buy => "buy", Side::Sell => "sell" },
            "volume": request.volume,
            "stopLoss": request.stop_loss,
            "takeProfit": request.take_profit,
            "clientOrderId": request.client_order_id,
        });
        match self.client.place_order(body).await {
            Ok(raw) => {
                let status_str = pick_str(&raw, &["status", "state"]).unwrap_or_default();
                let filled = status_str.eq_ignore_ascii_case("filled") || status_str.eq_ignore_ascii_case("executed");
                OrderResult {
                    order_id: pick_str(&raw, &["orderId", "id", "order_id"]),
                    status: if filled { OrderStatus::Filled } else { OrderStatus::Rejected },
                    filled_price: pick_decimal(&raw, &["fillPrice", "price", "executedPrice"]),
                    filled_volume: pick_decimal(&raw, &["filledVolume", "volume"]),
                    error_message: pick_str(&raw, &["message", "error", "reason"]),
                    retcode: None,
                    reject_kind: if filled { None } else { Some(RejectKind::Unknown) },
                }
            }
            Err(err) => {
                let mapped = self.map_err(CLASS_ORDERS, err);
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
                let positions: Vec<Position> = raws.iter().filter_map(Self::position_of).collect();
                self.positions_cache.set((), positions.clone(), POSITIONS_TTL);
                Ok(positions)
            }
            Err(err) => {
                let mapped = self.map_err(CLASS_POSITIONS, err);
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
        let raws = match self.client.positions().await {
            Ok(raws) => raws,
            Err(err) => return OrderResult::rejected(self.map_err(CLASS_POSITIONS, err).to_string(), RejectKind::Unknown),
        };
        let Some(position_id) = raws
            .iter()
            .find(|p| pick_str(p, &["symbol", "instrument"]).as_deref() == Some(native.as_str()))
            .and_then(Self::position_id_of)
        else {
            return OrderResult::rejected(format!("no open position for {symbol}"), RejectKind::Unknown);
        };
        match self.client.close_position(&position_id, size).await {
            Ok(raw) => OrderResult {
                order_id: pick_str(&raw, &["orderId", "id"]),
                status: OrderStatus::Filled,
                filled_price: pick_decimal(&raw, &["fillPrice", "price"]),
                filled_volume: pick_decimal(&raw, &["filledVolume", "volume"]),
                error_message: None,
                retcode: None,
                reject_kind: None,
            },
            Err(err) => OrderResult::rejected(self.map_err(CLASS_ORDERS, err).to_string(), RejectKind::Unknown),
        }
    }

    async fn modify_position(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> BrokerResult<bool> {
        let native = self.native_symbol(symbol, Side::Buy)?;
        let raws = self.client.positions().await.map_err(|err| self.map_err(CLASS_POSITIONS, err))?;
        let Some(position_id) = raws
            .iter()
            .find(|p| pick_str(p, &["symbol", "instrument"]).as_deref() == Some(native.as_str()))
            .and_then(Self::position_id_of)
        else {
            return Ok(false);
        };
        self.client
            .modify_position(&position_id, stop_loss, take_profit)
            .await
            .map(|_| true)
            .map_err(|err| self.map_err(CLASS_ORDERS, err))
    }

    async fn can_trade_symbol(&self, symbol: &str, side: Side) -> Tradability {
        match self.native_symbol(symbol, side) {
            Ok(native) => Tradability {
                tradable: true,
                reason: "ok".to_string(),
                resolved_symbol: native,
            },
            Err(err) => Tradability {
                tradable: true,
                reason: format!("symbol resolution failed, assuming tradable: {err}"),
                resolved_symbol: symbol.to_string(),
            },
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
    use serde_json::json;

    #[test]
    fn side_of_reads_short_alias() {
        let raw = json!({ "direction": "SHORT" });
        assert_eq!(PlatformBroker::side_of(&raw), Side::Sell);
    }

    #[test]
    fn side_of_defaults_to_buy() {
        let raw = json!({});
        assert_eq!(PlatformBroker::side_of(&raw), Side::Buy);
    }

    #[test]
    fn tick_of_reads_bid_ask_and_falls_back_on_missing_time() {
        let raw = json!({ "bid": "1.1000", "ask": "1.1002" });
        let tick = PlatformBroker::tick_of(&raw).unwrap();
        assert_eq!(tick.bid, dec!(1.1000));
        assert_eq!(tick.ask, dec!(1.1002));
    }

    #[test]
    fn position_of_requires_symbol_and_volume() {
        let raw = json!({ "symbol": "EURUSD", "volume": "1.0", "openPrice": "1.1", "currentPrice": "1.1" });
        assert!(PlatformBroker::position_of(&raw).is_some());
        assert!(PlatformBroker::position_of(&json!({})).is_none());
    }

    #[test]
    fn native_symbol_fails_before_the_universe_is_indexed() {
        let broker = PlatformBroker::new(
            Platform::CTrader,
            "http://platform.local",
            "acct-1",
            "secret",
            "demo.server",
            true,
        );
        assert!(broker.native_symbol("EUR_USD", Side::Buy).is_err());
    }

    #[test]
    fn native_symbol_matches_suffixed_broker_spelling_once_indexed() {
        let broker = PlatformBroker::new(
            Platform::DxTrade,
            "http://platform.local",
            "acct-1",
            "secret",
            "demo.server",
            true,
        );
        broker.resolver.index_symbols(vec!["EURUSDm".to_string()]);
        assert_eq!(broker.native_symbol("EUR_USD", Side::Buy).unwrap(), "EURUSDm");
    }
}
