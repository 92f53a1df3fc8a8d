//! OANDA v20 adapter : REST for account/instrument/order calls plus
//! the native line-delimited streaming endpoint for live prices. Canonical
//! symbols (`EURUSD`) translate to OANDA's underscored native form
//! (`EUR_USD`) through a static map with an underscore-insertion fallback
//! for anything not in the table.

pub mod client;
pub mod models;

use async_trait::async_trait;
use broker_trait::*;
use chrono::{DateTime, Utc};
use client::{OandaClient, OandaError};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use models::{OandaOnFill, OandaOrderClientExtensions, OandaOrderSpec, OandaPosition, OandaStreamLine};
use rate_limit_cache::{RateLimitGate, TtlCache};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

const ACCOUNT_INFO_TTL: chrono::Duration = chrono::Duration::seconds(30);
const POSITIONS_TTL: chrono::Duration = chrono::Duration::seconds(15);
const PRICES_TTL: chrono::Duration = chrono::Duration::seconds(8);

const CLASS_ACCOUNT_INFO: &str = "account_info";
const CLASS_POSITIONS: &str = "positions";
const CLASS_PRICES: &str = "prices";
const CLASS_ORDERS: &str = "orders";

/// Canonical symbol -> OANDA native instrument name. Anything absent falls
/// back to `insert_underscore`, which handles the common 6-letter FX case.
const SYMBOL_MAP: &[(&str, &str)] = &[
    ("EURUSD", "EUR_USD"),
    ("GBPUSD", "GBP_USD"),
    ("USDJPY", "USD_JPY"),
    ("USDCHF", "USD_CHF"),
    ("AUDUSD", "AUD_USD"),
    ("USDCAD", "USD_CAD"),
    ("NZDUSD", "NZD_USD"),
    ("EURGBP", "EUR_GBP"),
    ("EURJPY", "EUR_JPY"),
    ("XAUUSD", "XAU_USD"),
    ("XAGUSD", "XAG_USD"),
];

fn to_native_symbol(canonical: &str) -> String {
    if let Some((_, native)) = SYMBOL_MAP.iter().find(|(c, _)| *c == canonical) {
        return native.to_string();
    }
    if canonical.len() == 6 && canonical.chars().all(|c| c.is_ascii_uppercase()) {
        return format!("{}_{}", &canonical[..3], &canonical[3..]);
    }
    canonical.to_string()
}

fn to_canonical_symbol(native: &str) -> String {
    if let Some((canonical, _)) = SYMBOL_MAP.iter().find(|(_, n)| *n == native) {
        return canonical.to_string();
    }
    native.replace('_', "")
}

fn to_granularity(tf: Timeframe) -> &'static str {
    match tf {
        Timeframe::M1 => "M1",
        Timeframe::M5 => "M5",
        Timeframe::M15 => "M15",
        Timeframe::M30 => "M30",
        Timeframe::H1 => "H1",
        Timeframe::H4 => "H4",
        Timeframe::D1 => "D",
    }
}

pub struct OandaBroker {
    client: OandaClient,
    account_cache: TtlCache<(), AccountInfo>,
    positions_cache: TtlCache<(), Vec<Position>>,
    price_cache: TtlCache<String, Tick>,
    gate: RateLimitGate,
}

impl OandaBroker {
    pub fn new(
        base_url: impl Into<String>,
        stream_url: impl Into<String>,
        token: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            client: OandaClient::new(base_url, stream_url, token, account_id),
            account_cache: TtlCache::new(),
            positions_cache: TtlCache::new(),
            price_cache: TtlCache::new(),
            gate: RateLimitGate::new(),
        }
    }

    fn blackout(&self, class: &str, err: &OandaError) -> BrokerError {
        if let OandaError::RateLimited { retry_after_secs } = err {
            self.gate
                .block_for(class, chrono::Duration::seconds(retry_after_secs.unwrap_or(30) as i64));
            return BrokerError::RateLimited {
                retry_after_secs: *retry_after_secs,
            };
        }
        BrokerError::Transport(err.to_string())
    }

    fn tick_of(price: &models::OandaPrice) -> Option<Tick> {
        let bid = price.bids.first()?.price;
        let ask = price.asks.first()?.price;
        Some(Tick {
            bid,
            ask,
            ts: price.time,
        })
    }

    fn tick_of_stream_line(line: &OandaStreamLine) -> Option<Tick> {
        let bid = line.bids.as_ref()?.first()?.price;
        let ask = line.asks.as_ref()?.first()?.price;
        Some(Tick {
            bid,
            ask,
            ts: line.time?,
        })
    }

    fn position_of(native: &OandaPosition) -> Option<Position> {
        let symbol = to_canonical_symbol(&native.instrument);
        if native.long.units != Decimal::ZERO {
            return Some(Position {
                symbol,
                side: Side::Buy,
                volume: native.long.units,
                entry_price: native.long.average_price,
                current_price: native.long.average_price,
                unrealized_pnl: native.long.unrealized_pl,
                stop_loss: None,
                take_profit: None,
                opened_at: Utc::now(),
            });
        }
        if native.short.units != Decimal::ZERO {
            return Some(Position {
                symbol,
                side: Side::Sell,
                volume: native.short.units.abs(),
                entry_price: native.short.average_price,
                current_price: native.short.average_price,
                unrealized_pnl: native.short.unrealized_pl,
                stop_loss: None,
                take_profit: None,
                opened_at: Utc::now(),
            });
        }
        None
    }
}

#[async_trait]
impl BrokerAdapter for OandaBroker {
    fn broker_name(&self) -> &str {
        "oanda-v20"
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.client
            .account()
            .await
            .map(|_| ())
            .map_err(|err| self.blackout(CLASS_ACCOUNT_INFO, &err))
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
                let leverage = if raw.margin_rate.is_zero() {
                    Decimal::from(1)
                } else {
                    Decimal::from(1) / raw.margin_rate
                };
                let info = AccountInfo {
                    balance: raw.balance,
                    equity: raw.nav,
                    margin_used: raw.margin_used,
                    margin_available: raw.margin_available,
                    unrealized_pnl: raw.unrealized_pl,
                    realized_pnl_today: raw.pl,
                    currency: raw.currency,
                    leverage,
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
        let raws = self
            .client
            .instruments()
            .await
            .map_err(|err| self.blackout(CLASS_ACCOUNT_INFO, &err))?;
        Ok(raws
            .into_iter()
            .map(|i| InstrumentRecord {
                broker_symbol: to_canonical_symbol(&i.name),
                description: i.display_name,
            })
                .collect())
    }

    async fn symbol_spec(&self, symbol: &str) -> BrokerResult<InstrumentSpec> {
        let native = to_native_symbol(symbol);
        let raws = self
            .client
            .instruments()
            .await
            .map_err(|err| self.blackout(CLASS_ACCOUNT_INFO, &err))?;
        let Some(found) = raws.into_iter().find(|i| i.name == native) else {
            return Ok(InstrumentSpec::default());
        };
        Ok(InstrumentSpec {
            point_size: Some(Decimal::new(1, found.pip_location.unsigned_abs())),
            tick_size: None,
            tick_value: None,
            contract_size: Some(Decimal::from(1)),
            min_volume: found.minimum_trade_size,
            max_volume: found.maximum_order_units,
            volume_step: None,
            stops_level: None,
            freeze_level: None,
            filling_modes: vec!["FOK".to_string()],
            trade_mode: Some(TradeMode::Full),
        })
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
        let native = to_native_symbol(symbol);
        match self.client.pricing(&[native]).await {
            Ok(raws) => {
                let Some(tick) = raws.first().and_then(Self::tick_of) else {
                    return Err(BrokerError::SymbolNotFound(symbol.to_string()));
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
        let natives: Vec<String> = symbols.iter().map(|s| to_native_symbol(s)).collect();
        let mut out = HashMap::new();
        match self.client.pricing(&natives).await {
            Ok(raws) => {
                for raw in &raws {
                    if let Some(tick) = Self::tick_of(raw) {
                        let canonical = to_canonical_symbol(&raw.instrument);
                        self.price_cache.set(canonical.clone(), tick, PRICES_TTL);
                        out.insert(canonical, tick);
                    }
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
        let natives: Vec<String> = symbols.iter().map(|s| to_native_symbol(s)).collect();
        let client = self.client.clone();
        let state = PriceStreamState::Disconnected {
            client,
            natives,
            backoff: Duration::from_secs(1),
        };
        Box::pin(futures_util::stream::unfold(state, price_stream_step))
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        _from: Option<DateTime<Utc>>,
        _to: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<Candle>> {
        let native = to_native_symbol(symbol);
        let raws = self
            .client
            .candles(&native, to_granularity(timeframe), count)
            .await
            .map_err(|err| self.blackout(CLASS_PRICES, &err))?;
        Ok(raws
            .into_iter()
            .map(|c| Candle {
                time: c.time,
                open: c.mid.o,
                high: c.mid.h,
                low: c.mid.l,
                close: c.mid.c,
                volume: c.volume,
            })
                .collect())
    }

    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.gate.is_blocked(CLASS_ORDERS) {
            return OrderResult::rejected("orders endpoint in rate-limit blackout", RejectKind::Connection);
        }
        let native = to_native_symbol(&request.symbol);
        let signed_units = match request.side {
            Side::Buy => request.volume,
            Side::Sell => -request.volume,
        };
        let spec = OandaOrderSpec {
            order_type: "MARKET",
            instrument: native,
            units: signed_units.to_string(),
            time_in_force: "FOK",
            stop_loss_on_fill: request.stop_loss.map(|price| OandaOnFill { price }),
            take_profit_on_fill: request.take_profit.map(|price| OandaOnFill { price }),
            client_extensions: request
                .client_order_id
                .map(|id| OandaOrderClientExtensions { id }),
        };
        match self.client.create_order(spec).await {
            Ok(response) => {
                if let Some(reject) = response.order_reject_transaction {
                    return OrderResult::rejected(reject.reject_reason.clone(), reject_kind_of(&reject.reject_reason));
                }
                if let Some(fill) = response.order_fill_transaction {
                    let (order_id, price, units) = match &fill.trade_opened {
                        Some(trade) => (Some(trade.trade_id.clone()), Some(trade.price), Some(trade.units)),
                        None => (Some(fill.id.clone()), fill.price, fill.units),
                    };
                    return OrderResult {
                        order_id,
                        status: OrderStatus::Filled,
                        filled_price: price,
                        filled_volume: units.map(|u| u.abs()),
                        error_message: None,
                        retcode: None,
                        reject_kind: None,
                    };
                }
                OrderResult::rejected("order accepted but not filled (cancelled before fill)", RejectKind::Timeout)
            }
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
        Ok(self.positions().await?.into_iter().find(|p| p.symbol == symbol))
    }

    async fn close_position(&self, symbol: &str, size: Option<Decimal>) -> OrderResult {
        let native = to_native_symbol(symbol);
        let position = match self.client.positions().await {
            Ok(raws) => raws.into_iter().find(|p| p.instrument == native),
            Err(err) => return OrderResult::rejected(self.blackout(CLASS_POSITIONS, &err).to_string(), RejectKind::Unknown),
        };
        let Some(position) = position else {
            return OrderResult::rejected(format!("no open position for {symbol}"), RejectKind::Unknown);
        };
        let is_long = position.long.units != Decimal::ZERO;
        let units = size.map(|s| s.to_string()).unwrap_or_else(|| "ALL".to_string());
        let (long_units, short_units) = if is_long {
            (Some(units), None)
        } else {
            (None, Some(units))
        };
        match self.client.close_position(&native, long_units, short_units).await {
            Ok(response) => {
                if let Some(reject) = response.order_reject_transaction {
                    return OrderResult::rejected(reject.reject_reason.clone(), reject_kind_of(&reject.reject_reason));
                }
                OrderResult {
                    order_id: response.order_fill_transaction.as_ref().map(|f| f.id.clone()),
                    status: OrderStatus::Filled,
                    filled_price: response.order_fill_transaction.as_ref().and_then(|f| f.price),
                    filled_volume: response.order_fill_transaction.as_ref().and_then(|f| f.units),
                    error_message: None,
                    retcode: None,
                    reject_kind: None,
                }
            }
            Err(err) => OrderResult::rejected(self.blackout(CLASS_ORDERS, &err).to_string(), RejectKind::Unknown),
        }
    }

    async fn modify_position(
        &self,
        _symbol: &str,
        _stop_loss: Option<Decimal>,
        _take_profit: Option<Decimal>,
    ) -> BrokerResult<bool> {
        // OANDA attaches protective orders per-trade, not per-position; a
        // position opened through `place_order`'s *OnFill fields already
        // carries them. Modifying after the fact needs the trade id, which
        // this adapter does not track — callers should close and reopen.
        Ok(false)
    }

    async fn can_trade_symbol(&self, symbol: &str, _side: Side) -> Tradability {
        let native = to_native_symbol(symbol);
        match self.client.instruments().await {
            Ok(raws) => {
                let tradable = raws.iter().any(|i| i.name == native);
                Tradability {
                    tradable,
                    reason: if tradable {
                        "ok".to_string()
                    } else {
                        "instrument not listed on this account".to_string()
                    },
                    resolved_symbol: native,
                }
            }
            Err(_) => Tradability {
                tradable: true,
                reason: "instrument lookup failed, assuming tradable".to_string(),
                resolved_symbol: native,
            },
        }
    }

    fn is_paper(&self) -> bool {
        false
    }
}

fn reject_kind_of(reason: &str) -> RejectKind {
    match reason {
        "INSUFFICIENT_MARGIN" | "INSUFFICIENT_FUNDS" => RejectKind::NoMoney,
        "MARKET_HALTED" | "INSTRUMENT_STOPPED_TRADING" | "TRADING_DISABLED" => RejectKind::Connection,
        "TAKE_PROFIT_ON_FILL_LOSS" | "STOP_LOSS_ON_FILL_LOSS" | "PRICE_PRECISION_EXCEEDED" => RejectKind::InvalidStops,
        "TIME_IN_FORCE_GTD_TIMESTAMP_IN_PAST" => RejectKind::Timeout,
        _ => RejectKind::Unknown,
    }
}

const PRICE_STREAM_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// State for the reconnecting `pricing/stream` feed: either waiting to
/// (re)open a connection or holding one open and pulling lines from it.
/// Backoff resets to one second as soon as a connection is established and
/// doubles, capped, on every transport failure.
enum PriceStreamState {
    Disconnected {
        client: OandaClient,
        natives: Vec<String>,
        backoff: Duration,
    },
    Connected {
        client: OandaClient,
        natives: Vec<String>,
        stream: Pin<Box<dyn Stream<Item = Result<OandaStreamLine, OandaError>> + Send>>,
    },
}

async fn price_stream_step(mut state: PriceStreamState) -> Option<(BrokerResult<Tick>, PriceStreamState)> {
    loop {
        state = match state {
            PriceStreamState::Disconnected { client, natives, backoff } => {
                if natives.is_empty() {
                    return None;
                }
                match client.pricing_stream(&natives).await {
                    Ok(stream) => PriceStreamState::Connected {
                        client,
                        natives,
                        stream: Box::pin(stream),
                    },
                    Err(err) => {
                        tokio::time::sleep(backoff).await;
                        let next_backoff = (backoff * 2).min(PRICE_STREAM_MAX_BACKOFF);
                        return Some((
                            Err(BrokerError::Transport(err.to_string())),
                            PriceStreamState::Disconnected {
                                client,
                                natives,
                                backoff: next_backoff,
                            },
                        ));
                    }
                }
            }
            PriceStreamState::Connected { client, natives, mut stream } => match stream.next().await {
                Some(Ok(line)) => {
                    if line.event_type != "PRICE" {
                        PriceStreamState::Connected { client, natives, stream }
                    } else if let Some(tick) = OandaBroker::tick_of_stream_line(&line) {
                        return Some((Ok(tick), PriceStreamState::Connected { client, natives, stream }));
                    } else {
                        PriceStreamState::Connected { client, natives, stream }
                    }
                }
                Some(Err(err)) => {
                    return Some((
                        Err(BrokerError::Transport(err.to_string())),
                        PriceStreamState::Disconnected {
                            client,
                            natives,
                            backoff: Duration::from_secs(1),
                        },
                    ));
                }
                None => {
                    return Some((
                        Err(BrokerError::Transport("price stream ended".to_string())),
                        PriceStreamState::Disconnected {
                            client,
                            natives,
                            backoff: Duration::from_secs(1),
                        },
                    ));
                }
            },
        };
    }
}
