//! Wire DTOs for the OANDA v20 REST and streaming APIs. Kept a close mirror
//! of OANDA's own JSON shape; `lib.rs` owns translation into `broker_trait`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct OandaAccountEnvelope {
    pub account: OandaAccount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaAccount {
    pub balance: Decimal,
    #[serde(rename = "NAV")]
    pub nav: Decimal,
    #[serde(rename = "marginUsed")]
    pub margin_used: Decimal,
    #[serde(rename = "marginAvailable")]
    pub margin_available: Decimal,
    #[serde(rename = "unrealizedPL")]
    pub unrealized_pl: Decimal,
    pub pl: Decimal,
    pub currency: String,
    #[serde(rename = "marginRate")]
    pub margin_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaInstrumentsEnvelope {
    pub instruments: Vec<OandaInstrument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaInstrument {
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(rename = "pipLocation")]
    pub pip_location: i32,
    #[serde(rename = "marginRate")]
    pub margin_rate: Option<Decimal>,
    #[serde(rename = "minimumTradeSize")]
    pub minimum_trade_size: Option<Decimal>,
    #[serde(rename = "maximumOrderUnits")]
    pub maximum_order_units: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPriceBucket {
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPrice {
    pub instrument: String,
    pub bids: Vec<OandaPriceBucket>,
    pub asks: Vec<OandaPriceBucket>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPricingEnvelope {
    pub prices: Vec<OandaPrice>,
}

/// One line of the `pricingStream` feed. OANDA interleaves `PRICE` events
/// with periodic `HEARTBEAT` lines sharing only the `type` tag — callers
/// must discard anything that isn't `type == "PRICE"`.
#[derive(Debug, Clone, Deserialize)]
pub struct OandaStreamLine {
    #[serde(rename = "type")]
    pub event_type: String,
    pub instrument: Option<String>,
    pub bids: Option<Vec<OandaPriceBucket>>,
    pub asks: Option<Vec<OandaPriceBucket>>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaCandleMid {
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaCandle {
    pub time: DateTime<Utc>,
    pub volume: Decimal,
    pub mid: OandaCandleMid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaCandlesEnvelope {
    pub candles: Vec<OandaCandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OandaOrderClientExtensions {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OandaOnFill {
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OandaOrderSpec {
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub instrument: String,
    pub units: String,
    #[serde(rename = "timeInForce")]
    pub time_in_force: &'static str,
    #[serde(rename = "stopLossOnFill", skip_serializing_if = "Option::is_none")]
    pub stop_loss_on_fill: Option<OandaOnFill>,
    #[serde(rename = "takeProfitOnFill", skip_serializing_if = "Option::is_none")]
    pub take_profit_on_fill: Option<OandaOnFill>,
    #[serde(rename = "clientExtensions", skip_serializing_if = "Option::is_none")]
    pub client_extensions: Option<OandaOrderClientExtensions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OandaOrderRequestEnvelope {
    pub order: OandaOrderSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaTradeOpened {
    #[serde(rename = "tradeID")]
    pub trade_id: String,
    pub units: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaOrderFillTransaction {
    pub id: String,
    #[serde(rename = "tradeOpened")]
    pub trade_opened: Option<OandaTradeOpened>,
    pub price: Option<Decimal>,
    pub units: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaOrderRejectTransaction {
    #[serde(rename = "rejectReason")]
    pub reject_reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OandaOrderCreateResponse {
    #[serde(rename = "orderFillTransaction")]
    pub order_fill_transaction: Option<OandaOrderFillTransaction>,
    #[serde(rename = "orderRejectTransaction")]
    pub order_reject_transaction: Option<OandaOrderRejectTransaction>,
    #[serde(rename = "orderCancelTransaction")]
    pub order_cancel_transaction: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPositionSide {
    pub units: Decimal,
    #[serde(rename = "averagePrice", default)]
    pub average_price: Decimal,
    #[serde(rename = "unrealizedPL", default)]
    pub unrealized_pl: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPosition {
    pub instrument: String,
    pub long: OandaPositionSide,
    pub short: OandaPositionSide,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OandaPositionsEnvelope {
    pub positions: Vec<OandaPosition>,
}
