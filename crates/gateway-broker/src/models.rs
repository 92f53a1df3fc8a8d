//! Wire DTOs for the MetaTrader gateway's JSON REST API. Field names mirror
//! the gateway's own camelCase convention; translation into `broker_trait`
//! types happens entirely in `lib.rs` so this module stays a dumb mirror of
//! the wire format.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayAccount {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    #[serde(rename = "freeMargin")]
    pub free_margin: Decimal,
    #[serde(rename = "unrealizedPnl", default)]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "realizedPnlToday", default)]
    pub realized_pnl_today: Decimal,
    pub currency: String,
    pub leverage: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySymbol {
    pub symbol: String,
    pub description: Option<String>,
    #[serde(rename = "tradeMode")]
    pub trade_mode: Option<String>,
    pub point: Option<Decimal>,
    #[serde(rename = "tickSize")]
    pub tick_size: Option<Decimal>,
    #[serde(rename = "tickValue")]
    pub tick_value: Option<Decimal>,
    #[serde(rename = "contractSize")]
    pub contract_size: Option<Decimal>,
    #[serde(rename = "volumeMin")]
    pub volume_min: Option<Decimal>,
    #[serde(rename = "volumeMax")]
    pub volume_max: Option<Decimal>,
    #[serde(rename = "volumeStep")]
    pub volume_step: Option<Decimal>,
    #[serde(rename = "stopsLevel")]
    pub stops_level: Option<Decimal>,
    #[serde(rename = "freezeLevel")]
    pub freeze_level: Option<Decimal>,
    #[serde(default)]
    pub filling: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCandle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayActionType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayOrderRequest {
    pub symbol: String,
    #[serde(rename = "actionType")]
    pub action_type: GatewayActionType,
    pub volume: Decimal,
    #[serde(rename = "stopLoss", skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(rename = "takeProfit", skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
    pub retcode: i32,
    pub message: Option<String>,
    pub price: Option<Decimal>,
    pub volume: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPosition {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: String,
    pub volume: Decimal,
    #[serde(rename = "openPrice")]
    pub open_price: Decimal,
    #[serde(rename = "currentPrice")]
    pub current_price: Decimal,
    pub profit: Decimal,
    #[serde(rename = "stopLoss")]
    pub stop_loss: Option<Decimal>,
    #[serde(rename = "takeProfit")]
    pub take_profit: Option<Decimal>,
    #[serde(rename = "openTime")]
    pub open_time: DateTime<Utc>,
}
