//! Loose, platform-agnostic wire shapes. cTrader/DXtrade/MatchTrader each
//! return JSON with their own casing and nesting, so unlike the gateway and
//! OANDA adapters this one does not deserialize into fixed DTOs — it reads
//! `serde_json::Value` payloads through [`pick`], walking a list of
//! candidate paths the way the platform's own deep-attribute probing does.

use serde_json::Value;

/// The three REST platforms this adapter speaks. Each carries its own
/// default endpoint templates; callers may override individual templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    CTrader,
    DxTrade,
    MatchTrader,
}

impl Platform {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ctrader" => Some(Platform::CTrader),
            "dxtrade" => Some(Platform::DxTrade),
            "matchtrader" => Some(Platform::MatchTrader),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::CTrader => "ctrader",
            Platform::DxTrade => "dxtrade",
            Platform::MatchTrader => "matchtrader",
        }
    }
}

/// Per-platform endpoint templates. `{order_id}`, `{position_id}` and
/// `{symbol}` are substituted by the client before each request.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub login: &'static str,
    pub account: &'static str,
    pub positions: &'static str,
    pub symbols: &'static str,
    pub place_order: &'static str,
    pub order_template: &'static str,
    pub cancel_order_template: &'static str,
    pub close_position_template: &'static str,
    pub modify_position_template: &'static str,
    pub price_template: &'static str,
    pub prices: &'static str,
    pub candles_template: &'static str,
}

impl Endpoints {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::CTrader => Self {
                login: "/connect/token",
                account: "/api/account",
                positions: "/api/positions",
                symbols: "/api/symbols",
                place_order: "/api/orders",
                order_template: "/api/orders/{order_id}",
                cancel_order_template: "/api/orders/{order_id}",
                close_position_template: "/api/positions/{position_id}/close",
                modify_position_template: "/api/positions/{position_id}",
                price_template: "/api/prices/{symbol}",
                prices: "/api/prices",
                candles_template: "/api/candles/{symbol}",
            },
            Platform::DxTrade => Self {
                login: "/api/auth/login",
                account: "/api/v1/account",
                positions: "/api/v1/positions",
                symbols: "/api/v1/symbols",
                place_order: "/api/v1/orders",
                order_template: "/api/v1/orders/{order_id}",
                cancel_order_template: "/api/v1/orders/{order_id}",
                close_position_template: "/api/v1/positions/{position_id}/close",
                modify_position_template: "/api/v1/positions/{position_id}",
                price_template: "/api/v1/prices/{symbol}",
                prices: "/api/v1/prices",
                candles_template: "/api/v1/candles/{symbol}",
            },
            Platform::MatchTrader => Self {
                login: "/api/login",
                account: "/api/account",
                positions: "/api/positions",
                symbols: "/api/symbols",
                place_order: "/api/orders",
                order_template: "/api/orders/{order_id}",
                cancel_order_template: "/api/orders/{order_id}",
                close_position_template: "/api/positions/{position_id}/close",
                modify_position_template: "/api/positions/{position_id}",
                price_template: "/api/prices/{symbol}",
                prices: "/api/prices",
                candles_template: "/api/candles/{symbol}",
            },
        }
    }
}

/// Acceptable paths a login response might carry its bearer token under.
pub const TOKEN_KEYS: &[&str] = &[
    "access_token",
    "token",
    "jwt",
    "id_token",
    "sessionToken",
    "authToken",
    "data.access_token",
    "data.token",
    "data.jwt",
    "result.access_token",
    "result.token",
];

/// Walks `path` (dot-separated for nested objects) against `value` and
/// returns the first present key, trying each of `paths` in order. Every
/// deep-probing lookup in this adapter goes through this one helper.
pub fn pick<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    for path in paths {
        let mut current = value;
        let mut found = true;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found && !current.is_null() {
            return Some(current);
        }
    }
    None
}

pub fn pick_str(value: &Value, paths: &[&str]) -> Option<String> {
    pick(value, paths).and_then(|v| {
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else if v.is_number() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

pub fn pick_decimal(value: &Value, paths: &[&str]) -> Option<rust_decimal::Decimal> {
    pick_str(value, paths).and_then(|s| s.parse().ok())
}

/// A JSON payload that may be a bare array, or an object carrying the array
/// under one of several platform-specific keys.
pub fn pick_list<'a>(value: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    if let Some(array) = value.as_array() {
        return array.iter().collect();
    }
    for key in keys {
        if let Some(array) = pick(value, &[key]).and_then(|v| v.as_array()) {
            return array.iter().collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pick_tries_nested_paths_in_order() {
        let payload = json!({ "result": { "token": "abc123" } });
        assert_eq!(pick_str(&payload, TOKEN_KEYS).unwrap(), "abc123");
    }

    #[test]
    fn pick_prefers_earlier_path_when_both_present() {
        let payload = json!({ "access_token": "first", "token": "second" });
        assert_eq!(pick_str(&payload, TOKEN_KEYS).unwrap(), "first");
    }

    #[test]
    fn pick_list_unwraps_a_keyed_envelope() {
        let payload = json!({ "data": [ {"symbol": "EURUSD"} ] });
        let list = pick_list(&payload, &["data", "items"]);
        assert_eq!(list.len(), 1);
    }
}
