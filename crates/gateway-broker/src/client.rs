//! Thin HTTP wrapper around the MetaTrader gateway's REST API. Knows how to
//! authenticate and decode responses; has no opinion on caching or the
//! `broker_trait` shape — that translation lives in `lib.rs`.

use crate::models::*;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("gateway error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: String,
    token: String,
    account_id: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, account_id: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client builds");
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
            account_id: account_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/accounts/{}{}", self.base_url.trim_end_matches('/'), self.account_id, path)
    }

    async fn send<T: for<'de> serde::Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api { code, message });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))
    }

    pub async fn account(&self) -> Result<GatewayAccount, GatewayError> {
        self.send(self.http.get(self.url(""))).await
    }

    pub async fn symbols(&self) -> Result<Vec<GatewaySymbol>, GatewayError> {
        self.send(self.http.get(self.url("/symbols"))).await
    }

    pub async fn symbol_spec(&self, symbol: &str) -> Result<GatewaySymbol, GatewayError> {
        self.send(self.http.get(self.url(&format!("/symbols/{symbol}")))).await
    }

    pub async fn quote(&self, symbol: &str) -> Result<GatewayQuote, GatewayError> {
        self.send(self.http.get(self.url(&format!("/quotes/{symbol}")))).await
    }

    pub async fn quotes(&self, symbols: &[String]) -> Result<Vec<GatewayQuote>, GatewayError> {
        self.send(
            self.http
                .get(self.url("/quotes"))
                .query(&[("symbols", symbols.join(","))]),
        )
            .await
    }

    pub async fn candles(
        &self,
        symbol: &str,
        timeframe_code: &str,
        count: usize,
    ) -> Result<Vec<GatewayCandle>, GatewayError> {
        self.send(
            self.http.get(self.url(&format!("/candles/{symbol}"))).query(&[
                ("timeframe", timeframe_code.to_string()),
                ("count", count.to_string()),
            ]),
        )
            .await
    }

    pub async fn place_order(&self, order: GatewayOrderRequest) -> Result<GatewayOrderResponse, GatewayError> {
        self.send(self.http.post(self.url("/orders")).json(&order)).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.send::<serde_json::Value>(self.http.delete(self.url(&format!("/orders/{order_id}"))))
            .await?;
        Ok(())
    }

    pub async fn positions(&self) -> Result<Vec<GatewayPosition>, GatewayError> {
        self.send(self.http.get(self.url("/positions"))).await
    }

    pub async fn position(&self, symbol: &str) -> Result<Option<GatewayPosition>, GatewayError> {
        let all = self.positions().await?;
        Ok(all.into_iter().find(|p| p.symbol == symbol))
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        volume: Option<Decimal>,
    ) -> Result<GatewayOrderResponse, GatewayError> {
        let mut request = self.http.post(self.url(&format!("/positions/{position_id}/close")));
        if let Some(volume) = volume {
            request = request.json(&serde_json::json!({ "volume": volume }));
        }
        self.send(request).await
    }

    pub async fn modify_position(
        &self,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), GatewayError> {
        self.send::<serde_json::Value>(
            self.http
                .patch(self.url(&format!("/positions/{position_id}")))
                .json(&serde_json::json!({ "stopLoss": stop_loss, "takeProfit": take_profit })),
        )
            .await?;
        Ok(())
    }
}
