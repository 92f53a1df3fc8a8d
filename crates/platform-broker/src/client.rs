//! Thin HTTP wrapper around a generic REST trading platform (cTrader,
//! DXtrade, MatchTrader). Unlike `gateway-broker`/`oanda-broker`, the wire
//! shape isn't fixed: endpoints are looked up from a per-platform template
//! table and responses are read as loose JSON through [`pick`]. Login is
//! lazy — the first request that needs a token triggers it — and a 401/403
//! on an authenticated request clears the token and retries once after a
//! fresh login.

use crate::models::{pick_decimal, pick_list, pick_str, Endpoints, Platform, TOKEN_KEYS};
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("platform error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("login did not yield a bearer token")]
    NoToken,
}

#[derive(Clone)]
pub struct PlatformClient {
    http: Client,
    base_url: String,
    platform: Platform,
    endpoints: Endpoints,
    account_id: String,
    password: String,
    server_name: String,
    token: Arc<Mutex<Option<String>>>,
}

impl PlatformClient {
    pub fn new(
        platform: Platform,
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        password: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client builds");
        Self {
            http,
            base_url: base_url.into(),
            platform,
            endpoints: Endpoints::for_platform(platform),
            account_id: account_id.into(),
            password: password.into(),
            server_name: server_name.into(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.account_id, self.password);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }

    /// Logs in, extracting a bearer token from the first present path in
    /// `TOKEN_KEYS`. Before a token exists, requests authenticate with Basic
    /// auth against the account id and password instead.
    async fn login(&self) -> Result<String, PlatformError> {
        let body = json!({
            "accountId": self.account_id,
            "password": self.password,
            "server": self.server_name,
        });
        let response = self
            .http
            .post(self.url(self.endpoints.login))
            .header("Authorization", self.basic_auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(PlatformError::Api { code, message });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        pick_str(&payload, TOKEN_KEYS).ok_or(PlatformError::NoToken)
    }

    async fn auth_header(&self) -> Result<(String, String), PlatformError> {
        let guard = self.token.lock().await;
        match guard.as_ref() {
            Some(token) => Ok(("Authorization".to_string(), format!("Bearer {token}"))),
            None => Ok(("Authorization".to_string(), self.basic_auth_header())),
        }
    }

    /// Sends `request`, retrying once after a fresh login if the server
    /// responds 401/403 and a token had been in use.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, PlatformError> {
        self.send_inner(method, path, query, body, true).await
    }

    async fn send_inner(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        retry_auth: bool,
    ) -> Result<Value, PlatformError> {
        let (header_name, header_value) = self.auth_header().await?;
        let mut builder = self.http.request(method.clone(), self.url(path)).header(header_name.as_str(), header_value);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| PlatformError::Transport(err.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(PlatformError::RateLimited { retry_after_secs });
        }

        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN {
            let had_token = self.token.lock().await.is_some();
            if retry_auth && had_token {
                *self.token.lock().await = None;
                let fresh = self.login().await?;
                *self.token.lock().await = Some(fresh);
                return Box::pin(self.send_inner(method, path, query, body, false)).await;
            }
        }

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(PlatformError::Api { code, message });
        }

        response.json().await.map_err(|err| PlatformError::Transport(err.to_string()))
    }

    /// Ensures a token is present before the first authenticated call of a
    /// session; cheap no-op once one has been obtained.
    pub async fn ensure_logged_in(&self) -> Result<(), PlatformError> {
        if self.token.lock().await.is_some() {
            return Ok(());
        }
        let fresh = self.login().await?;
        *self.token.lock().await = Some(fresh);
        Ok(())
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn account(&self) -> Result<Value, PlatformError> {
        self.send(Method::GET, self.endpoints.account, &[], None).await
    }

    pub async fn symbols(&self) -> Result<Vec<Value>, PlatformError> {
        let payload = self.send(Method::GET, self.endpoints.symbols, &[], None).await?;
        Ok(pick_list(&payload, &["symbols", "data", "items"]).into_iter().cloned().collect())
    }

    pub async fn price(&self, symbol: &str) -> Result<Value, PlatformError> {
        let path = self.endpoints.price_template.replace("{symbol}", symbol);
        self.send(Method::GET, &path, &[], None).await
    }

    pub async fn prices(&self, symbols: &[String]) -> Result<Vec<Value>, PlatformError> {
        let payload = self
            .send(Method::GET, self.endpoints.prices, &[("symbols", symbols.join(","))], None)
            .await?;
        Ok(pick_list(&payload, &["prices", "data", "items"]).into_iter().cloned().collect())
    }

    pub async fn candles(&self, symbol: &str, timeframe_code: &str, count: usize) -> Result<Vec<Value>, PlatformError> {
        let path = self.endpoints.candles_template.replace("{symbol}", symbol);
        let payload = self
            .send(
            Method::GET,
            &path,
            &[("timeframe", timeframe_code.to_string()), ("count", count.to_string())],
            None,
        )
            .await?;
        Ok(pick_list(&payload, &["candles", "data", "items"]).into_iter().cloned().collect())
    }

    pub async fn positions(&self) -> Result<Vec<Value>, PlatformError> {
        let payload = self.send(Method::GET, self.endpoints.positions, &[], None).await?;
        Ok(pick_list(&payload, &["positions", "data", "items"]).into_iter().cloned().collect())
    }

    pub async fn place_order(&self, body: Value) -> Result<Value, PlatformError> {
        self.send(Method::POST, self.endpoints.place_order, &[], Some(body)).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), PlatformError> {
        let path = self.endpoints.cancel_order_template.replace("{order_id}", order_id);
        self.send(Method::DELETE, &path, &[], None).await.map(|_| ())
    }

    pub async fn close_position(&self, position_id: &str, volume: Option<Decimal>) -> Result<Value, PlatformError> {
        let path = self.endpoints.close_position_template.replace("{position_id}", position_id);
        let body = volume.map(|v| json!({ "volume": v }));
        self.send(Method::POST, &path, &[], body).await
    }

    pub async fn modify_position(
        &self,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), PlatformError> {
        let path = self.endpoints.modify_position_template.replace("{position_id}", position_id);
        let body = json!({ "stopLoss": stop_loss, "takeProfit": take_profit });
        self.send(Method::PATCH, &path, &[], Some(body)).await.map(|_| ())
    }
}

pub fn price_bid_ask(payload: &Value) -> Option<(Decimal, Decimal)> {
    let bid = pick_decimal(payload, &["bid", "bidPrice", "b"])?;
    let ask = pick_decimal(payload, &["ask", "askPrice", "a"])?;
    Some((bid, ask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_bid_ask_reads_short_field_names() {
        let payload = json!({ "b": "1.1000", "a": "1.1002" });
        let (bid, ask) = price_bid_ask(&payload).unwrap();
        assert_eq!(bid.to_string(), "1.1000");
        assert_eq!(ask.to_string(), "1.1002");
    }
}
