//! Thin HTTP wrapper around the OANDA v20 REST API, plus the line-delimited
//! streaming endpoint. No caching or `broker_trait` opinions here — that
//! lives in `lib.rs`.

use crate::models::*;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OandaError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("oanda error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct OandaClient {
    http: Client,
    base_url: String,
    stream_url: String,
    token: String,
    account_id: String,
}

impl OandaClient {
    pub fn new(
        base_url: impl Into<String>,
        stream_url: impl Into<String>,
        token: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client builds");
        Self {
            http,
            base_url: base_url.into(),
            stream_url: stream_url.into(),
            token: token.into(),
            account_id: account_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v3/accounts/{}{}",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            path
        )
    }

    async fn send<T: for<'de> serde::Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, OandaError> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|err| OandaError::Transport(err.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(OandaError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(OandaError::Api { code, message });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| OandaError::Decode(err.to_string()))
    }

    pub async fn account(&self) -> Result<OandaAccount, OandaError> {
        let envelope: OandaAccountEnvelope = self.send(self.http.get(self.url("/summary"))).await?;
        Ok(envelope.account)
    }

    pub async fn instruments(&self) -> Result<Vec<OandaInstrument>, OandaError> {
        let envelope: OandaInstrumentsEnvelope = self.send(self.http.get(self.url("/instruments"))).await?;
        Ok(envelope.instruments)
    }

    pub async fn pricing(&self, native_symbols: &[String]) -> Result<Vec<OandaPrice>, OandaError> {
        let envelope: OandaPricingEnvelope = self.send(
            self.http
                .get(self.url("/pricing"))
                .query(&[("instruments", native_symbols.join(","))]),
        )
            .await?;
        Ok(envelope.prices)
    }

    pub async fn candles(
        &self,
        native_symbol: &str,
        granularity: &str,
        count: usize,
    ) -> Result<Vec<OandaCandle>, OandaError> {
        let envelope: OandaCandlesEnvelope = self.send(
            self.http
                .get(format!(
                    "{}/v3/instruments/{}/candles",
                    self.base_url.trim_end_matches('/'),
                    native_symbol
            ))
                .header("Authorization", format!("Bearer {}", self.token))
                .query(&[
                ("granularity", granularity.to_string()),
                ("count", count.to_string()),
                ("price", "M".to_string()),
            ]),
        )
            .await?;
        Ok(envelope.candles)
    }

    pub async fn create_order(&self, spec: OandaOrderSpec) -> Result<OandaOrderCreateResponse, OandaError> {
        self.send(
            self.http
                .post(self.url("/orders"))
                .json(&OandaOrderRequestEnvelope { order: spec }),
        )
            .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), OandaError> {
        self.send::<serde_json::Value>(self.http.put(self.url(&format!("/orders/{order_id}/cancel"))))
            .await?;
        Ok(())
    }

    pub async fn positions(&self) -> Result<Vec<OandaPosition>, OandaError> {
        let envelope: OandaPositionsEnvelope = self.send(self.http.get(self.url("/openPositions"))).await?;
        Ok(envelope.positions)
    }

    pub async fn close_position(
        &self,
        native_symbol: &str,
        long_units: Option<String>,
        short_units: Option<String>,
    ) -> Result<OandaOrderCreateResponse, OandaError> {
        let mut body = serde_json::Map::new();
        if let Some(units) = long_units {
            body.insert("longUnits".to_string(), serde_json::Value::String(units));
        }
        if let Some(units) = short_units {
            body.insert("shortUnits".to_string(), serde_json::Value::String(units));
        }
        self.send(
            self.http
                .put(self.url(&format!("/positions/{native_symbol}/close")))
                .json(&body),
        )
            .await
    }

    pub async fn pricing_stream(
        &self,
        native_symbols: &[String],
    ) -> Result<impl Stream<Item = Result<OandaStreamLine, OandaError>>, OandaError> {
        let response = self
            .http
            .get(format!(
                "{}/v3/accounts/{}/pricing/stream",
                self.stream_url.trim_end_matches('/'),
                self.account_id
        ))
            .header("Authorization", format!("Bearer {}", self.token))
            .query(&[("instruments", native_symbols.join(","))])
            .send()
            .await
            .map_err(|err| OandaError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(OandaError::Api { code, message });
        }

        // The feed is newline-delimited JSON but chunk boundaries from the
        // transport never align with line boundaries, so lines are
        // reassembled from a running buffer rather than parsed per-chunk.
        let bytes_stream = response.bytes_stream();
        let state = (bytes_stream, String::new());
        Ok(futures_util::stream::unfold(state, |(mut chunks, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str::<OandaStreamLine>(&line)
                        .map_err(|err| OandaError::Decode(err.to_string()));
                    return Some((parsed, (chunks, buffer)));
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                    Some(Err(err)) => return Some((Err(OandaError::Transport(err.to_string())), (chunks, buffer))),
                    None => return None,
                }
            }
        }))
    }
}
