//! The opaque AI Oracle contract. The orchestrator never reaches
//! into a specific model provider directly — it only asks an
//! [`AiOracle`] to analyze a symbol and hands back a structured
//! [`consensus::Opinion`]. Failures never propagate as `Err`: they surface
//! as a HOLD opinion carrying the error text instead.

use async_trait::async_trait;
use broker_trait::Timeframe;
use consensus::Opinion;
use std::time::Duration;

/// Every AI call has a hard per-call timeout : at least 90s, 120s by
/// default. Implementations should still race an internal deadline of
/// their own, but the oracle wrapper enforces this ceiling regardless.
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Opaque prefetched market data handed to every model in one analysis
/// tick, deduplicating the fetch across the N parallel calls. The
/// oracle decides its own shape; the orchestrator only threads it through.
pub type PrefetchedMarketData = serde_json::Value;

#[async_trait]
pub trait AiOracle: Send + Sync {
    /// Analyze one symbol/timeframe/preset combination. Implementations
    /// MUST NOT return `Err` for model-side failures (rate limits, bad
    /// completions, timeouts) — wrap them in `Opinion::errored` instead.
    /// This method's `Result` exists only for truly unrecoverable setup
    /// errors (e.g. a misconfigured client); the oracle wrapper below
    /// still converts those into a HOLD opinion before they reach the bot.
    async fn analyze(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        preset: &str,
        prefetched_market_data: Option<&PrefetchedMarketData>,
    ) -> anyhow::Result<Opinion>;

    /// Model identifiers this oracle can serve (used to size `total_valid`
    /// in the consensus tally).
    fn models(&self) -> &[String];
}

/// Runs `oracle.analyze` for every requested model in parallel, joins them,
/// and converts any failure (timeout or `Err`) into a HOLD opinion
/// The oracle is responsible for its own prefetch deduplication; this
/// helper only fans the single prefetched payload out to each call.
pub async fn analyze_all(
    oracle: &dyn AiOracle,
    symbol: &str,
    timeframe: Timeframe,
    preset: &str,
    enabled_models: &[String],
    prefetched_market_data: Option<PrefetchedMarketData>,
) -> Vec<Opinion> {
    let mut handles = Vec::with_capacity(enabled_models.len());
    for model in enabled_models {
        let fut = call_with_timeout(
            oracle,
            symbol.to_string(),
            timeframe,
            preset.to_string(),
            prefetched_market_data.clone(),
            model.clone(),
        );
        handles.push(fut);
    }
    futures_util::future::join_all(handles).await
}

async fn call_with_timeout(
    oracle: &dyn AiOracle,
    symbol: String,
    timeframe: Timeframe,
    preset: String,
    prefetched: Option<PrefetchedMarketData>,
    model: String,
) -> Opinion {
    let result = tokio::time::timeout(
        DEFAULT_ORACLE_TIMEOUT,
        oracle.analyze(&symbol, timeframe, &preset, prefetched.as_ref()),
    )
        .await;

    match result {
        Ok(Ok(opinion)) => opinion,
        Ok(Err(err)) => {
            tracing::warn!(model, symbol, error = %err, "oracle call failed");
            Opinion::errored(model, err.to_string())
        }
        Err(_) => {
            tracing::warn!(model, symbol, "oracle call timed out");
            Opinion::errored(model, "oracle timed out")
        }
    }
}

/// A deterministic, always-HOLD oracle for wiring tests and single-bot
/// deployments without a live model provider configured.
pub struct MockOracle {
    models: Vec<String>,
}

impl MockOracle {
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }
}

#[async_trait]
impl AiOracle for MockOracle {
    async fn analyze(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _preset: &str,
        _prefetched_market_data: Option<&PrefetchedMarketData>,
    ) -> anyhow::Result<Opinion> {
        Ok(Opinion::errored("mock", "mock oracle is not connected"))
    }

    fn models(&self) -> &[String] {
        &self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_oracle_yields_hold_opinions() {
        let oracle = MockOracle::new(vec!["mock".to_string()]);
        let opinions = analyze_all(
            &oracle,
            "EUR_USD",
            Timeframe::H1,
            "standard",
            &["mock".to_string()],
            None,
        )
            .await;
        assert_eq!(opinions.len(), 1);
        assert_eq!(opinions[0].signal, consensus::Signal::Hold);
        assert!(opinions[0].error.is_some());
    }

    struct SlowOracle;

    #[async_trait]
    impl AiOracle for SlowOracle {
        async fn analyze(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _preset: &str,
            _prefetched_market_data: Option<&PrefetchedMarketData>,
        ) -> anyhow::Result<Opinion> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        fn models(&self) -> &[String] {
            &[]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_call_becomes_hold_opinion() {
        let oracle = SlowOracle;
        let opinions = analyze_all(
            &oracle,
            "EUR_USD",
            Timeframe::H1,
            "standard",
            &["slow".to_string()],
            None,
        )
            .await;
        assert_eq!(opinions.len(), 1);
        assert_eq!(opinions[0].signal, consensus::Signal::Hold);
    }
}
