//! Notification sink collaborator interface. Delivery
//! channels (push, chat, email) are deliberately external to this system —
//! this crate only defines the fire-and-forget contract every bot calls
//! and a couple of trivial sinks for wiring and tests.

use async_trait::async_trait;
use std::sync::Arc;

/// A best-effort notification channel. `notify` must never propagate a
/// failure to its caller — implementations log and swallow their own
/// errors.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Fans one notification out to every configured sink, awaiting each in
/// turn. A slow or failing sink never blocks or suppresses the others.
pub struct Broadcaster {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Broadcaster {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub async fn notify(&self, text: &str) {
        for sink in &self.sinks {
            sink.notify(text).await;
        }
    }
}

#[async_trait]
impl NotificationSink for Broadcaster {
    async fn notify(&self, text: &str) {
        Broadcaster::notify(self, text).await;
    }
}

/// Writes every notification through `tracing` at `info` level. The
/// default sink for deployments with no external channel configured.
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, text: &str) {
        tracing::info!(%text, "notification");
    }
}

/// Discards every notification. Useful for tests that don't care about
/// delivery but still need a sink to satisfy a bot's wiring.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _text: &str) {}
}

/// Posts every notification to a Discord incoming webhook. An empty
/// `webhook_url` makes `notify` a silent no-op, so deployments can wire
/// this sink unconditionally and opt in by setting the URL.
pub struct DiscordSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for DiscordSink {
    async fn notify(&self, text: &str) {
        if self.webhook_url.is_empty() {
            tracing::debug!("discord webhook not configured, skipping notification");
            return;
        }

        let payload = serde_json::json!({
            "content": text,
            "username": "Trading Orchestrator",
        });

        if let Err(err) = self.client.post(&self.webhook_url).json(&payload).send().await {
            tracing::warn!(%err, "discord notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn notify(&self, _text: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn broadcaster_reaches_every_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let broadcaster = Broadcaster::new(vec![
            Arc::new(CountingSink(count.clone())),
            Arc::new(CountingSink(count.clone())),
            Arc::new(NullSink),
        ]);
        broadcaster.notify("trade opened").await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
