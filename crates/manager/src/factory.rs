use crate::account::Account;
use async_trait::async_trait;
use broker_trait::BrokerAdapter;
use std::sync::Arc;

/// Resolves an [`Account`]'s `broker_type` into a connected adapter. Kept
/// separate from the Manager so wiring a new broker never touches
/// fleet-lifecycle code.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn build(&self, account: &Account) -> anyhow::Result<Arc<dyn BrokerAdapter>>;
}
