use crate::account::{config_for, Account, AccountStore};
use crate::factory::BrokerFactory;
use ai_oracle::AiOracle;
use bot::Bot;
use broker_trait::BrokerAdapter;
use dashmap::DashMap;
use news_blackout::NewsBlackoutOracle;
use notification::NotificationSink;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("broker connection failed: {0}")]
    BrokerConnection(String),
    #[error("account {0} is already running")]
    AlreadyRunning(String),
    #[error("account {0} is already stopped")]
    AlreadyStopped(String),
    #[error("bot lifecycle error: {0}")]
    Lifecycle(String),
}

/// Maps a bot-level lifecycle error to the account-scoped `ManagerError`
/// variant callers can match on, preserving the already_running/
/// already_stopped distinction instead of collapsing it into a string.
fn map_lifecycle_error(account_id: &str, err: bot::LifecycleError) -> ManagerError {
    match err {
        bot::LifecycleError::AlreadyRunning => ManagerError::AlreadyRunning(account_id.to_string()),
        bot::LifecycleError::AlreadyStopped => ManagerError::AlreadyStopped(account_id.to_string()),
        other => ManagerError::Lifecycle(other.to_string()),
    }
}

/// Outcome of a fleet-wide `start_all_enabled`/`stop_all` call :
/// failures accumulate per account rather than aborting the sweep.
#[derive(Debug, Default)]
pub struct FleetResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns every account's [`Bot`] instance and serializes lifecycle
/// transitions with a single lock. A bot is created lazily on
/// first `start()` for its account and lives until process exit.
pub struct Manager {
    store: Arc<dyn AccountStore>,
    brokers: Arc<dyn BrokerFactory>,
    oracle: Arc<dyn AiOracle>,
    news: Arc<NewsBlackoutOracle>,
    notifications: Arc<dyn NotificationSink>,
    bots: DashMap<String, Arc<Bot>>,
    report_brokers: DashMap<String, Arc<dyn BrokerAdapter>>,
    lifecycle_lock: Mutex<()>,
}

impl Manager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        brokers: Arc<dyn BrokerFactory>,
        oracle: Arc<dyn AiOracle>,
        news: Arc<NewsBlackoutOracle>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            brokers,
            oracle,
            news,
            notifications,
            bots: DashMap::new(),
            report_brokers: DashMap::new(),
            lifecycle_lock: Mutex::new(()),
        }
    }

    pub fn bot(&self, account_id: &str) -> Option<Arc<Bot>> {
        self.bots.get(account_id).map(|e| e.value().clone())
    }

    /// Reloads the account row, resolves a broker, creates or reconfigures
    /// the bot instance, then starts it. Serialized against
    /// every other lifecycle call so two starts for the same account can
    /// never race each other into two bot instances.
    pub async fn start(&self, account_id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle_lock.lock().await;
        let account = self.load_account(account_id).await?;

        let bot = if let Some(existing) = self.bots.get(account_id).map(|e| e.value().clone()) {
            existing
                .configure(config_for(&account))
                .await
                .map_err(|err| ManagerError::Lifecycle(err.to_string()))?;
            existing
        } else {
            let broker = self
                .brokers
                .build(&account)
                .await
                .map_err(|err| ManagerError::BrokerConnection(err.to_string()))?;
            broker
                .connect()
                .await
                .map_err(|err| ManagerError::BrokerConnection(err.to_string()))?;
            let bot = Arc::new(Bot::new(
                account.id.clone(),
                config_for(&account),
                broker,
                self.oracle.clone(),
                self.news.clone(),
                self.notifications.clone(),
            ));
            self.bots.insert(account.id.clone(), bot.clone());
            bot
        };

        bot.start().await.map_err(|err| map_lifecycle_error(account_id, err))?;

        let _ = self
            .store
            .update_connected(account_id, true, Some(chrono::Utc::now()))
            .await;
        Ok(())
    }

    pub async fn stop(&self, account_id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle_lock.lock().await;
        let bot = self
            .bots
            .get(account_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        bot.stop().await.map_err(|err| map_lifecycle_error(account_id, err))?;
        let _ = self.store.update_connected(account_id, false, None).await;
        Ok(())
    }

    pub async fn pause(&self, account_id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle_lock.lock().await;
        let bot = self
            .bots
            .get(account_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        bot.pause().await.map_err(|err| map_lifecycle_error(account_id, err))
    }

    pub async fn resume(&self, account_id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle_lock.lock().await;
        let bot = self
            .bots
            .get(account_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        bot.resume().await.map_err(|err| map_lifecycle_error(account_id, err))
    }

    pub async fn reset(&self, account_id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle_lock.lock().await;
        let bot = self
            .bots
            .get(account_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        bot.reset().await.map_err(|err| map_lifecycle_error(account_id, err))
    }

    pub async fn start_all_enabled(&self) -> FleetResult {
        let accounts = match self.store.load_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => {
                return FleetResult {
                    succeeded: Vec::new(),
                    failed: vec![("*".to_string(), err.to_string())],
                }
            }
        };
        let mut result = FleetResult::default();
        for account in accounts.into_iter().filter(|a| a.enabled) {
            match self.start(&account.id).await {
                Ok(()) => result.succeeded.push(account.id),
                Err(err) => result.failed.push((account.id, err.to_string())),
            }
        }
        result
    }

    pub async fn stop_all(&self) -> FleetResult {
        let ids: Vec<String> = self.bots.iter().map(|e| e.key().clone()).collect();
        let mut result = FleetResult::default();
        for id in ids {
            match self.stop(&id).await {
                Ok(()) => result.succeeded.push(id),
                Err(err) => result.failed.push((id, err.to_string())),
            }
        }
        result
    }

    /// Lazily connects a read-only adapter for balance/position
    /// reporting even when the bot isn't running. Never places orders —
    /// callers only ever see `account_info`/`positions` through this path.
    pub async fn ensure_broker_connection(
        &self,
        account_id: &str,
    ) -> Result<Arc<dyn BrokerAdapter>, ManagerError> {
        if let Some(existing) = self.report_brokers.get(account_id) {
            return Ok(existing.value().clone());
        }
        let account = self.load_account(account_id).await?;
        let broker = self
            .brokers
            .build(&account)
            .await
            .map_err(|err| ManagerError::BrokerConnection(err.to_string()))?;
        broker
            .connect()
            .await
            .map_err(|err| ManagerError::BrokerConnection(err.to_string()))?;
        self.report_brokers.insert(account_id.to_string(), broker.clone());
        Ok(broker)
    }

    pub async fn statuses(&self) -> HashMap<String, bot::StatusSnapshot> {
        let mut out = HashMap::with_capacity(self.bots.len());
        for entry in self.bots.iter() {
            out.insert(entry.key().clone(), entry.value().status().await);
        }
        out
    }

    /// Account snapshot through the running bot's broker session if one
    /// exists, otherwise through the lazily-connected read-only adapter.
    pub async fn account_info(&self, account_id: &str) -> Result<broker_trait::AccountInfo, ManagerError> {
        let broker = match self.bot(account_id) {
            Some(bot) => bot.broker(),
            None => self.ensure_broker_connection(account_id).await?,
        };
        broker
            .account_info()
            .await
            .map_err(|err| ManagerError::BrokerConnection(err.to_string()))
    }

    pub async fn open_positions(
        &self,
        account_id: &str,
    ) -> Result<Vec<position_supervisor::TradeRecord>, ManagerError> {
        let bot = self
            .bot(account_id)
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        Ok(bot.open_positions().await)
    }

    pub async fn logs(&self, account_id: &str, limit: usize) -> Result<Vec<bot::LogEntry>, ManagerError> {
        let bot = self
            .bot(account_id)
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))?;
        Ok(bot.logs(limit).await)
    }

    async fn load_account(&self, account_id: &str) -> Result<Account, ManagerError> {
        self.store
            .get_account(account_id)
            .await
            .map_err(|err| ManagerError::BrokerConnection(err.to_string()))?
            .ok_or_else(|| ManagerError::UnknownAccount(account_id.to_string()))
    }
}
