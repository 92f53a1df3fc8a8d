use async_trait::async_trait;
use bot::{AnalysisMode, CredentialBundle};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One row of the account store. The manager never interprets most of
/// these fields itself — it hands them to [`crate::config_for`] to build a
/// [`bot::BotConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub broker_type: String,
    pub enabled: bool,
    pub platform_id: Option<String>,
    pub credentials: CredentialBundle,
    pub watch_list: Vec<String>,
    pub analysis_mode: AnalysisMode,
    pub interval_seconds: u64,
    pub min_confidence: Decimal,
    pub min_models_agree: u32,
    pub min_confluence: Decimal,
    pub enabled_models: Vec<String>,
    pub risk_per_trade_percent: Decimal,
    pub max_open_positions: u32,
    pub max_daily_trades: u32,
    pub max_daily_loss_percent: Decimal,
    pub max_consecutive_losses: u32,
    pub account_drawdown_limit_percent: Decimal,
    pub trading_start_hour: u32,
    pub trading_end_hour: u32,
    pub trade_on_weekends: bool,
    pub min_risk_reward: Decimal,
    pub max_risk_reward: Decimal,
    pub smart_exit: position_supervisor_config::SmartExitRow,
    pub news_filter: news_filter_config::NewsFilterRow,
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_interval_cycles: Option<u32>,
}

/// Re-exported row shapes kept free of the downstream crates' full types so
/// this module can serialize/deserialize a persistence row without pulling
/// in their trait objects.
pub mod position_supervisor_config {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct SmartExitRow {
        pub enabled: bool,
        pub min_rr: Decimal,
        pub drawdown_percent: Decimal,
    }

    impl From<SmartExitRow> for position_supervisor::SmartExitConfig {
        fn from(row: SmartExitRow) -> Self {
            position_supervisor::SmartExitConfig {
                enabled: row.enabled,
                min_rr: row.min_rr,
                drawdown_percent: row.drawdown_percent,
            }
        }
    }
}

pub mod news_filter_config {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct NewsFilterRow {
        pub enabled: bool,
        pub filter_high_impact: bool,
        pub filter_medium_impact: bool,
        pub filter_low_impact: bool,
        pub minutes_before: i64,
        pub minutes_after: i64,
    }

    impl From<NewsFilterRow> for news_blackout::NewsFilterConfig {
        fn from(row: NewsFilterRow) -> Self {
            news_blackout::NewsFilterConfig {
                enabled: row.enabled,
                filter_high_impact: row.filter_high_impact,
                filter_medium_impact: row.filter_medium_impact,
                filter_low_impact: row.filter_low_impact,
                minutes_before: row.minutes_before,
                minutes_after: row.minutes_after,
            }
        }
    }
}

/// Turns a persisted [`Account`] row into the config a fresh or
/// reconfigured [`bot::Bot`] needs.
pub fn config_for(account: &Account) -> bot::BotConfig {
    bot::BotConfig {
        watch_list: account.watch_list.clone(),
        analysis_mode: account.analysis_mode,
        interval_seconds: account.interval_seconds,
        enabled_models: account.enabled_models.clone(),
        min_confidence: account.min_confidence,
        min_models_agree: account.min_models_agree,
        min_confluence: account.min_confluence,
        risk_per_trade_percent: account.risk_per_trade_percent,
        max_open_positions: account.max_open_positions,
        max_daily_trades: account.max_daily_trades,
        max_daily_loss_percent: account.max_daily_loss_percent,
        max_consecutive_losses: account.max_consecutive_losses,
        account_drawdown_limit_percent: account.account_drawdown_limit_percent,
        trading_start_hour: account.trading_start_hour,
        trading_end_hour: account.trading_end_hour,
        trade_on_weekends: account.trade_on_weekends,
        min_risk_reward: account.min_risk_reward,
        max_risk_reward: account.max_risk_reward,
        smart_exit: account.smart_exit.into(),
        news_filter: account.news_filter.into(),
        credentials: account.credentials.clone(),
        heartbeat_interval_cycles: account.heartbeat_interval_cycles,
    }
}

/// Account persistence as seen by the Manager. The manager is the
/// only component allowed to call `update_connected`.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_accounts(&self) -> anyhow::Result<Vec<Account>>;
    async fn get_account(&self, id: &str) -> anyhow::Result<Option<Account>>;
    async fn update_connected(
        &self,
        id: &str,
        connected: bool,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;
}

/// An in-memory store for tests and single-process demos. Holds no
/// external connection; a real deployment backs this trait with its own
/// storage layer.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: dashmap::DashMap<String, Account>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn load_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self.accounts.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_account(&self, id: &str) -> anyhow::Result<Option<Account>> {
        Ok(self.accounts.get(id).map(|e| e.value().clone()))
    }

    async fn update_connected(
        &self,
        id: &str,
        connected: bool,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            entry.connected = connected;
            entry.last_connected_at = last_connected_at;
        }
        Ok(())
    }
}
