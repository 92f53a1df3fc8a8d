//! Loads the account fleet this process supervises. Two sources are
//! supported: a JSON file of [`manager::Account`] rows for real multi-account
//! deployments, or a single account assembled from environment variables for
//! local/demo runs, mirroring the single-account env-driven config the
//! orchestrator used before it became a fleet supervisor.

use anyhow::{Context, Result};
use bot::{AnalysisMode, CredentialBundle};
use manager::Account;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

/// Top-level process settings that aren't per-account: logging format,
/// the notification fan-out, and where the account fleet is defined.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub json_logging: bool,
    pub discord_webhook_url: String,
    pub accounts_config_path: Option<String>,
}

impl AgentSettings {
    pub fn from_env() -> Self {
        Self {
            json_logging: std::env::var("RUST_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").unwrap_or_default(),
            accounts_config_path: std::env::var("ACCOUNTS_CONFIG_PATH").ok(),
        }
    }
}

/// Loads every account this process should know about. When
/// `ACCOUNTS_CONFIG_PATH` is set, the file is parsed as a JSON array of
/// [`Account`] rows. Otherwise a single demo/dev account is assembled from
/// individual `ACCOUNT_*` environment variables.
pub fn load_accounts(settings: &AgentSettings) -> Result<Vec<Account>> {
    match &settings.accounts_config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading accounts config at {path}"))?;
            let accounts: Vec<Account> =
                serde_json::from_str(&raw).with_context(|| format!("parsing accounts config at {path}"))?;
            if accounts.is_empty() {
                anyhow::bail!("accounts config at {path} contains no accounts");
            }
            Ok(accounts)
        }
        None => Ok(vec![single_account_from_env()?]),
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match std::env::var(key) {
        Ok(raw) => Decimal::from_str(&raw).with_context(|| format!("parsing {key} as a decimal")),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("parsing {key} as u32")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("parsing {key} as u64")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn single_account_from_env() -> Result<Account> {
    let broker_type = env_var("ACCOUNT_BROKER_TYPE")?;
    let mut credentials = HashMap::new();
    for key in [
        "BASE_URL",
        "STREAM_URL",
        "TOKEN",
        "ACCOUNT_ID",
        "PASSWORD",
        "SERVER_NAME",
        "PAPER",
        "LOGIN",
        "SERVER",
        "PLATFORM",
    ] {
        if let Ok(value) = std::env::var(format!("ACCOUNT_CRED_{key}")) {
            credentials.insert(key.to_lowercase(), value);
        }
    }

    let watch_list = env_or("ACCOUNT_WATCH_LIST", "EUR_USD,GBP_USD,USD_JPY")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let analysis_mode = match env_or("ACCOUNT_ANALYSIS_MODE", "standard").to_lowercase().as_str() {
        "quick" => AnalysisMode::Quick,
        "premium" => AnalysisMode::Premium,
        "ultra" => AnalysisMode::Ultra,
        _ => AnalysisMode::Standard,
    };

    Ok(Account {
        id: env_or("ACCOUNT_ID", "default"),
        name: env_or("ACCOUNT_NAME", "default"),
        broker_type,
        enabled: env_bool("ACCOUNT_ENABLED", true),
        platform_id: std::env::var("ACCOUNT_PLATFORM_ID").ok(),
        credentials: CredentialBundle(credentials),
        watch_list,
        analysis_mode,
        interval_seconds: env_u64("ACCOUNT_INTERVAL_SECONDS", 300)?,
        min_confidence: env_decimal("ACCOUNT_MIN_CONFIDENCE", Decimal::from(70))?,
        min_models_agree: env_u32("ACCOUNT_MIN_MODELS_AGREE", 1)?,
        min_confluence: env_decimal("ACCOUNT_MIN_CONFLUENCE", Decimal::ZERO)?,
        enabled_models: env_or("ACCOUNT_ENABLED_MODELS", "mock")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        risk_per_trade_percent: env_decimal("ACCOUNT_RISK_PER_TRADE_PERCENT", Decimal::from(1))?,
        max_open_positions: env_u32("ACCOUNT_MAX_OPEN_POSITIONS", 5)?,
        max_daily_trades: env_u32("ACCOUNT_MAX_DAILY_TRADES", 10)?,
        max_daily_loss_percent: env_decimal("ACCOUNT_MAX_DAILY_LOSS_PERCENT", Decimal::from(5))?,
        max_consecutive_losses: env_u32("ACCOUNT_MAX_CONSECUTIVE_LOSSES", 4)?,
        account_drawdown_limit_percent: env_decimal("ACCOUNT_DRAWDOWN_LIMIT_PERCENT", Decimal::from(15))?,
        trading_start_hour: env_u32("ACCOUNT_TRADING_START_HOUR", 0)?,
        trading_end_hour: env_u32("ACCOUNT_TRADING_END_HOUR", 24)?,
        trade_on_weekends: env_bool("ACCOUNT_TRADE_ON_WEEKENDS", false),
        min_risk_reward: env_decimal("ACCOUNT_MIN_RISK_REWARD", Decimal::new(15, 1))?,
        max_risk_reward: env_decimal("ACCOUNT_MAX_RISK_REWARD", Decimal::new(22, 1))?,
        smart_exit: manager::account::position_supervisor_config::SmartExitRow {
            enabled: env_bool("ACCOUNT_SMART_EXIT_ENABLED", true),
            min_rr: env_decimal("ACCOUNT_SMART_EXIT_MIN_RR", Decimal::from(1))?,
            drawdown_percent: env_decimal("ACCOUNT_SMART_EXIT_DRAWDOWN_PERCENT", Decimal::from(45))?,
        },
        news_filter: manager::account::news_filter_config::NewsFilterRow {
            enabled: env_bool("ACCOUNT_NEWS_FILTER_ENABLED", true),
            filter_high_impact: env_bool("ACCOUNT_NEWS_FILTER_HIGH", true),
            filter_medium_impact: env_bool("ACCOUNT_NEWS_FILTER_MEDIUM", true),
            filter_low_impact: env_bool("ACCOUNT_NEWS_FILTER_LOW", false),
            minutes_before: env_u64("ACCOUNT_NEWS_FILTER_MINUTES_BEFORE", 30)? as i64,
            minutes_after: env_u64("ACCOUNT_NEWS_FILTER_MINUTES_AFTER", 30)? as i64,
        },
        connected: false,
        last_connected_at: None,
        heartbeat_interval_cycles: std::env::var("ACCOUNT_HEARTBEAT_INTERVAL_CYCLES")
            .ok()
            .and_then(|v| v.parse().ok()),
    })
}
