use news_blackout::NewsFilterConfig;
use position_supervisor::SmartExitConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisMode {
    Quick,
    Standard,
    Premium,
    Ultra,
}

/// Broker login material, scoped per account by the manager. Kept
/// opaque here — each adapter interprets its own expected keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialBundle(pub HashMap<String, String>);

/// One invariant violation from [`BotConfig::validate`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("min_risk_reward ({min}) must be <= max_risk_reward ({max})")]
    RiskRewardOrder { min: Decimal, max: Decimal },
    #[error("trading window must satisfy 0 <= start_hour < end_hour <= 24, got [{start}, {end})")]
    TradingWindow { start: u32, end: u32 },
    #[error("interval_seconds must be >= 60, got {0}")]
    IntervalTooShort(u64),
    #[error("risk_per_trade_percent must be <= 10, got {0}")]
    RiskPerTradeTooHigh(Decimal),
}

/// Per-account bot configuration, mutable only via `configure()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub watch_list: Vec<String>,
    pub analysis_mode: AnalysisMode,
    pub interval_seconds: u64,
    pub enabled_models: Vec<String>,
    pub min_confidence: Decimal,
    pub min_models_agree: u32,
    pub min_confluence: Decimal,
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
    pub smart_exit: SmartExitConfig,
    pub news_filter: NewsFilterConfig,
    pub credentials: CredentialBundle,
    /// Emit a status notification every N completed ticks. `None` (the
    /// default) disables heartbeats entirely.
    #[serde(default)]
    pub heartbeat_interval_cycles: Option<u32>,
}

impl BotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_risk_reward > self.max_risk_reward {
            return Err(ConfigError::RiskRewardOrder {
                min: self.min_risk_reward,
                max: self.max_risk_reward,
            });
        }
        if !(self.trading_start_hour < self.trading_end_hour && self.trading_end_hour <= 24) {
            return Err(ConfigError::TradingWindow {
                start: self.trading_start_hour,
                end: self.trading_end_hour,
            });
        }
        if self.interval_seconds < 60 {
            return Err(ConfigError::IntervalTooShort(self.interval_seconds));
        }
        if self.risk_per_trade_percent > Decimal::from(10) {
            return Err(ConfigError::RiskPerTradeTooHigh(self.risk_per_trade_percent));
        }
        Ok(())
    }

    pub fn risk_config(&self) -> risk_evaluator::RiskConfig {
        risk_evaluator::RiskConfig {
            risk_per_trade_percent: self.risk_per_trade_percent,
            min_risk_reward: self.min_risk_reward,
            max_risk_reward: self.max_risk_reward,
            max_daily_trades: self.max_daily_trades,
            max_daily_loss_percent: self.max_daily_loss_percent,
            max_consecutive_losses: self.max_consecutive_losses,
            account_drawdown_limit_percent: self.account_drawdown_limit_percent,
        }
    }

    /// True when `now`'s UTC hour falls in `[trading_start_hour, trading_end_hour)`
    /// and, unless `trade_on_weekends`, the day isn't Saturday/Sunday.
    pub fn is_within_trading_hours(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::{Datelike, Timelike, Weekday};
        if !self.trade_on_weekends
        && matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
        {
            return false;
        }
        let hour = now.hour();
        hour >= self.trading_start_hour && hour < self.trading_end_hour
    }
}
