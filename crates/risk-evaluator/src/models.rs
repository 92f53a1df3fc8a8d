use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-account risk configuration, a subset of the bot config that the
/// evaluator needs. `risk_per_trade_percent` and the RR bounds are validated
/// at bot-config construction time, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub risk_per_trade_percent: Decimal,
    pub min_risk_reward: Decimal,
    pub max_risk_reward: Decimal,
    pub max_daily_trades: u32,
    pub max_daily_loss_percent: Decimal,
    pub max_consecutive_losses: u32,
    pub account_drawdown_limit_percent: Decimal,
}

/// Hard ceiling on the geometry fix step : SL distance is never
/// loosened past this fraction of price.
pub const MAX_SL_DISTANCE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 3); // 0.005
/// Uniform default distance used when SL/TP are inverted.
pub const DEFAULT_FIX_DISTANCE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 3); // 0.005
pub const MAX_LOT: Decimal = Decimal::from_parts(50, 0, 0, false, 1); // 5.0
pub const MARGIN_UTILIZATION: Decimal = Decimal::from_parts(90, 0, 0, false, 2); // 0.90

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeCalculation {
    pub lot_size: Decimal,
    pub sl_pips: Decimal,
    pub pip_value_per_lot: Decimal,
    pub risk_amount: Decimal,
    /// `true` when the stop had to be tightened to stay within the
    /// minimum-lot floor rather than inflating the risk.
    pub stop_tightened: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerCheck {
    pub can_trade: bool,
    pub reason: Option<String>,
    pub breakers_triggered: Vec<String>,
}

impl CircuitBreakerCheck {
    pub fn ok() -> Self {
        Self {
            can_trade: true,
            reason: None,
            breakers_triggered: Vec::new(),
        }
    }

    fn halt(triggered: &str, reason: impl Into<String>) -> Self {
        Self {
            can_trade: false,
            reason: Some(reason.into()),
            breakers_triggered: vec![triggered.to_string()],
        }
    }
}

/// Today's trading counters as tracked by the bot's state ; the
/// evaluator only reads these, it never mutates or persists them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyCounters {
    pub trades_today: u32,
    pub realized_pnl_percent_today: Decimal,
    pub consecutive_losses: u32,
    pub drawdown_from_peak_percent: Decimal,
    pub manually_halted: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RiskError {
    #[error("margine insufficiente")]
    InsufficientMargin,
}

pub(crate) fn check_circuit_breakers_impl(
    cfg: &RiskConfig,
    counters: DailyCounters,
) -> CircuitBreakerCheck {
    if counters.manually_halted {
        return CircuitBreakerCheck::halt("manual_halt", "trading manually halted");
    }
    if counters.trades_today >= cfg.max_daily_trades {
        return CircuitBreakerCheck::halt(
            "max_daily_trades",
            format!(
                "daily trade limit reached ({}/{})",
                counters.trades_today, cfg.max_daily_trades
            ),
        );
    }
    if counters.realized_pnl_percent_today <= -cfg.max_daily_loss_percent {
        return CircuitBreakerCheck::halt(
            "daily_loss_limit",
            format!(
                "daily loss limit reached ({}% ≤ -{}%)",
                counters.realized_pnl_percent_today, cfg.max_daily_loss_percent
            ),
        );
    }
    if counters.consecutive_losses >= cfg.max_consecutive_losses {
        return CircuitBreakerCheck::halt(
            "consecutive_losses",
            format!(
                "{} consecutive losses ≥ limit {}",
                counters.consecutive_losses, cfg.max_consecutive_losses
            ),
        );
    }
    if counters.drawdown_from_peak_percent >= cfg.account_drawdown_limit_percent {
        return CircuitBreakerCheck::halt(
            "drawdown_limit",
            format!(
                "drawdown from peak {}% ≥ limit {}%",
                counters.drawdown_from_peak_percent, cfg.account_drawdown_limit_percent
            ),
        );
    }
    CircuitBreakerCheck::ok()
}
