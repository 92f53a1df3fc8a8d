use broker_trait::Direction;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Terminal and non-terminal states a [`TradeRecord`] can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedBe,
    ClosedSmartExit,
}

impl TradeStatus {
    pub fn is_open(self) -> bool {
        matches!(self, TradeStatus::Open)
    }
}

/// One trade the bot opened, tracked from fill to close. Mutated
/// exclusively by the position supervisor, or by reconciliation when the
/// broker no longer reports the position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub initial_stop_loss: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub units: Decimal,
    pub opened_at: DateTime<Utc>,
    pub confidence: f64,
    pub timeframes_analyzed: u32,
    pub models_agreed: u32,
    pub total_models: u32,
    pub status: TradeStatus,
    pub exit_price: Option<Decimal>,
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub profit_loss: Option<Decimal>,
    pub break_even_trigger: Option<Decimal>,
    pub trailing_stop_pips: Option<Decimal>,
    pub partial_tp_percent: Option<Decimal>,
    pub is_break_even: bool,
    pub extreme_price: Decimal,
    pub max_favorable_rr: Decimal,
}

impl TradeRecord {
    /// Distance between entry and the stop loss set at open time. Never
    /// recomputed from the (possibly moved) current stop.
    pub fn initial_risk_distance(&self) -> Decimal {
        (self.entry_price - self.initial_stop_loss).abs()
    }

    /// How far price has moved in the trade's favor from entry, floored
    /// at zero.
    pub fn favorable_move(&self, current: Decimal) -> Decimal {
        let raw = match self.direction {
            Direction::Long => current - self.entry_price,
            Direction::Short => self.entry_price - current,
        };
        raw.max(Decimal::ZERO)
    }

    /// Pushes `extreme_price` further in the favorable direction if
    /// `current` improves on it. Monotone by construction.
    pub fn update_extreme_price(&mut self, current: Decimal) {
        match self.direction {
            Direction::Long => {
                if current > self.extreme_price {
                    self.extreme_price = current;
                }
            }
            Direction::Short => {
                if current < self.extreme_price {
                    self.extreme_price = current;
                }
            }
        }
    }

    /// Recomputes `max_favorable_rr` from the current `extreme_price`,
    /// never allowing it to decrease.
    pub fn update_max_favorable_rr(&mut self) {
        let risk = self.initial_risk_distance();
        if risk.is_zero() {
            return;
        }
        let best_favorable_move = self.favorable_move(self.extreme_price);
        let candidate = best_favorable_move / risk;
        if candidate > self.max_favorable_rr {
            self.max_favorable_rr = candidate;
        }
    }

    /// True once `current` has crossed the break-even trigger in the
    /// favorable direction.
    pub fn crosses_break_even(&self, current: Decimal) -> bool {
        match (self.break_even_trigger, self.direction) {
            (Some(trigger), Direction::Long) => current >= trigger,
            (Some(trigger), Direction::Short) => current <= trigger,
            (None, _) => false,
        }
    }

    /// Candidate trailing stop for `current`, or `None` if trailing isn't
    /// configured or wouldn't improve on the existing stop.
    pub fn trailing_candidate(&self, current: Decimal, pip_size: Decimal) -> Option<Decimal> {
        let pips = self.trailing_stop_pips?;
        let trail_distance = pips * pip_size;
        let candidate = match self.direction {
            Direction::Long => current - trail_distance,
            Direction::Short => current + trail_distance,
        };
        let improves = match self.direction {
            Direction::Long => candidate > self.stop_loss,
            Direction::Short => candidate < self.stop_loss,
        };
        improves.then_some(candidate)
    }
}
