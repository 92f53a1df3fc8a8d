use crate::models::{
    check_circuit_breakers_impl, CircuitBreakerCheck, DailyCounters, PositionSizeCalculation,
    RiskConfig, RiskError, DEFAULT_FIX_DISTANCE_PERCENT, MARGIN_UTILIZATION, MAX_LOT,
    MAX_SL_DISTANCE_PERCENT,
};
use broker_trait::Direction;
use rust_decimal::Decimal;

/// Stateless risk math and the circuit-breaker checks that gate new orders.
/// All inputs (balance, counters, account limits) are owned by the bot's
/// state or the broker session — this evaluator never persists anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RiskEvaluator;

impl RiskEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Step 4: validate SL/TP sit on the correct side of entry. If inverted,
    /// flip to the uniform 0.5% default distance and recompute TP at
    /// `min_risk_reward`. If SL distance exceeds 0.5% of price, clip to it —
    /// never loosen beyond this ceiling.
    pub fn fix_geometry(
        &self,
        direction: Direction,
        entry: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        min_risk_reward: Decimal,
    ) -> (Decimal, Decimal) {
        let max_distance = entry * MAX_SL_DISTANCE_PERCENT;
        let geometry_ok = match direction {
            Direction::Long => stop_loss < entry && take_profit > entry,
            Direction::Short => stop_loss > entry && take_profit < entry,
        };

        if !geometry_ok {
            let default_distance = entry * DEFAULT_FIX_DISTANCE_PERCENT;
            return match direction {
                Direction::Long => (
                    entry - default_distance,
                    entry + default_distance * min_risk_reward,
                ),
                Direction::Short => (
                    entry + default_distance,
                    entry - default_distance * min_risk_reward,
                ),
            };
        }

        let sl_distance = (entry - stop_loss).abs();
        if sl_distance > max_distance {
            return match direction {
                Direction::Long => (entry - max_distance, take_profit),
                Direction::Short => (entry + max_distance, take_profit),
            };
        }

        (stop_loss, take_profit)
    }

    /// Step 5: enforce `min_risk_reward ≤ R:R ≤ max_risk_reward`, moving TP
    /// to whichever bracket edge it falls outside of.
    pub fn clamp_risk_reward(
        &self,
        direction: Direction,
        entry: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        min_rr: Decimal,
        max_rr: Decimal,
    ) -> Decimal {
        let risk = (entry - stop_loss).abs();
        if risk.is_zero() {
            return take_profit;
        }
        let reward = (take_profit - entry).abs();
        let rr = reward / risk;

        let clamped_rr = if rr < min_rr {
            min_rr
        } else if rr > max_rr {
            max_rr
        } else {
            return take_profit;
        };

        match direction {
            Direction::Long => entry + risk * clamped_rr,
            Direction::Short => entry - risk * clamped_rr,
        }
    }

    /// Step 7: push SL/TP out past `min_distance` from the reference side
    /// price when the broker's minimum stop distance is violated.
    pub fn enforce_broker_minimum(
        &self,
        direction: Direction,
        reference_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        min_distance: Decimal,
        point_size: Decimal,
    ) -> (Decimal, Decimal, bool) {
        let mut sl = stop_loss;
        let mut tp = take_profit;
        let mut adjusted = false;

        let sl_distance = (reference_price - sl).abs();
        if sl_distance < min_distance {
            sl = match direction {
                Direction::Long => reference_price - min_distance - point_size,
                Direction::Short => reference_price + min_distance + point_size,
            };
            adjusted = true;
        }

        let tp_distance = (reference_price - tp).abs();
        if tp_distance < min_distance {
            tp = match direction {
                Direction::Long => reference_price + min_distance + point_size,
                Direction::Short => reference_price - min_distance - point_size,
            };
            adjusted = true;
        }

        (sl, tp, adjusted)
    }

    /// `min_distance = max(stops_level, freeze_level, 1.5·spread, 10·point) ×
    /// retry_multiplier`.
    pub fn min_stop_distance(
        &self,
        stops_level: Decimal,
        freeze_level: Decimal,
        spread: Decimal,
        point_size: Decimal,
        retry_multiplier: Decimal,
    ) -> Decimal {
        let candidates = [
            stops_level,
            freeze_level,
            spread * Decimal::new(15, 1),
            point_size * Decimal::from(10),
        ];
        candidates.into_iter().fold(Decimal::ZERO, Decimal::max) * retry_multiplier
    }

    /// Step 8: `risk_amount = balance × risk_per_trade_percent / 100`;
    /// `lot_size = round_to_step(risk_amount / (sl_pips × pip_value_per_lot), min_lot)`.
    /// If the computed lot would be below `min_lot`, tighten SL instead of
    /// inflating the risk.
    pub fn calculate_position_size(
        &self,
        balance: Decimal,
        risk_per_trade_percent: Decimal,
        sl_distance: Decimal,
        pip_size: Decimal,
        pip_value_per_lot: Decimal,
        min_lot: Decimal,
        volume_step: Decimal,
    ) -> PositionSizeCalculation {
        let risk_amount = balance * risk_per_trade_percent / Decimal::from(100);
        let sl_pips = sl_distance / pip_size;

        let raw_lot = risk_amount / (sl_pips * pip_value_per_lot);
        let lot_size = round_to_step(raw_lot, volume_step);

        if lot_size >= min_lot {
            return PositionSizeCalculation {
                lot_size,
                sl_pips,
                pip_value_per_lot,
                risk_amount,
                stop_tightened: false,
            };
        }

        // Tighten the stop instead of inflating the risk taken at min lot.
        let tightened_sl_pips = risk_amount / (min_lot * pip_value_per_lot);
        PositionSizeCalculation {
            lot_size: min_lot,
            sl_pips: tightened_sl_pips,
            pip_value_per_lot,
            risk_amount,
            stop_tightened: true,
        }
    }

    /// Step 9: clamp to `MAX_LOT`, then to `margin_available × 0.90 /
    /// margin_per_lot`; reject below `min_lot`.
    pub fn apply_hard_caps(
        &self,
        lot_size: Decimal,
        margin_available: Decimal,
        margin_per_lot: Decimal,
        min_lot: Decimal,
    ) -> Result<Decimal, RiskError> {
        let mut lot = lot_size.min(MAX_LOT);

        if margin_per_lot > Decimal::ZERO {
            let margin_cap = margin_available * MARGIN_UTILIZATION / margin_per_lot;
            lot = lot.min(margin_cap);
        }

        if lot < min_lot {
            return Err(RiskError::InsufficientMargin);
        }

        Ok(lot)
    }

    /// Testable property #4: the position actually sized risks no more than
    /// `risk_per_trade_percent × balance`, up to step/min-lot rounding.
    pub fn actual_risk(
        &self,
        lot_size: Decimal,
        sl_pips: Decimal,
        pip_value_per_lot: Decimal,
    ) -> Decimal {
        lot_size * sl_pips * pip_value_per_lot
    }

    pub fn check_circuit_breakers(
        &self,
        cfg: &RiskConfig,
        counters: DailyCounters,
    ) -> CircuitBreakerCheck {
        check_circuit_breakers_impl(cfg, counters)
    }
}

fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value.max(Decimal::ZERO);
    }
    ((value / step).floor() * step).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn geometry_fix_flips_inverted_long_stops() {
        let eval = RiskEvaluator::new();
        let (sl, tp) = eval.fix_geometry(Direction::Long, dec!(100), dec!(101), dec!(99), dec!(1.5));
        assert!(sl < dec!(100));
        assert!(tp > dec!(100));
    }

    #[test]
    fn geometry_fix_clips_oversized_stop() {
        let eval = RiskEvaluator::new();
        // 2% away from entry, ceiling is 0.5%.
        let (sl, tp) = eval.fix_geometry(Direction::Long, dec!(100), dec!(98), dec!(110), dec!(1.5));
        assert_eq!(sl, dec!(99.5));
        assert_eq!(tp, dec!(110));
    }

    #[test]
    fn rr_clamp_moves_tp_to_bracket_edge() {
        let eval = RiskEvaluator::new();
        // S1: entry 1.08000, SL 1.07800 (risk 0.002), TP 1.08600 (reward
        // 0.006, R:R=3) with max_rr=2.2 clamps TP to 1.08440.
        let tp = eval.clamp_risk_reward(
            Direction::Long,
            dec!(1.08000),
            dec!(1.07800),
            dec!(1.08600),
            dec!(1.5),
            dec!(2.2),
        );
        assert_eq!(tp, dec!(1.08440));
    }

    #[test]
    fn rr_clamp_is_noop_within_bracket() {
        let eval = RiskEvaluator::new();
        let tp = eval.clamp_risk_reward(
            Direction::Long,
            dec!(100),
            dec!(99),
            dec!(102),
            dec!(1.0),
            dec!(3.0),
        );
        assert_eq!(tp, dec!(102));
    }

    #[test]
    fn position_sizing_matches_s1() {
        let eval = RiskEvaluator::new();
        // balance 10000, risk 1%, sl_distance=0.00200 (20 pips), pip
        // value $10/lot -> lot = 100 / (20*10) = 0.50
        let calc = eval.calculate_position_size(
            dec!(10000),
            dec!(1),
            dec!(0.00200),
            dec!(0.0001),
            dec!(10),
            dec!(0.01),
            dec!(0.01),
        );
        assert_eq!(calc.risk_amount, dec!(100));
        assert_eq!(calc.sl_pips, dec!(20));
        assert_eq!(calc.lot_size, dec!(0.50));
        assert!(!calc.stop_tightened);
    }

    #[test]
    fn position_sizing_tightens_stop_below_min_lot() {
        let eval = RiskEvaluator::new();
        // Tiny risk amount forces a lot below the 0.01 minimum; the stop
        // must tighten rather than the risk inflating.
        let calc = eval.calculate_position_size(
            dec!(100),
            dec!(0.1),
            dec!(0.01000),
            dec!(0.0001),
            dec!(10),
            dec!(0.01),
            dec!(0.01),
        );
        assert!(calc.stop_tightened);
        assert_eq!(calc.lot_size, dec!(0.01));
        let risk = eval.actual_risk(calc.lot_size, calc.sl_pips, calc.pip_value_per_lot);
        assert!(risk <= calc.risk_amount + dec!(0.0001));
    }

    #[test]
    fn margin_squeeze_clamps_then_rejects() {
        let eval = RiskEvaluator::new();
        // S3: margin_available=50, margin_per_lot=200 -> cap = 50*0.9/200 = 0.225
        let lot = eval
            .apply_hard_caps(dec!(1.0), dec!(50), dec!(200), dec!(0.01))
            .unwrap();
        assert_eq!(lot, dec!(0.225));

        // A smaller margin pool collapses the cap below min lot -> reject.
        let err = eval.apply_hard_caps(dec!(1.0), dec!(1), dec!(200), dec!(0.01));
        assert!(err.is_err());
    }

    #[test]
    fn circuit_breaker_halts_on_daily_loss_limit() {
        let eval = RiskEvaluator::new();
        let cfg = RiskConfig {
            risk_per_trade_percent: dec!(1),
            min_risk_reward: dec!(1.5),
            max_risk_reward: dec!(3),
            max_daily_trades: 20,
            max_daily_loss_percent: dec!(5),
            max_consecutive_losses: 3,
            account_drawdown_limit_percent: dec!(10),
        };
        let counters = DailyCounters {
            trades_today: 2,
            realized_pnl_percent_today: dec!(-5.5),
            consecutive_losses: 0,
            drawdown_from_peak_percent: dec!(0),
            manually_halted: false,
        };
        let check = eval.check_circuit_breakers(&cfg, counters);
        assert!(!check.can_trade);
        assert!(check
            .breakers_triggered
            .contains(&"daily_loss_limit".to_string()));
    }

    #[test]
    fn circuit_breaker_allows_trading_when_healthy() {
        let eval = RiskEvaluator::new();
        let cfg = RiskConfig {
            risk_per_trade_percent: dec!(1),
            min_risk_reward: dec!(1.5),
            max_risk_reward: dec!(3),
            max_daily_trades: 20,
            max_daily_loss_percent: dec!(5),
            max_consecutive_losses: 3,
            account_drawdown_limit_percent: dec!(10),
        };
        let counters = DailyCounters {
            trades_today: 1,
            realized_pnl_percent_today: dec!(0.5),
            consecutive_losses: 0,
            drawdown_from_peak_percent: dec!(1),
            manually_halted: false,
        };
        assert!(eval.check_circuit_breakers(&cfg, counters).can_trade);
    }
}
