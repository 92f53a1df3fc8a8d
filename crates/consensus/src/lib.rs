//! Combines N independent AI opinions into one directional decision with
//! aggregated trade parameters. Also carries the descriptive
//! agreement-level banding and per-provider weighting the original system
//! used to break close ties — never a gate on the entry criteria below.

use broker_trait::{Direction, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Directional call from a single model. `Hold` opinions (and errored ones,
/// modeled the same way) are excluded from the agreeing/total-valid
/// tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    Hold,
}

impl Signal {
    pub fn as_direction(self) -> Option<Direction> {
        match self {
            Signal::Long => Some(Direction::Long),
            Signal::Short => Some(Direction::Short),
            Signal::Hold => None,
        }
    }
}

/// One model's opinion. Errors never propagate as `Err` — an
/// oracle failure surfaces as `Opinion{signal: Hold, confidence: 0, error:
/// Some(...)}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    pub model: String,
    pub signal: Signal,
    pub confidence: Decimal,
    pub entry: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub break_even_trigger: Option<Decimal>,
    pub trailing_stop_pips: Option<Decimal>,
    pub style_tag: Option<String>,
    pub indicator_tags: Vec<String>,
    pub reasoning: String,
    pub error: Option<String>,
}

impl Opinion {
    pub fn errored(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            signal: Signal::Hold,
            confidence: Decimal::ZERO,
            entry: None,
            stop_loss: None,
            take_profit: None,
            break_even_trigger: None,
            trailing_stop_pips: None,
            style_tag: None,
            indicator_tags: Vec::new(),
            reasoning: String::new(),
            error: Some(error.into()),
        }
    }

    fn is_valid(&self) -> bool {
        self.error.is_none() && self.signal != Signal::Hold
    }
}

/// Descriptive-only agreement banding, never an entry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgreementLevel {
    Unanimous,
    Strong,
    Moderate,
    Weak,
    Split,
}

impl AgreementLevel {
    fn from_ratio(ratio: Decimal) -> Self {
        let pct = ratio * Decimal::from(100);
        if pct >= Decimal::from(100) {
            AgreementLevel::Unanimous
        } else if pct >= Decimal::from(80) {
            AgreementLevel::Strong
        } else if pct >= Decimal::from(60) {
            AgreementLevel::Moderate
        } else if pct >= Decimal::from(40) {
            AgreementLevel::Weak
        } else {
            AgreementLevel::Split
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub direction: Signal,
    pub mean_confidence: Decimal,
    pub models_agreed: usize,
    pub total_valid: usize,
    pub entry: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub break_even_trigger: Option<Decimal>,
    pub trailing_stop_pips: Option<Decimal>,
    pub is_strong_signal: bool,
    pub agreement_level: AgreementLevel,
}

/// Default per-model weight when a provider has no entry in the weight map.
const DEFAULT_WEIGHT: f64 = 1.0;

/// Tally `LONG` vs `SHORT` among valid (non-Hold, non-errored) opinions,
/// aggregate their numeric fields, and classify the overall agreement band.
/// `decimals` rounds the aggregated price fields to the instrument's
/// display precision.
pub fn aggregate(
    opinions: &[Opinion],
    provider_weights: &HashMap<String, f64>,
    decimals: u32,
) -> ConsensusResult {
    let valid: Vec<&Opinion> = opinions.iter().filter(|o| o.is_valid()).collect();

    if valid.is_empty() {
        return ConsensusResult {
            direction: Signal::Hold,
            mean_confidence: Decimal::ZERO,
            models_agreed: 0,
            total_valid: 0,
            entry: None,
            stop_loss: None,
            take_profit: None,
            break_even_trigger: None,
            trailing_stop_pips: None,
            is_strong_signal: false,
            agreement_level: AgreementLevel::Split,
        };
    }

    let longs: Vec<&Opinion> = valid
        .iter()
        .copied()
        .filter(|o| o.signal == Signal::Long)
        .collect();
    let shorts: Vec<&Opinion> = valid
        .iter()
        .copied()
        .filter(|o| o.signal == Signal::Short)
        .collect();

    let weight_of = |op: &Opinion| -> f64 {
        provider_weights
            .get(&op.model)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT)
    };

    let winner = match longs.len().cmp(&shorts.len()) {
        std::cmp::Ordering::Greater => Signal::Long,
        std::cmp::Ordering::Less => Signal::Short,
        std::cmp::Ordering::Equal => {
            // Tie: compare the weighted mean confidence of each side.
            let long_score = weighted_mean_confidence(&longs, weight_of);
            let short_score = weighted_mean_confidence(&shorts, weight_of);
            if long_score >= short_score {
                Signal::Long
            } else {
                Signal::Short
            }
        }
    };

    let agreeing: Vec<&Opinion> = valid
        .iter()
        .copied()
        .filter(|o| o.signal == winner)
        .collect();

    let mean_confidence = mean_decimal(agreeing.iter().map(|o| o.confidence));
    let entry = round_opt(mean_decimal_opt(agreeing.iter().map(|o| o.entry)), decimals);
    let stop_loss = round_opt(
        mean_decimal_opt(agreeing.iter().map(|o| o.stop_loss)),
        decimals,
    );
    let take_profit = round_opt(
        mean_decimal_opt(agreeing.iter().map(|o| o.take_profit)),
        decimals,
    );
    let break_even_trigger = round_opt(
        mean_decimal_opt(agreeing.iter().map(|o| o.break_even_trigger)),
        decimals,
    );
    let trailing_stop_pips = mean_decimal_opt(agreeing.iter().map(|o| o.trailing_stop_pips));

    let models_agreed = agreeing.len();
    let is_strong_signal = models_agreed >= 4 && mean_confidence >= Decimal::from(70);

    let ratio = Decimal::from(models_agreed as i64) / Decimal::from(valid.len() as i64);

    ConsensusResult {
        direction: winner,
        mean_confidence,
        models_agreed,
        total_valid: valid.len(),
        entry,
        stop_loss,
        take_profit,
        break_even_trigger,
        trailing_stop_pips,
        is_strong_signal,
        agreement_level: AgreementLevel::from_ratio(ratio),
    }
}

/// Entry criteria : all five must hold for the consensus to be
/// tradeable. `timeframe_alignment` is `None` when only one timeframe was
/// analyzed, in which case criterion 5 is vacuously satisfied.
pub fn should_enter(
    result: &ConsensusResult,
    min_confidence: Decimal,
    min_models_agree: usize,
    total_valid_models: usize,
    timeframe_alignment: Option<Decimal>,
) -> bool {
    if result.direction == Signal::Hold {
        return false;
    }
    if result.mean_confidence < min_confidence {
        return false;
    }
    if result.models_agreed < min_models_agree.min(total_valid_models) {
        return false;
    }
    if result.stop_loss.is_none() || result.take_profit.is_none() {
        return false;
    }
    if let Some(alignment) = timeframe_alignment {
        if alignment < Decimal::from(80) {
            return false;
        }
    }
    true
}

/// Per-timeframe consensus results, combined into an overall
/// `timeframe_alignment` percentage : the share of non-HOLD
/// timeframes that agree with the overall winning direction.
pub fn timeframe_alignment(overall: Signal, per_timeframe: &[(Timeframe, Signal)]) -> Option<Decimal> {
    let non_hold: Vec<&(Timeframe, Signal)> =
    per_timeframe.iter().filter(|(_, s)| *s != Signal::Hold).collect();
    if non_hold.is_empty() {
        return None;
    }
    let agreeing = non_hold.iter().filter(|(_, s)| *s == overall).count();
    Some(Decimal::from(agreeing as i64) * Decimal::from(100) / Decimal::from(non_hold.len() as i64))
}

fn weighted_mean_confidence(opinions: &[&Opinion], weight_of: impl Fn(&Opinion) -> f64) -> f64 {
    if opinions.is_empty() {
        return 0.0;
    }
    let mut total_weight = 0.0;
    let mut sum = 0.0;
    for op in opinions {
        let w = weight_of(op);
        sum += w * op.confidence.to_string().parse::<f64>().unwrap_or(0.0);
        total_weight += w;
    }
    if total_weight == 0.0 {
        0.0
    } else {
        sum / total_weight
    }
}

fn mean_decimal(values: impl Iterator<Item = Decimal>) -> Decimal {
    let values: Vec<Decimal> = values.collect();
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = values.iter().sum();
    sum / Decimal::from(values.len() as i64)
}

fn mean_decimal_opt(values: impl Iterator<Item = Option<Decimal>>) -> Option<Decimal> {
    let present: Vec<Decimal> = values.flatten().collect();
    if present.is_empty() {
        return None;
    }
    let sum: Decimal = present.iter().sum();
    Some(sum / Decimal::from(present.len() as i64))
}

fn round_opt(value: Option<Decimal>, decimals: u32) -> Option<Decimal> {
    value.map(|v| v.round_dp(decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_opinion(model: &str, confidence: Decimal, sl: Decimal, tp: Decimal) -> Opinion {
        Opinion {
            model: model.to_string(),
            signal: Signal::Long,
            confidence,
            entry: Some(dec!(1.08000)),
            stop_loss: Some(sl),
            take_profit: Some(tp),
            break_even_trigger: None,
            trailing_stop_pips: Some(dec!(15)),
            style_tag: None,
            indicator_tags: vec![],
            reasoning: String::new(),
            error: None,
        }
    }

    #[test]
    fn majority_wins_and_aggregates_only_agreeing() {
        let opinions = vec![
            long_opinion("a", dec!(80), dec!(1.07800), dec!(1.08600)),
            long_opinion("b", dec!(76), dec!(1.07800), dec!(1.08500)),
            long_opinion("c", dec!(74), dec!(1.07700), dec!(1.08700)),
            Opinion {
                signal: Signal::Short,
                ..long_opinion("d", dec!(90), dec!(1.08300), dec!(1.07500))
            },
        ];
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert_eq!(result.direction, Signal::Long);
        assert_eq!(result.models_agreed, 3);
        assert_eq!(result.total_valid, 4);
    }

    #[test]
    fn hold_and_errored_opinions_are_excluded() {
        let opinions = vec![
            long_opinion("a", dec!(80), dec!(1.07800), dec!(1.08600)),
            Opinion::errored("b", "timeout"),
            Opinion {
                signal: Signal::Hold,
                ..long_opinion("c", dec!(50), dec!(1.07800), dec!(1.08600))
            },
        ];
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert_eq!(result.total_valid, 1);
        assert_eq!(result.models_agreed, 1);
    }

    #[test]
    fn strong_signal_requires_four_agreeing_and_seventy_confidence() {
        let opinions: Vec<Opinion> = (0..4)
            .map(|i| long_opinion(&format!("m{i}"), dec!(75), dec!(1.07800), dec!(1.08600)))
            .collect();
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert!(result.is_strong_signal);

        let weak: Vec<Opinion> = (0..3)
            .map(|i| long_opinion(&format!("m{i}"), dec!(90), dec!(1.07800), dec!(1.08600)))
            .collect();
        let weak_result = aggregate(&weak, &HashMap::new(), 5);
        assert!(!weak_result.is_strong_signal);
    }

    #[test]
    fn single_model_can_never_be_a_strong_signal_but_can_still_trade() {
        let opinions = vec![long_opinion("solo", dec!(95), dec!(1.07800), dec!(1.08600))];
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert!(!result.is_strong_signal);
        assert!(should_enter(&result, dec!(70), 1, 1, None));
    }

    #[test]
    fn all_hold_yields_hold_direction_and_blocks_entry() {
        let opinions = vec![Opinion::errored("a", "oracle unavailable")];
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert_eq!(result.direction, Signal::Hold);
        assert!(!should_enter(&result, dec!(50), 1, 1, None));
    }

    #[test]
    fn missing_sl_or_tp_blocks_entry_even_with_direction() {
        let mut opinion = long_opinion("a", dec!(90), dec!(1.07800), dec!(1.08600));
        opinion.stop_loss = None;
        let result = aggregate(&[opinion], &HashMap::new(), 5);
        assert_eq!(result.direction, Signal::Long);
        assert!(!should_enter(&result, dec!(50), 1, 1, None));
    }

    #[test]
    fn timeframe_alignment_counts_only_non_hold() {
        let per_tf = vec![
            (Timeframe::M15, Signal::Long),
            (Timeframe::H1, Signal::Long),
            (Timeframe::H4, Signal::Hold),
            (Timeframe::D1, Signal::Short),
        ];
        let alignment = timeframe_alignment(Signal::Long, &per_tf).unwrap();
        // 2 of 3 non-HOLD timeframes agree -> 66.67%
        assert!(alignment > dec!(66) && alignment < dec!(67));
    }

    #[test]
    fn aligned_multi_timeframe_requires_eighty_percent() {
        let opinions = vec![long_opinion("a", dec!(90), dec!(1.07800), dec!(1.08600))];
        let result = aggregate(&opinions, &HashMap::new(), 5);
        assert!(should_enter(&result, dec!(50), 1, 1, Some(dec!(80))));
        assert!(!should_enter(&result, dec!(50), 1, 1, Some(dec!(79))));
    }
}
