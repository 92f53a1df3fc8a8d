//! Canonical instrument identity: symbol spelling, price geometry and the
//! price-plausibility guard that protects the pipeline from a broker
//! resolving a canonical symbol to the wrong native instrument.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Broad classification used to pick pip size, decimals and plausibility
/// bounds. Not exhaustive of every tradeable instrument — unknown symbols
/// fall back to `AssetClass::Index`, the most conservative bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetClass {
    Fx,
    FxJpy,
    Metal,
    Energy,
    Index,
    Crypto,
}

/// Canonicalize a raw broker/user-supplied symbol into the orchestrator's
/// single spelling. Strips separators and whitespace, classifies, and
/// rejoins 6-letter FX pairs as `BASE_QUOTE`. Indices and commodity codes
/// are returned upper-cased and unchanged otherwise.
///
/// `canonicalize(canonicalize(s)) == canonicalize(s)` for any input.
pub fn canonicalize(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if is_fx_pair(&stripped) {
        format!("{}_{}", &stripped[0..3], &stripped[3..6])
    } else {
        stripped
    }
}

fn is_fx_pair(s: &str) -> bool {
    s.len() == 6 && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Classify a canonical symbol into its broad asset class.
pub fn classify(canonical: &str) -> AssetClass {
    if canonical.starts_with("XAU") {
        AssetClass::Metal
    } else if canonical.starts_with("XAG") {
        AssetClass::Metal
    } else if canonical.contains("WTI") || canonical.contains("OIL") || canonical.contains("BRENT") {
        AssetClass::Energy
    } else if canonical.contains("BTC") || canonical.contains("ETH") || canonical.ends_with("USDT") {
        AssetClass::Crypto
    } else if canonical.len() == 7 && canonical.contains('_') {
        // FX pair BASE_QUOTE
        if canonical.starts_with("JPY") || canonical.ends_with("_JPY") {
            AssetClass::FxJpy
        } else {
            AssetClass::Fx
        }
    } else {
        AssetClass::Index
    }
}

/// Pip size: FX JPY -> 0.01, FX other -> 0.0001, XAU -> 0.10,
/// XAG -> 0.01, oil -> 0.01, indices -> 1.0.
pub fn pip_size(canonical: &str) -> Decimal {
    match classify(canonical) {
        AssetClass::FxJpy => dec!(0.01),
        AssetClass::Fx => dec!(0.0001),
        AssetClass::Metal if canonical.starts_with("XAU") => dec!(0.10),
        AssetClass::Metal => dec!(0.01), // XAG
        AssetClass::Energy => dec!(0.01),
        AssetClass::Index | AssetClass::Crypto => dec!(1.0),
    }
}

/// Decimal places used to round displayed/aggregated prices,
pub fn decimals(canonical: &str) -> u32 {
    match classify(canonical) {
        AssetClass::FxJpy => 3,
        AssetClass::Metal if canonical.starts_with("XAU") => 2,
        AssetClass::Index => 1,
        AssetClass::Fx => 5,
        AssetClass::Metal => 3, // XAG
        AssetClass::Energy => 3, // same 0.01 pip granularity as XAG/FxJpy
        AssetClass::Crypto => 2,
    }
}

/// A lightweight price sample decoupled from any broker wire type, used
/// purely for the plausibility guard below.
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub bid: Decimal,
    pub ask: Decimal,
    pub at: DateTime<Utc>,
}

impl PriceSample {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }
}

/// Reason a tick was rejected by the plausibility guard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlausibilityError {
    #[error("ask {ask} < bid {bid}")]
    CrossedBook { bid: String, ask: String },
    #[error("mid {mid} outside plausible bounds [{low}, {high}] for {class:?}")]
    OutOfBounds {
        mid: String,
        low: String,
        high: String,
        class: AssetClass,
    },
    #[error("spread/mid ratio {ratio} exceeds limit {limit}")]
    SpreadTooWide { ratio: String, limit: String },
    #[error("mid {mid} deviates {ratio}x from last-valid mid {last_valid} (limit {limit}x)")]
    MidJump {
        mid: String,
        last_valid: String,
        ratio: String,
        limit: String,
    },
}

/// Plausibility bounds `(low, high)` per asset class.
fn bounds(class: AssetClass) -> (Decimal, Decimal) {
    match class {
        AssetClass::Fx => (dec!(0.02), dec!(10.0)),
        AssetClass::FxJpy => (dec!(1.0), dec!(1000.0)),
        AssetClass::Metal => (dec!(0.5), dec!(5000.0)),
        AssetClass::Energy => (dec!(1.0), dec!(500.0)),
        AssetClass::Index => (dec!(1.0), dec!(500000.0)),
        AssetClass::Crypto => (dec!(0.0001), dec!(10000000.0)),
    }
}

fn spread_ratio_limit(class: AssetClass) -> Decimal {
    match class {
        AssetClass::Fx | AssetClass::FxJpy => dec!(0.05),
        _ => dec!(0.20),
    }
}

fn mid_jump_limit(class: AssetClass) -> Decimal {
    match class {
        AssetClass::Fx | AssetClass::FxJpy => dec!(3.0),
        _ => dec!(6.0),
    }
}

/// Stores the last-valid mid per canonical symbol within a 1-hour rolling
/// window and enforces the plausibility and staleness tick guards. One
/// instance per broker session (it is specific to what that broker has been
/// reporting).
#[derive(Default)]
pub struct PriceGuard {
    last_valid: DashMap<String, (Decimal, DateTime<Utc>)>,
}

impl PriceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a tick for `canonical`. On success, the last-valid mid cache
    /// is updated. On rejection, the cache is left untouched — the guard is
    /// idempotent under rejection (Testable property #8).
    pub fn check(&self, canonical: &str, sample: PriceSample) -> Result<(), PlausibilityError> {
        if sample.ask < sample.bid {
            return Err(PlausibilityError::CrossedBook {
                bid: sample.bid.to_string(),
                ask: sample.ask.to_string(),
            });
        }

        let class = classify(canonical);
        let mid = sample.mid();
        let (low, high) = bounds(class);
        if mid < low || mid > high {
            return Err(PlausibilityError::OutOfBounds {
                mid: mid.to_string(),
                low: low.to_string(),
                high: high.to_string(),
                class,
            });
        }

        if mid > Decimal::ZERO {
            let spread = sample.ask - sample.bid;
            let ratio = spread / mid;
            let limit = spread_ratio_limit(class);
            if ratio > limit {
                return Err(PlausibilityError::SpreadTooWide {
                    ratio: ratio.to_string(),
                    limit: limit.to_string(),
                });
            }
        }

        if let Some(entry) = self.last_valid.get(canonical) {
            let (last_mid, last_at) = *entry;
            if sample.at - last_at <= Duration::hours(1) && last_mid > Decimal::ZERO {
                let ratio = if mid >= last_mid {
                    mid / last_mid
                } else {
                    last_mid / mid
                };
                let limit = mid_jump_limit(class);
                if ratio > limit {
                    return Err(PlausibilityError::MidJump {
                        mid: mid.to_string(),
                        last_valid: last_mid.to_string(),
                        ratio: ratio.to_string(),
                        limit: limit.to_string(),
                    });
                }
            }
        }

        self.last_valid
            .insert(canonical.to_string(), (mid, sample.at));
        Ok(())
    }
}
