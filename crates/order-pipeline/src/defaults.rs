//! Conservative per-class fallbacks used only when a broker's instrument
//! spec leaves a field empty. These numbers are
//! deliberately rough — they exist so the pipeline degrades gracefully
//! rather than crashing on an incomplete spec, not to be precise pricing.

use instrument_identity::{classify, AssetClass};
use rust_decimal::Decimal;

/// `pip_value_per_lot` fallback when the spec has no `tick_value`/`tick_size`.
pub fn default_pip_value_per_lot(canonical: &str) -> Decimal {
    if canonical.starts_with("XAG") {
        return Decimal::from(50);
    }
    match canonical {
        "US30" => Decimal::from(5),
        "NAS100" | "US500" => Decimal::from(10),
        "DE40" => Decimal::from(25),
        _ => match classify(canonical) {
            AssetClass::Fx | AssetClass::FxJpy | AssetClass::Metal | AssetClass::Energy => {
                Decimal::from(10)
            }
            AssetClass::Index => Decimal::from(10),
            AssetClass::Crypto => Decimal::from(1),
        },
    }
}

/// `margin_per_lot` fallback when the spec has no `contract_size` (or the
/// account has no leverage figure to divide by).
pub fn default_margin_per_lot(canonical: &str) -> Decimal {
    match classify(canonical) {
        AssetClass::Fx | AssetClass::FxJpy => Decimal::from(1000),
        AssetClass::Metal | AssetClass::Energy => Decimal::from(2000),
        AssetClass::Index => Decimal::from(500),
        AssetClass::Crypto => Decimal::from(5000),
    }
}
