//! Per-adapter mapping of canonical symbol to broker-native spelling, plus
//! the 5-minute instrument-spec cache referenced alongside it in the spec.
//! One [`SymbolResolver`] lives per broker session; its symbol map grows
//! monotonically and is safe to read from multiple tasks without locking
//! once the broker's instrument list has been indexed.

use broker_trait::{InstrumentSpec, Side};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

const TRADEABLE_SUFFIXES: &[&str] = &["+", ".stp", ".pro", ".raw", "m", "."];
const NEGATIVE_CACHE_MINUTES: i64 = 10;
const SPEC_CACHE_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotFound { canonical: String },
    RecentlyFailed { canonical: String, side: Side },
}

/// Resolves canonical symbols against one broker's native instrument list
/// and caches both instrument specs and resolution failures.
pub struct SymbolResolver {
    /// canonical -> broker-native symbol, memoized for the session.
    resolved: DashMap<String, String>,
    /// (canonical, side) -> instant of failure, for the 10-minute penalty box.
    negative: DashMap<(String, Side), DateTime<Utc>>,
    /// canonical -> (spec, cached_at), refreshed at most every 5 minutes.
    specs: DashMap<String, (InstrumentSpec, DateTime<Utc>)>,
    /// The broker's full native instrument universe, indexed once at
    /// session start by `index_symbols`.
    broker_symbols: DashMap<(), Vec<String>>,
    aliases: HashMap<String, Vec<String>>,
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new(default_aliases())
    }
}

impl SymbolResolver {
    pub fn new(aliases: HashMap<String, Vec<String>>) -> Self {
        Self {
            resolved: DashMap::new(),
            negative: DashMap::new(),
            specs: DashMap::new(),
            broker_symbols: DashMap::new(),
            aliases,
        }
    }

    /// Index the broker's full native symbol list. Called once when a new
    /// broker session starts ; safe to call again to refresh.
    pub fn index_symbols(&self, symbols: Vec<String>) {
        self.broker_symbols.insert((), symbols);
    }

    fn universe(&self) -> Vec<String> {
        self.broker_symbols
            .get(&())
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Resolve `canonical` to the broker's native spelling for `side`.
    /// Memoizes success for the session and caches failure negatively for
    /// 10 minutes keyed by `(canonical, side)`.
    pub fn resolve(&self, canonical: &str, side: Side) -> Result<String, ResolveError> {
        if let Some(hit) = self.resolved.get(canonical) {
            return Ok(hit.clone());
        }

        let key = (canonical.to_string(), side);
        if let Some(failed_at) = self.negative.get(&key) {
            if Utc::now() - *failed_at < Duration::minutes(NEGATIVE_CACHE_MINUTES) {
                return Err(ResolveError::RecentlyFailed {
                    canonical: canonical.to_string(),
                    side,
                });
            }
            drop(failed_at);
            self.negative.remove(&key);
        }

        match self.resolve_uncached(canonical) {
            Some(native) => {
                tracing::debug!(canonical, native = %native, "resolved symbol");
                self.resolved.insert(canonical.to_string(), native.clone());
                Ok(native)
            }
            None => {
                tracing::warn!(canonical, ?side, "symbol unresolvable, caching negatively");
                self.negative.insert(key, Utc::now());
                Err(ResolveError::NotFound {
                    canonical: canonical.to_string(),
                })
            }
        }
    }

    fn resolve_uncached(&self, canonical: &str) -> Option<String> {
        let universe = self.universe();
        if universe.is_empty() {
            return None;
        }
        let base = canonical.replace('_', "").to_uppercase();

        // 1. Direct hit (case-insensitive exact match on the stripped base).
        if let Some(hit) = universe.iter().find(|b| b.to_uppercase() == base) {
            return Some(hit.clone());
        }

        // 2. Known alias list, exact match.
        let aliases = self
            .aliases
            .get(canonical)
            .cloned()
            .unwrap_or_default();
        for alias in &aliases {
            if let Some(hit) = universe.iter().find(|b| b.to_uppercase() == alias.to_uppercase()) {
                return Some(hit.clone());
            }
        }

        // 3. Tradeable suffix variants on the base symbol.
        for suffix in TRADEABLE_SUFFIXES {
            let candidate = format!("{base}{}", suffix.to_uppercase());
            if let Some(hit) = universe.iter().find(|b| b.to_uppercase() == candidate) {
                return Some(hit.clone());
            }
        }
        // ...and on each alias, since e.g. "US30" should also match "US30.stp".
        for alias in &aliases {
            for suffix in TRADEABLE_SUFFIXES {
                let candidate = format!("{}{}", alias.to_uppercase(), suffix.to_uppercase());
                if let Some(hit) = universe.iter().find(|b| b.to_uppercase() == candidate) {
                    return Some(hit.clone());
                }
            }
        }

        // 4. Prefix/substring fuzzy match, either direction.
        if let Some(hit) = universe
            .iter()
            .find(|b| b.to_uppercase().starts_with(&base) || base.starts_with(&b.to_uppercase()))
        {
            return Some(hit.clone());
        }
        for alias in &aliases {
            let alias_up = alias.to_uppercase();
            if let Some(hit) = universe.iter().find(|b| {
                let b_up = b.to_uppercase();
                b_up.starts_with(&alias_up) || alias_up.starts_with(&b_up)
            }) {
                return Some(hit.clone());
            }
        }

        // 5. Bracket-stripped match, e.g. broker spelling "[US30]" or ".US30".
        if let Some(hit) = universe.iter().find(|b| strip_decorations(b) == base) {
            return Some(hit.clone());
        }
        for alias in &aliases {
            let alias_up = alias.to_uppercase();
            if let Some(hit) = universe.iter().find(|b| strip_decorations(b) == alias_up) {
                return Some(hit.clone());
            }
        }

        None
    }

    /// Cached instrument spec for `canonical`, refreshed via `refresh` at
    /// most every 5 minutes. Returns `None` on a cache miss so the caller
    /// can fetch and call [`SymbolResolver::store_spec`].
    pub fn cached_spec(&self, canonical: &str) -> Option<InstrumentSpec> {
        self.specs.get(canonical).and_then(|entry| {
            let (spec, cached_at) = entry.value().clone();
            if Utc::now() - cached_at < Duration::minutes(SPEC_CACHE_MINUTES) {
                Some(spec)
            } else {
                None
            }
        })
    }

    pub fn store_spec(&self, canonical: &str, spec: InstrumentSpec) {
        self.specs
            .insert(canonical.to_string(), (spec, Utc::now()));
    }
}

fn strip_decorations(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// A minimal built-in alias table for widely-traded indices and metals.
/// Deployments are expected to extend this via [`SymbolResolver::new`].
fn default_aliases() -> HashMap<String, Vec<String>> {
    let mut m = HashMap::new();
    m.insert("US30".to_string(), vec!["DJ30".to_string(), "WS30".to_string()]);
    m.insert(
        "NAS100".to_string(),
        vec!["USTEC".to_string(), "NDX100".to_string()],
    );
    m.insert("US500".to_string(), vec!["SPX500".to_string()]);
    m.insert(
        "XAU_USD".to_string(),
        vec!["GOLD".to_string(), "XAUUSD".to_string()],
    );
    m.insert(
        "XAG_USD".to_string(),
        vec!["SILVER".to_string(), "XAGUSD".to_string()],
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(universe: &[&str]) -> SymbolResolver {
        let r = SymbolResolver::default();
        r.index_symbols(universe.iter().map(|s| s.to_string()).collect());
        r
    }

    #[test]
    fn direct_hit() {
        let r = resolver_with(&["EURUSD", "GBPUSD"]);
        assert_eq!(r.resolve("EUR_USD", Side::Buy).unwrap(), "EURUSD");
    }

    #[test]
    fn suffix_variant() {
        let r = resolver_with(&["EURUSD+", "GBPUSDm"]);
        assert_eq!(r.resolve("EUR_USD", Side::Buy).unwrap(), "EURUSD+");
        assert_eq!(r.resolve("GBP_USD", Side::Buy).unwrap(), "GBPUSDm");
    }

    #[test]
    fn alias_hit() {
        let r = resolver_with(&["GOLD"]);
        assert_eq!(r.resolve("XAU_USD", Side::Buy).unwrap(), "GOLD");
    }

    #[test]
    fn alias_with_suffix() {
        let r = resolver_with(&["US30.stp"]);
        assert_eq!(r.resolve("US30", Side::Buy).unwrap(), "US30.stp");
    }

    #[test]
    fn bracket_stripped_match() {
        let r = resolver_with(&["[US30]"]);
        assert_eq!(r.resolve("US30", Side::Buy).unwrap(), "[US30]");
    }

    #[test]
    fn resolution_is_memoized() {
        let r = resolver_with(&["EURUSD"]);
        assert_eq!(r.resolve("EUR_USD", Side::Buy).unwrap(), "EURUSD");
        r.index_symbols(vec![]); // clear universe; memoized result must survive
        assert_eq!(r.resolve("EUR_USD", Side::Buy).unwrap(), "EURUSD");
    }

    #[test]
    fn unresolvable_symbol_is_negatively_cached() {
        let r = resolver_with(&["EURUSD"]);
        let err1 = r.resolve("ZZZ_ZZZ", Side::Buy).unwrap_err();
        assert!(matches!(err1, ResolveError::NotFound { .. }));
        let err2 = r.resolve("ZZZ_ZZZ", Side::Buy).unwrap_err();
        assert!(matches!(err2, ResolveError::RecentlyFailed { .. }));
    }

    #[test]
    fn negative_cache_is_keyed_by_side() {
        let r = resolver_with(&["EURUSD"]);
        let _ = r.resolve("ZZZ_ZZZ", Side::Buy);
        // Different side is not covered by the Buy-side penalty box.
        let err = r.resolve("ZZZ_ZZZ", Side::Sell).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }
}
