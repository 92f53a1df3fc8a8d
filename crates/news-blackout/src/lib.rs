//! The News Blackout Oracle. The economic-calendar data
//! source itself is an external collaborator — this crate only models the
//! contract the orchestrator calls against: `should_avoid_trading` and the
//! at-most-hourly `fetch_events` refresh.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Economic-event impact tier, matching the three-way split the filter
/// config exposes per tier (high/medium/low individually toggleable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Impact {
    High,
    Medium,
    Low,
}

/// A single calendar event as returned by the external data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    /// Three-letter currency code the event moves (e.g. `USD`, `EUR`).
    pub currency: String,
    pub impact: Impact,
    pub event_time: DateTime<Utc>,
}

/// Per-bot news-filter settings, part of the bot's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsFilterConfig {
    pub enabled: bool,
    pub filter_high_impact: bool,
    pub filter_medium_impact: bool,
    pub filter_low_impact: bool,
    pub minutes_before: i64,
    pub minutes_after: i64,
}

impl Default for NewsFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter_high_impact: true,
            filter_medium_impact: true,
            filter_low_impact: false,
            minutes_before: 30,
            minutes_after: 30,
        }
    }
}

impl NewsFilterConfig {
    fn blocks(&self, impact: Impact) -> bool {
        match impact {
            Impact::High => self.filter_high_impact,
            Impact::Medium => self.filter_medium_impact,
            Impact::Low => self.filter_low_impact,
        }
    }
}

/// Source of economic-calendar events, implemented outside this crate
///.
#[async_trait::async_trait]
pub trait CalendarFeed: Send + Sync {
    async fn fetch_events(&self) -> anyhow::Result<Vec<Event>>;
}

/// A feed with no events, for wiring tests and deployments without a
/// configured calendar provider.
pub struct EmptyCalendarFeed;

#[async_trait::async_trait]
impl CalendarFeed for EmptyCalendarFeed {
    async fn fetch_events(&self) -> anyhow::Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

const REFRESH_INTERVAL: Duration = Duration::hours(1);

/// Holds the currently known calendar events and refreshes them from a
/// [`CalendarFeed`] at most once an hour, mirroring `auto_trader.py`'s
/// `_maybe_refresh_news` cadence.
pub struct NewsBlackoutOracle {
    feed: Box<dyn CalendarFeed>,
    events: DashMap<(), Vec<Event>>,
    last_fetched_at: Mutex<Option<DateTime<Utc>>>,
}

impl NewsBlackoutOracle {
    pub fn new(feed: Box<dyn CalendarFeed>) -> Self {
        Self {
            feed,
            events: DashMap::new(),
            last_fetched_at: Mutex::new(None),
        }
    }

    /// Refreshes the cached event list from the feed if more than an hour
    /// has elapsed since the last successful refresh. A feed error leaves
    /// the previous cache (possibly empty) in place and is the caller's
    /// responsibility to log.
    pub async fn refresh_if_due(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = {
            let last = *self.last_fetched_at.lock().unwrap();
            match last {
                Some(at) => now - at > REFRESH_INTERVAL,
                None => true,
            }
        };
        if !due {
            return Ok(());
        }
        let fetched = self.feed.fetch_events().await?;
        tracing::debug!(count = fetched.len(), "economic calendar refreshed");
        self.events.insert((), fetched);
        *self.last_fetched_at.lock().unwrap() = Some(now);
        Ok(())
    }

    /// Checks whether `canonical_symbol` should be avoided right now per
    /// `cfg`. Returns the first blocking event found, if any. A disabled
    /// filter never blocks. This is a pure lookup over the last-refreshed
    /// cache — it never triggers a fetch itself.
    pub fn should_avoid_trading(
        &self,
        canonical_symbol: &str,
        cfg: &NewsFilterConfig,
    ) -> (bool, Option<Event>) {
        if !cfg.enabled {
            return (false, None);
        }
        let currencies = currencies_in(canonical_symbol);
        let now = Utc::now();
        let before = Duration::minutes(cfg.minutes_before);
        let after = Duration::minutes(cfg.minutes_after);

        let events = match self.events.get(&()) {
            Some(e) => e,
            None => return (false, None),
        };

        for event in events.iter() {
            if !currencies.contains(&event.currency.as_str()) {
                continue;
            }
            if !cfg.blocks(event.impact) {
                continue;
            }
            let window_start = event.event_time - before;
            let window_end = event.event_time + after;
            if now >= window_start && now <= window_end {
                tracing::debug!(symbol = canonical_symbol, event = %event.title, "news blackout active");
                return (true, Some(event.clone()));
            }
        }
        (false, None)
    }
}

/// Splits a canonical `BASE_QUOTE` symbol into its constituent currency
/// codes. Non-FX instruments (indices, metals, crypto) yield their single
/// canonical token unchanged so a calendar entry can still target them by
/// name (e.g. `XAU` events against `XAU_USD`).
fn currencies_in(canonical_symbol: &str) -> Vec<&str> {
    match canonical_symbol.split_once('_') {
        Some((base, quote)) if base.len() == 3 && quote.len() == 3 => vec![base, quote],
        _ => vec![canonical_symbol],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(currency: &str, impact: Impact, minutes_from_now: i64) -> Event {
        Event {
            title: "test event".to_string(),
            currency: currency.to_string(),
            impact,
            event_time: Utc::now() + Duration::minutes(minutes_from_now),
        }
    }

    fn oracle_with(events: Vec<Event>) -> NewsBlackoutOracle {
        let oracle = NewsBlackoutOracle::new(Box::new(EmptyCalendarFeed));
        oracle.events.insert((), events);
        oracle
    }

    #[test]
    fn s4_high_impact_usd_event_blocks_eur_usd_before_the_window() {
        // Event at T, now is T-20min, minutes_before=30 -> blocked.
        let oracle = oracle_with(vec![event("USD", Impact::High, 20)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, cause) = oracle.should_avoid_trading("EUR_USD", &cfg);
        assert!(blocked);
        assert_eq!(cause.unwrap().currency, "USD");
    }

    #[test]
    fn event_outside_the_window_does_not_block() {
        let oracle = oracle_with(vec![event("USD", Impact::High, 120)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, _) = oracle.should_avoid_trading("EUR_USD", &cfg);
        assert!(!blocked);
    }

    #[test]
    fn unrelated_currency_does_not_block() {
        let oracle = oracle_with(vec![event("JPY", Impact::High, 10)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, _) = oracle.should_avoid_trading("EUR_USD", &cfg);
        assert!(!blocked);
    }

    #[test]
    fn low_impact_not_filtered_by_default() {
        let oracle = oracle_with(vec![event("USD", Impact::Low, 5)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, _) = oracle.should_avoid_trading("EUR_USD", &cfg);
        assert!(!blocked);
    }

    #[test]
    fn disabled_filter_never_blocks() {
        let oracle = oracle_with(vec![event("USD", Impact::High, 0)]);
        let cfg = NewsFilterConfig {
            enabled: false,
            ..NewsFilterConfig::default()
        };
        let (blocked, _) = oracle.should_avoid_trading("EUR_USD", &cfg);
        assert!(!blocked);
    }

    #[test]
    fn after_window_still_blocks() {
        let oracle = oracle_with(vec![event("USD", Impact::High, -15)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, _) = oracle.should_avoid_trading("GBP_USD", &cfg);
        assert!(blocked);
    }

    #[test]
    fn non_fx_symbol_matches_on_its_own_token() {
        let oracle = oracle_with(vec![event("XAU", Impact::Medium, 10)]);
        let cfg = NewsFilterConfig::default();
        let (blocked, _) = oracle.should_avoid_trading("XAU_USD", &cfg);
        assert!(blocked);
    }

    #[tokio::test]
    async fn refresh_is_skipped_within_the_hour() {
        let oracle = NewsBlackoutOracle::new(Box::new(EmptyCalendarFeed));
        oracle.refresh_if_due().await.unwrap();
        let first = *oracle.last_fetched_at.lock().unwrap();
        oracle.refresh_if_due().await.unwrap();
        let second = *oracle.last_fetched_at.lock().unwrap();
        assert_eq!(first, second);
    }
}
