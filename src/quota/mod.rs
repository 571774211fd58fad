//! Per-identity daily call quotas.
//!
//! Counters roll over at the UTC calendar day boundary. The admission path
//! uses [`QuotaTracker::admit`], which checks and records under one lock so
//! concurrent admits for the same identity cannot overshoot the limit.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};

struct DayUsage {
    day: NaiveDate,
    calls: u32,
}

/// Daily call counter keyed by identity.
pub struct QuotaTracker {
    usage: Mutex<HashMap<String, DayUsage>>,
    limit: u32,
}

impl QuotaTracker {
    pub fn new(limit: u32) -> Self {
        Self { usage: Mutex::new(HashMap::new()), limit }
    }

    /// Whether the identity may make another call today.
    pub fn can_make_call(&self, key: &str) -> bool {
        self.can_make_call_on(key, today())
    }

    /// Record one call for the identity, resetting the counter on a new day.
    pub fn record_call(&self, key: &str) {
        self.record_call_on(key, today());
    }

    /// Atomic check-and-record: returns true and counts the call iff the
    /// identity is under its daily limit.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_on(key, today())
    }

    /// Number of identities that have reached the limit today.
    pub fn over_limit_count(&self) -> usize {
        let day = today();
        let usage = self.usage.lock().unwrap();
        usage
            .values()
            .filter(|u| u.day == day && u.calls >= self.limit)
            .count()
    }

    /// Today's per-identity call counts, keyed by a short hash of the
    /// identity so raw keys never reach metric labels.
    pub fn usage_by_hash(&self) -> Vec<(String, u32)> {
        let day = today();
        let usage = self.usage.lock().unwrap();
        usage
            .iter()
            .filter(|(_, u)| u.day == day)
            .map(|(key, u)| (hash_key(key), u.calls))
            .collect()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn can_make_call_on(&self, key: &str, day: NaiveDate) -> bool {
        let usage = self.usage.lock().unwrap();
        match usage.get(key) {
            Some(u) if u.day == day => u.calls < self.limit,
            _ => true,
        }
    }

    fn record_call_on(&self, key: &str, day: NaiveDate) {
        let mut usage = self.usage.lock().unwrap();
        match usage.get_mut(key) {
            Some(u) if u.day == day => u.calls += 1,
            _ => {
                usage.insert(key.to_string(), DayUsage { day, calls: 1 });
            }
        }
    }

    fn admit_on(&self, key: &str, day: NaiveDate) -> bool {
        let mut usage = self.usage.lock().unwrap();
        match usage.get_mut(key) {
            Some(u) if u.day == day => {
                if u.calls < self.limit {
                    u.calls += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                usage.insert(key.to_string(), DayUsage { day, calls: 1 });
                true
            }
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn hash_key(key: &str) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(key.as_bytes()))
}
