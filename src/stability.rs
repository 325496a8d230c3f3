//! Stability tracking across runs
//!
//! The merge is pure: given the previous records, this run's observations and
//! a clock reading it returns the next records. Persistence lives in
//! [`crate::database`].

use crate::proxy::models::{FingerprintMode, ProxyCandidate, Tier};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default streak required for the stable subset
pub const DEFAULT_STABLE_STREAK: u32 = 5;

/// Default size of the stable subset
pub const DEFAULT_STABLE_LIMIT: usize = 100;

/// Default failure streak after which a candidate is dropped from outputs
pub const DEFAULT_MAX_FAILURE_STREAK: u32 = 3;

/// Default window for the recent-success artifact in hours
pub const DEFAULT_RECENT_WINDOW_HOURS: i64 = 24;

/// Persisted history for one fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilityRecord {
    pub fingerprint: String,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_status: Tier,
    pub last_success: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

/// One candidate's result in the current run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: String,
    pub tier: Tier,
    pub latency_ms: Option<u64>,
}

impl Observation {
    pub fn from_candidate(candidate: &ProxyCandidate, mode: FingerprintMode) -> Self {
        Self {
            fingerprint: candidate.fingerprint(mode),
            tier: candidate.tier(),
            latency_ms: candidate.test_result.latency_ms,
        }
    }

    /// Higher tier wins; equal tiers prefer the lower known latency
    fn is_better_than(&self, other: &Observation) -> bool {
        match self.tier.cmp(&other.tier) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (self.latency_ms, other.latency_ms) {
                (Some(a), Some(b)) => a < b,
                (Some(_), None) => true,
                _ => false,
            },
        }
    }
}

/// Policy knobs for stability and inclusion
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Lowest tier that counts as a successful run
    pub success_tier: Tier,
    /// Candidates whose failure streak exceeds this are left out of outputs
    pub max_failure_streak: u32,
    /// Minimum success streak for inclusion in outputs
    pub min_success_streak: u32,
    pub stable_streak: u32,
    pub stable_limit: usize,
    pub recent_window: ChronoDuration,
    pub fingerprint_mode: FingerprintMode,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            success_tier: Tier::ReachableOnly,
            max_failure_streak: DEFAULT_MAX_FAILURE_STREAK,
            min_success_streak: 0,
            stable_streak: DEFAULT_STABLE_STREAK,
            stable_limit: DEFAULT_STABLE_LIMIT,
            recent_window: ChronoDuration::hours(DEFAULT_RECENT_WINDOW_HOURS),
            fingerprint_mode: FingerprintMode::Endpoint,
        }
    }
}

impl StabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_success_tier(mut self, tier: Tier) -> Self {
        self.success_tier = tier;
        self
    }

    pub fn with_max_failure_streak(mut self, streak: u32) -> Self {
        self.max_failure_streak = streak;
        self
    }

    pub fn with_min_success_streak(mut self, streak: u32) -> Self {
        self.min_success_streak = streak;
        self
    }

    pub fn with_stable(mut self, streak: u32, limit: usize) -> Self {
        self.stable_streak = streak;
        self.stable_limit = limit;
        self
    }

    pub fn with_recent_window(mut self, window: ChronoDuration) -> Self {
        self.recent_window = window;
        self
    }

    pub fn with_fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint_mode = mode;
        self
    }

    pub fn is_success(&self, tier: Tier) -> bool {
        tier >= self.success_tier
    }

    /// Whether a record's history allows the candidate into outputs
    pub fn is_eligible(&self, record: Option<&StabilityRecord>) -> bool {
        match record {
            Some(r) => {
                r.failure_streak <= self.max_failure_streak
                    && r.success_streak >= self.min_success_streak
            }
            None => self.min_success_streak == 0,
        }
    }

    pub fn is_stable(&self, record: Option<&StabilityRecord>) -> bool {
        record.map_or(false, |r| r.success_streak >= self.stable_streak)
    }

    pub fn is_recent(&self, record: Option<&StabilityRecord>, now: DateTime<Utc>) -> bool {
        record
            .and_then(|r| r.last_success)
            .map_or(false, |at| now - at <= self.recent_window)
    }
}

/// Apply one observation to a fingerprint's previous record
pub fn merge_one(
    previous: Option<&StabilityRecord>,
    observation: &Observation,
    success_tier: Tier,
    now: DateTime<Utc>,
) -> StabilityRecord {
    let mut record = previous.cloned().unwrap_or_else(|| StabilityRecord {
        fingerprint: observation.fingerprint.clone(),
        success_streak: 0,
        failure_streak: 0,
        first_seen: now,
        last_seen: now,
        last_status: Tier::Unreached,
        last_success: None,
        last_latency_ms: None,
    });

    if observation.tier >= success_tier {
        record.success_streak = record.success_streak.saturating_add(1);
        record.failure_streak = 0;
        record.last_success = Some(now);
        record.last_latency_ms = observation.latency_ms;
    } else {
        record.failure_streak = record.failure_streak.saturating_add(1);
        record.success_streak = 0;
    }
    record.last_seen = now;
    record.last_status = observation.tier;
    record
}

/// Merge a run into the previous state.
///
/// Observations sharing a fingerprint collapse to the best one, so each
/// fingerprint advances at most once per run. Only touched records are
/// returned; absent fingerprints are left as they were.
pub fn merge(
    previous: &HashMap<String, StabilityRecord>,
    observations: &[Observation],
    success_tier: Tier,
    now: DateTime<Utc>,
) -> HashMap<String, StabilityRecord> {
    let mut best: HashMap<&str, &Observation> = HashMap::new();
    for observation in observations {
        best.entry(observation.fingerprint.as_str())
            .and_modify(|current| {
                if observation.is_better_than(current) {
                    *current = observation;
                }
            })
            .or_insert(observation);
    }

    best.into_iter()
        .map(|(fingerprint, observation)| {
            let record = merge_one(previous.get(fingerprint), observation, success_tier, now);
            (fingerprint.to_string(), record)
        })
        .collect()
}

/// Previous state with the run's updates applied
pub fn apply(
    previous: &HashMap<String, StabilityRecord>,
    updates: &HashMap<String, StabilityRecord>,
) -> HashMap<String, StabilityRecord> {
    let mut next = previous.clone();
    next.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    next
}
