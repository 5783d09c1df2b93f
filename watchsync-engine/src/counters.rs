//! Per-decision counters.
//!
//! Every `add` emits exactly one counter named `{backend}.{type}.{outcome}`;
//! the registry keeps them ordered for stable reporting.

use std::collections::BTreeMap;

use watchsync_model::MediaType;

/// The outcome classes a single observation can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Updated,
    Failed,
    FailedNoGuid,
    IgnoredNoChange,
    IgnoredNotPlayedSinceLastSync,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Added => "added",
            Outcome::Updated => "updated",
            Outcome::Failed => "failed",
            Outcome::FailedNoGuid => "failed_no_guid",
            Outcome::IgnoredNoChange => "ignored_no_change",
            Outcome::IgnoredNotPlayedSinceLastSync => "ignored_not_played_since_last_sync",
        }
    }
}

/// Ordered counter registry.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    counts: BTreeMap<String, u64>,
}

impl Counters {
    pub fn bump(&mut self, backend: &str, media_type: MediaType, outcome: Outcome) {
        let name = format!("{backend}.{}.{}", media_type.as_str(), outcome.as_str());
        *self.counts.entry(name).or_insert(0) += 1;
    }

    /// Read one counter by its full name, zero if never bumped.
    pub fn value(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn get(&self, backend: &str, media_type: MediaType, outcome: Outcome) -> u64 {
        self.value(&format!(
            "{backend}.{}.{}",
            media_type.as_str(),
            outcome.as_str()
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
