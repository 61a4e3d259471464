//! TTL cache of offerings that recently returned insufficient capacity
//!
//! Writers are the launch reconciler (on an ICE response) and the scheduler's
//! capacity notifications; the reader is the scheduler's offering filter.
//! Entries age out so the provider gets re-tried once capacity may be back.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60);

/// Concurrent (instance type × zone × capacity type) → expiry map
pub struct UnavailableOfferings {
    entries: DashMap<(String, String, String), Instant>,
    ttl: Duration,
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl UnavailableOfferings {
    /// Create a cache with the given entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record an offering as unavailable for the TTL
    pub fn mark(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        debug!(
            instance_type,
            zone, capacity_type, "Marking offering unavailable"
        );
        self.entries.insert(
            (
                instance_type.to_string(),
                zone.to_string(),
                capacity_type.to_string(),
            ),
            Instant::now() + self.ttl,
        );
    }

    /// True when the offering recently returned insufficient capacity
    pub fn is_unavailable(&self, instance_type: &str, zone: &str, capacity_type: &str) -> bool {
        let key = (
            instance_type.to_string(),
            zone.to_string(),
            capacity_type.to_string(),
        );
        // copy the expiry out so the shard lock is released before removal
        let expiry = self.entries.get(&key).map(|e| *e);
        match expiry {
            Some(expiry) if expiry > Instant::now() => true,
            Some(_) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Number of live entries (expired entries may still be counted)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no offerings are marked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_offerings_are_unavailable_until_ttl() {
        let cache = UnavailableOfferings::new(Duration::from_secs(60));
        assert!(!cache.is_unavailable("inf1.6xlarge", "zone-a", "on-demand"));

        cache.mark("inf1.6xlarge", "zone-a", "on-demand");
        assert!(cache.is_unavailable("inf1.6xlarge", "zone-a", "on-demand"));
        // other dimensions unaffected
        assert!(!cache.is_unavailable("inf1.6xlarge", "zone-b", "on-demand"));
        assert!(!cache.is_unavailable("inf1.6xlarge", "zone-a", "spot"));
    }

    #[test]
    fn entries_expire() {
        let cache = UnavailableOfferings::new(Duration::ZERO);
        cache.mark("m5.xlarge", "zone-a", "spot");
        assert!(!cache.is_unavailable("m5.xlarge", "zone-a", "spot"));
        assert!(cache.is_empty());
    }
}
