//! Timestamp source (C2): a strictly increasing counter scoped to the
//! scout id, plus the timestamp-mapping that accumulates the system
//! timestamps eventually bound to a client timestamp.

use crate::clock::{CausalClock, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Issues strictly increasing client timestamps for one scout.
///
/// `return_last_timestamp` exists so that a transaction which is
/// discarded without ever being committed (read-only, or cancelled before
/// any write) does not leave a permanent hole in the scout's vector: if
/// the most recently issued counter was never consumed by a commit, it is
/// safe to hand back out.
pub struct TimestampSource {
    source: crate::clock::SourceIdInline,
    counter: AtomicU64,
    last_issued_consumed: AtomicBool,
}

impl TimestampSource {
    pub fn new(source: impl Into<std::sync::Arc<str>>) -> Self {
        TimestampSource {
            source: source.into(),
            counter: AtomicU64::new(0),
            // No timestamp has been issued yet, so there is nothing to
            // "return"; treat it as already consumed.
            last_issued_consumed: AtomicBool::new(true),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source
    }

    /// Generate a fresh, strictly increasing timestamp.
    pub fn generate_new(&self) -> Timestamp {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_issued_consumed.store(false, Ordering::SeqCst);
        Timestamp::new(self.source.clone(), counter)
    }

    /// Mark the most recently issued timestamp as consumed (i.e. it will
    /// be committed, so the counter must not be reused).
    pub fn mark_consumed(&self) {
        self.last_issued_consumed.store(true, Ordering::SeqCst);
    }

    /// If the most recently issued timestamp was never consumed, decrement
    /// the counter so the next `generate_new` reissues it. Otherwise a
    /// no-op. This keeps the scout's vector from growing holes every time
    /// a read-only or cancelled transaction throws away its timestamp.
    pub fn return_last_timestamp(&self) {
        if !self.last_issued_consumed.swap(true, Ordering::SeqCst) {
            // Only decrement if nothing else has issued a newer timestamp
            // in between; a simple CAS loop keeps this correct under
            // concurrent callers while still being best-effort (a failed
            // CAS means someone else already moved the counter forward,
            // in which case there's nothing useful to return).
            let _ = self.counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                if c > 0 {
                    Some(c - 1)
                } else {
                    None
                }
            });
        }
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// One client timestamp plus zero or more system timestamps that were
/// eventually bound to it by the store. Once a system timestamp is
/// attached it is never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampMapping {
    pub client: Timestamp,
    system: Vec<Timestamp>,
}

impl TimestampMapping {
    pub fn new(client: Timestamp) -> Self {
        TimestampMapping {
            client,
            system: Vec::new(),
        }
    }

    pub fn attach_system_timestamp(&mut self, ts: Timestamp) {
        if !self.system.contains(&ts) {
            self.system.push(ts);
        }
    }

    pub fn system_timestamps(&self) -> &[Timestamp] {
        &self.system
    }

    /// True if any member (client or system) of this mapping is included
    /// in `clock`.
    pub fn any_timestamp_included(&self, clock: &CausalClock) -> bool {
        clock.includes(&self.client) || self.system.iter().any(|ts| clock.includes(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_new_strictly_increases() {
        let src = TimestampSource::new("scout-1");
        let a = src.generate_new();
        let b = src.generate_new();
        assert!(b.counter > a.counter);
    }

    #[test]
    fn return_last_timestamp_reclaims_unconsumed_counter() {
        let src = TimestampSource::new("scout-1");
        let a = src.generate_new();
        src.return_last_timestamp();
        let b = src.generate_new();
        assert_eq!(a.counter, b.counter);
    }

    #[test]
    fn return_last_timestamp_is_noop_once_consumed() {
        let src = TimestampSource::new("scout-1");
        let a = src.generate_new();
        src.mark_consumed();
        src.return_last_timestamp();
        let b = src.generate_new();
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn mapping_tracks_system_timestamps_and_is_append_only() {
        let client = Timestamp::new("scout-1", 1);
        let mut mapping = TimestampMapping::new(client.clone());
        assert!(mapping.system_timestamps().is_empty());

        let sys = Timestamp::new("dc1", 42);
        mapping.attach_system_timestamp(sys.clone());
        mapping.attach_system_timestamp(sys.clone());
        assert_eq!(mapping.system_timestamps().len(), 1);

        let mut clock = CausalClock::new();
        assert!(!mapping.any_timestamp_included(&clock));
        clock.record(&sys);
        assert!(mapping.any_timestamp_included(&clock));
    }
}
