//! Causal clock (C1): a vector clock with per-source exception intervals.
//!
//! Each source contributes a range `1..=upper` with a finite set of
//! explicit holes — counters within the range that are *not* included.
//! This is the representation spec.md §4.1 calls out explicitly ("a range
//! with a finite set of explicit holes"), rather than a plain per-source
//! counter, because a scout can learn about timestamp N+2 from a source
//! before it learns about N+1 (e.g. out-of-causal-order push delivery),
//! and must still answer `includes` correctly for both.

use std::collections::{BTreeSet, HashMap};

/// Opaque short scout/source identifier.
pub type SourceId = String;

/// Interned (cheaply cloneable) source id used inside [`Timestamp`].
pub type SourceIdInline = std::sync::Arc<str>;

/// A single (source, counter) timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Timestamp {
    pub source: SourceIdInline,
    pub counter: u64,
}

impl Timestamp {
    pub fn new(source: impl Into<std::sync::Arc<str>>, counter: u64) -> Self {
        Timestamp {
            source: source.into(),
            counter,
        }
    }
}

/// One source's contribution to a [`CausalClock`]: all counters in
/// `1..=upper` are included, except those listed in `holes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct SourceRange {
    upper: u64,
    holes: BTreeSet<u64>,
}

impl SourceRange {
    fn includes(&self, counter: u64) -> bool {
        counter >= 1 && counter <= self.upper && !self.holes.contains(&counter)
    }

    /// Record a single counter as included. Anything between the old
    /// upper bound and the new counter that wasn't previously recorded
    /// becomes an explicit hole.
    fn record(&mut self, counter: u64) {
        if counter == 0 {
            return;
        }
        if counter > self.upper {
            for gap in (self.upper + 1)..counter {
                self.holes.insert(gap);
            }
            self.upper = counter;
            self.holes.remove(&counter);
        } else {
            self.holes.remove(&counter);
        }
    }

    /// Record every counter in `1..=counter` as included, clearing holes
    /// at or below it.
    fn record_all_until(&mut self, counter: u64) {
        if counter > self.upper {
            self.upper = counter;
        }
        self.holes.retain(|&h| h > counter);
    }

    /// Pointwise union with `other`: a counter is included in the result
    /// iff it was included by either side.
    fn merge(&self, other: &SourceRange) -> SourceRange {
        let upper = self.upper.max(other.upper);
        let mut holes = BTreeSet::new();
        for c in 1..=upper {
            if !self.includes(c) && !other.includes(c) {
                holes.insert(c);
            }
        }
        SourceRange { upper, holes }
    }

    /// Pointwise intersection with `other`: a counter is included in the
    /// result iff it was included by both sides.
    fn intersect(&self, other: &SourceRange) -> SourceRange {
        let upper = self.upper.min(other.upper);
        let mut holes = BTreeSet::new();
        for c in 1..=upper {
            if !self.includes(c) || !other.includes(c) {
                holes.insert(c);
            }
        }
        SourceRange { upper, holes }
    }
}

/// Result of comparing two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Dominates,
    Dominated,
    Concurrent,
}

/// A mapping from source id to the set of counters included from that
/// source. An empty clock dominates nothing and is dominated by every
/// non-empty clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CausalClock {
    sources: HashMap<SourceId, SourceRange>,
}

impl CausalClock {
    pub fn new() -> Self {
        CausalClock::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.values().all(|r| r.upper == 0)
    }

    /// Record a single timestamp as included.
    pub fn record(&mut self, ts: &Timestamp) {
        self.sources
            .entry(ts.source.to_string())
            .or_default()
            .record(ts.counter);
    }

    /// Add `[1..=ts.counter]` for `ts.source`, filling in any holes.
    pub fn record_all_until(&mut self, ts: &Timestamp) {
        self.sources
            .entry(ts.source.to_string())
            .or_default()
            .record_all_until(ts.counter);
    }

    /// Remove a source entirely from the clock.
    pub fn drop_source(&mut self, source: &str) {
        self.sources.remove(source);
    }

    pub fn includes(&self, ts: &Timestamp) -> bool {
        self.sources
            .get(ts.source.as_ref())
            .map(|r| r.includes(ts.counter))
            .unwrap_or(false)
    }

    /// Pointwise union: counter included in the merge iff included by
    /// either side.
    pub fn merge(&mut self, other: &CausalClock) {
        for (source, other_range) in &other.sources {
            let merged = match self.sources.get(source) {
                Some(mine) => mine.merge(other_range),
                None => other_range.clone(),
            };
            self.sources.insert(source.clone(), merged);
        }
    }

    pub fn merged(&self, other: &CausalClock) -> CausalClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Pointwise intersection: counter included in the result iff included
    /// by both sides. Sources present on only one side contribute nothing.
    pub fn intersect(&mut self, other: &CausalClock) {
        let mut result = HashMap::new();
        for (source, range) in &self.sources {
            if let Some(other_range) = other.sources.get(source) {
                result.insert(source.clone(), range.intersect(other_range));
            }
        }
        self.sources = result;
    }

    pub fn intersected(&self, other: &CausalClock) -> CausalClock {
        let mut out = self.clone();
        out.intersect(other);
        out
    }

    /// Compare two clocks. Must never be symmetric-lossy: if neither side
    /// dominates, the result is `Concurrent`.
    pub fn compare_to(&self, other: &CausalClock) -> ClockOrdering {
        let self_dominates = self.weakly_dominates(other);
        let other_dominates = other.weakly_dominates(self);
        match (self_dominates, other_dominates) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::Dominated,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// True if every timestamp included in `other` is also included here.
    fn weakly_dominates(&self, other: &CausalClock) -> bool {
        for (source, other_range) in &other.sources {
            let mine = self.sources.get(source);
            for c in 1..=other_range.upper {
                if other_range.includes(c) {
                    let i_include = mine.map(|r| r.includes(c)).unwrap_or(false);
                    if !i_include {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Convenience: does `self` dominate-or-equal `other`? Used at call
    /// sites that only care about "is this clock at least as advanced".
    pub fn dominates(&self, other: &CausalClock) -> bool {
        matches!(self.compare_to(other), ClockOrdering::Dominates | ClockOrdering::Equal)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(source: &str, counter: u64) -> Timestamp {
        Timestamp::new(source, counter)
    }

    #[test]
    fn empty_clock_dominates_nothing_and_is_dominated_by_all() {
        let empty = CausalClock::new();
        let mut other = CausalClock::new();
        other.record(&ts("a", 1));

        assert_eq!(empty.compare_to(&other), ClockOrdering::Dominated);
        assert_eq!(other.compare_to(&empty), ClockOrdering::Dominates);
        assert_eq!(empty.compare_to(&empty), ClockOrdering::Equal);
    }

    #[test]
    fn record_and_includes() {
        let mut c = CausalClock::new();
        c.record(&ts("a", 1));
        c.record(&ts("a", 3));
        assert!(c.includes(&ts("a", 1)));
        assert!(!c.includes(&ts("a", 2)));
        assert!(c.includes(&ts("a", 3)));
        assert!(!c.includes(&ts("a", 4)));
    }

    #[test]
    fn record_all_until_fills_holes() {
        let mut c = CausalClock::new();
        c.record(&ts("a", 3));
        assert!(!c.includes(&ts("a", 1)));
        c.record_all_until(&ts("a", 3));
        assert!(c.includes(&ts("a", 1)));
        assert!(c.includes(&ts("a", 2)));
        assert!(c.includes(&ts("a", 3)));
    }

    #[test]
    fn merge_is_pointwise_union() {
        let mut a = CausalClock::new();
        a.record(&ts("x", 1));
        let mut b = CausalClock::new();
        b.record(&ts("x", 2));
        b.record(&ts("y", 5));

        let merged = a.merged(&b);
        assert!(merged.includes(&ts("x", 1)));
        assert!(merged.includes(&ts("x", 2)));
        assert!(merged.includes(&ts("y", 5)));
    }

    #[test]
    fn intersect_is_pointwise_intersection() {
        let mut a = CausalClock::new();
        a.record_all_until(&ts("x", 5));
        let mut b = CausalClock::new();
        b.record_all_until(&ts("x", 3));
        b.record(&ts("x", 4));

        let inter = a.intersected(&b);
        assert!(inter.includes(&ts("x", 3)));
        assert!(inter.includes(&ts("x", 4)));
        assert!(!inter.includes(&ts("x", 5)));
    }

    #[test]
    fn concurrent_when_neither_dominates() {
        let mut a = CausalClock::new();
        a.record(&ts("x", 1));
        let mut b = CausalClock::new();
        b.record(&ts("y", 1));
        assert_eq!(a.compare_to(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare_to(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn drop_source_removes_entirely() {
        let mut a = CausalClock::new();
        a.record(&ts("x", 1));
        a.record(&ts("y", 1));
        a.drop_source("x");
        assert!(!a.includes(&ts("x", 1)));
        assert!(a.includes(&ts("y", 1)));
    }
}
