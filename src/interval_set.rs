/// In-memory ordered set of disjoint `[start, end)` intervals over 64-bit
/// offsets.
///
/// Backed by a `BTreeMap` keyed by interval start, which gives `O(log n)`
/// neighbour lookups for `add`/`delete`/`is_inside` and an already-sorted
/// iteration order for `compact`/`outer_join`.
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "interval must be non-empty: {}..{}", start, end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    fn overlaps_or_touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    // keyed by start; invariant: entries are disjoint and non-adjacent
    // (adjacent/overlapping entries are always merged by `add`).
    intervals: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn sum(&self) -> u64 {
        self.intervals.iter().map(|(s, e)| e - s).sum()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Interval> + '_ {
        self.intervals.iter().map(|(&s, &e)| Interval::new(s, e))
    }

    /// Adds `[start, end)`, merging with any overlapping or touching
    /// neighbours.
    pub fn add(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // merge with predecessor(s) and successor(s) that overlap or touch.
        let mut to_remove = Vec::new();
        for (&s, &e) in self.intervals.range(..) {
            if Interval::new(s, e).overlaps_or_touches(&Interval::new(new_start, new_end)) {
                new_start = new_start.min(s);
                new_end = new_end.max(e);
                to_remove.push(s);
            }
        }
        for s in to_remove {
            self.intervals.remove(&s);
        }
        self.intervals.insert(new_start, new_end);
    }

    /// Removes `[start, end)` from the set, splitting any interval that
    /// straddles a boundary.
    pub fn delete(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let affected: Vec<(u64, u64)> = self
            .intervals
            .range(..)
            .filter(|&(&s, &e)| s < end && start < e)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in affected {
            self.intervals.remove(&s);
            if s < start {
                self.intervals.insert(s, start.min(e));
            }
            if e > end {
                self.intervals.insert(end.max(s), e);
            }
        }
    }

    /// Drops every interval (or part of an interval) at or above `at`.
    pub fn cut(&mut self, at: u64) {
        let affected: Vec<(u64, u64)> = self
            .intervals
            .range(..)
            .filter(|&(&s, &e)| e > at)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in affected {
            self.intervals.remove(&s);
            if s < at {
                self.intervals.insert(s, at);
            }
        }
    }

    pub fn is_inside(&self, x: u64) -> bool {
        // last interval whose start is <= x
        self.intervals
            .range(..=x)
            .next_back()
            .map(|(&_s, &e)| e > x)
            .unwrap_or(false)
    }

    /// The interval containing `x`, if any.
    pub fn containing(&self, x: u64) -> Option<Interval> {
        self.intervals
            .range(..=x)
            .next_back()
            .and_then(|(&s, &e)| if e > x { Some(Interval::new(s, e)) } else { None })
    }

    /// Pieces of `self` not covered by `other`: `self \ other`.
    pub fn outer_join(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = IntervalSet::new();
        for iv in self.iter() {
            let mut cursor = iv.start;
            for other_iv in other
                .iter()
                .filter(|o| o.start < iv.end && o.end > iv.start)
            {
                if other_iv.start > cursor {
                    result.add(cursor, other_iv.start.min(iv.end));
                }
                cursor = cursor.max(other_iv.end);
                if cursor >= iv.end {
                    break;
                }
            }
            if cursor < iv.end {
                result.add(cursor, iv.end);
            }
        }
        result
    }

    /// Merges the closest neighbouring intervals (by gap size) until the
    /// interval count is at most `max_count`, returning the intervals that
    /// were swallowed by the merges (the regions now claimed as "synced"
    /// that in fact are not — the false positives the data model tolerates).
    pub fn compact(&mut self, max_count: usize) -> Vec<Interval> {
        let mut swallowed = Vec::new();
        if max_count == 0 {
            return swallowed;
        }
        loop {
            if self.intervals.len() <= max_count {
                break;
            }
            let ivs: Vec<Interval> = self.iter().collect();
            // find the smallest gap between consecutive intervals.
            let mut best_idx = None;
            let mut best_gap = u64::MAX;
            for w in ivs.windows(2) {
                let gap = w[1].start - w[0].end;
                if gap < best_gap {
                    best_gap = gap;
                    best_idx = Some(w[0].start);
                }
            }
            let Some(left_start) = best_idx else { break };
            let left_idx = ivs.iter().position(|iv| iv.start == left_start).unwrap();
            let left = ivs[left_idx];
            let right = ivs[left_idx + 1];
            if left.end < right.start {
                swallowed.push(Interval::new(left.end, right.start));
            }
            self.intervals.remove(&left.start);
            self.intervals.remove(&right.start);
            self.intervals.insert(left.start, right.end);
        }
        swallowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_merges_overlapping_and_touching_intervals() {
        let mut s = IntervalSet::new();
        s.add(0, 10);
        s.add(10, 20); // touching
        s.add(25, 30);
        s.add(28, 40); // overlapping
        assert_eq!(s.count(), 2);
        assert_eq!(s.sum(), 20 + 15);
    }

    #[test]
    fn delete_splits_straddling_interval() {
        let mut s = IntervalSet::new();
        s.add(0, 100);
        s.delete(40, 60);
        assert_eq!(s.count(), 2);
        assert!(s.is_inside(10));
        assert!(!s.is_inside(50));
        assert!(s.is_inside(80));
    }

    #[test]
    fn cut_drops_everything_at_or_above() {
        let mut s = IntervalSet::new();
        s.add(0, 50);
        s.add(100, 150);
        s.cut(120);
        assert_eq!(s.sum(), 50 + 20);
        assert!(!s.is_inside(130));
        assert!(s.is_inside(110));
    }

    #[test]
    fn is_inside_is_half_open() {
        let mut s = IntervalSet::new();
        s.add(10, 20);
        assert!(!s.is_inside(9));
        assert!(s.is_inside(10));
        assert!(s.is_inside(19));
        assert!(!s.is_inside(20));
    }

    #[test]
    fn outer_join_returns_uncovered_pieces() {
        let mut a = IntervalSet::new();
        a.add(0, 100);
        let mut b = IntervalSet::new();
        b.add(20, 40);
        b.add(60, 70);
        let joined = a.outer_join(&b);
        let pieces: Vec<Interval> = joined.iter().collect();
        assert_eq!(
            pieces,
            vec![
                Interval::new(0, 20),
                Interval::new(40, 60),
                Interval::new(70, 100),
            ]
        );
    }

    #[test]
    fn compact_merges_closest_neighbours_and_reports_swallowed() {
        let mut s = IntervalSet::new();
        // three 1-byte intervals with varying gaps.
        s.add(0, 1);
        s.add(10, 11); // gap of 9 from previous
        s.add(12, 13); // gap of 1 from previous: closest pair
        assert_eq!(s.count(), 3);
        let swallowed = s.compact(2);
        assert_eq!(s.count(), 2);
        assert_eq!(swallowed, vec![Interval::new(11, 12)]);
    }

    #[test]
    fn compact_is_lossless_union_with_swallowed() {
        let mut s = IntervalSet::new();
        for i in 0..20u64 {
            s.add(i * 10, i * 10 + 1);
        }
        let before_sum = s.sum();
        let before: Vec<Interval> = s.iter().collect();
        let swallowed = s.compact(5);
        let after_sum: u64 = s.sum();
        let swallowed_sum: u64 = swallowed.iter().map(|iv| iv.len()).sum();
        // union(after, swallowed) == before, by byte count.
        assert_eq!(after_sum + swallowed_sum, before.iter().map(|iv| iv.len()).sum::<u64>() + (before_sum - before_sum));
        assert!(s.count() <= 5);
    }
}
