//! Sparse sets of chunk indices.
//!
//! A [`RangeSet`] is an ascending list of single indices and closed
//! intervals. Canonical sets never overlap and never touch: `[2, 3]` is
//! always written as one interval, never as two singletons.
//!
//! # Wire format
//!
//! ```text
//! [0, [2, 4], 7]   // {0, 2, 3, 4, 7}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single index or a closed interval of indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkRange {
    Single(u64),
    Span(u64, u64),
}

impl ChunkRange {
    /// Builds the canonical range covering `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        if start == end {
            Self::Single(start)
        } else {
            Self::Span(start, end)
        }
    }

    pub fn start(&self) -> u64 {
        match *self {
            Self::Single(i) => i,
            Self::Span(s, e) => s.min(e),
        }
    }

    pub fn end(&self) -> u64 {
        match *self {
            Self::Single(i) => i,
            Self::Span(s, e) => s.max(e),
        }
    }

    /// Number of indices covered, saturating at `u64::MAX` for the full
    /// `0..=u64::MAX` span.
    pub fn len(&self) -> u64 {
        (self.end() - self.start()).saturating_add(1)
    }

    /// Always `false`: a range covers at least one index.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Ascending, non-overlapping list of [`ChunkRange`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet(Vec<ChunkRange>);

impl RangeSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// The whole universe `[0, total)`.
    pub fn full(total: u64) -> Self {
        if total == 0 {
            Self::new()
        } else {
            Self(vec![ChunkRange::new(0, total - 1)])
        }
    }

    /// Builds a canonical set from arbitrary ranges (any order, overlapping,
    /// touching or reversed).
    pub fn normalize(mut ranges: Vec<ChunkRange>) -> Self {
        ranges.sort_by_key(|r| (r.start(), r.end()));
        let mut set = Self::new();
        for r in ranges {
            set.push_span(r.start(), r.end());
        }
        set
    }

    pub fn ranges(&self) -> &[ChunkRange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of indices in the set.
    pub fn len(&self) -> u64 {
        self.0.iter().fold(0u64, |total, r| total.saturating_add(r.len()))
    }

    /// Last index of the final range, `None` for an empty set.
    pub fn last_index(&self) -> Option<u64> {
        self.0.last().map(ChunkRange::end)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.0
            .binary_search_by(|r| {
                if r.end() < index {
                    std::cmp::Ordering::Less
                } else if r.start() > index {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Lazily expands the set into its indices in ascending order.
    pub fn iter(&self) -> Indices<'_> {
        Indices {
            ranges: self.0.iter(),
            current: None,
        }
    }

    /// Returns `true` if ranges are ascending, disjoint and non-touching.
    pub fn is_canonical(&self) -> bool {
        let well_formed = self.0.iter().all(|r| match *r {
            ChunkRange::Single(_) => true,
            ChunkRange::Span(s, e) => s < e,
        });
        well_formed
            && self
                .0
                .windows(2)
                .all(|w| w[0].end().checked_add(1).is_some_and(|next| w[1].start() > next))
    }

    /// Appends `start..=end`, coalescing with the last range when they
    /// overlap or touch. Callers must append in ascending `start` order.
    fn push_span(&mut self, start: u64, end: u64) {
        if let Some(last) = self.0.last_mut() {
            let (ls, le) = (last.start(), last.end());
            if start <= le.saturating_add(1) {
                *last = ChunkRange::new(ls, le.max(end));
                return;
            }
        }
        self.0.push(ChunkRange::new(start, end));
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match *r {
                ChunkRange::Single(idx) => write!(f, "{idx}")?,
                ChunkRange::Span(s, e) => write!(f, "{s}-{e}")?,
            }
        }
        Ok(())
    }
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut indices: Vec<u64> = iter.into_iter().collect();
        indices.sort_unstable();
        merge(&indices)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = u64;
    type IntoIter = Indices<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy ascending iterator over the indices of a [`RangeSet`].
#[derive(Debug, Clone)]
pub struct Indices<'a> {
    ranges: std::slice::Iter<'a, ChunkRange>,
    /// Next index to yield and the inclusive end of the current range.
    current: Option<(u64, u64)>,
}

impl Iterator for Indices<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some((next, end)) = self.current {
                self.current = if next == end { None } else { Some((next + 1, end)) };
                return Some(next);
            }
            let r = self.ranges.next()?;
            self.current = Some((r.start(), r.end()));
        }
    }
}

/// Coalesces a sorted index list into its minimal range form.
///
/// Duplicates are tolerated. Unsorted input is sorted first.
pub fn merge(sorted_indices: &[u64]) -> RangeSet {
    if !sorted_indices.is_sorted() {
        let mut owned = sorted_indices.to_vec();
        owned.sort_unstable();
        return merge(&owned);
    }
    let mut set = RangeSet::new();
    for &index in sorted_indices {
        set.push_span(index, index);
    }
    set
}

/// Returns the indices of `[0, total)` that are not in `excluded`.
///
/// Runs in time proportional to the number of ranges, independent of
/// `total`. Indices of `excluded` at or beyond `total` are ignored.
pub fn complement(total: u64, excluded: &RangeSet) -> RangeSet {
    let normalized;
    let excluded = if excluded.is_canonical() {
        excluded
    } else {
        normalized = RangeSet::normalize(excluded.0.clone());
        &normalized
    };

    let mut out = RangeSet::new();
    let mut cursor = 0u64;
    for r in excluded.ranges() {
        if cursor >= total {
            break;
        }
        if r.start() > cursor {
            out.0.push(ChunkRange::new(cursor, (r.start() - 1).min(total - 1)));
        }
        cursor = cursor.max(r.end().saturating_add(1));
    }
    if cursor < total {
        out.0.push(ChunkRange::new(cursor, total - 1));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn expand(set: &RangeSet) -> Vec<u64> {
        set.iter().collect()
    }

    #[test]
    fn merge_coalesces_adjacent_indices() {
        let set = merge(&[0, 1, 2, 5, 7, 8]);
        assert_eq!(
            set.ranges(),
            &[
                ChunkRange::Span(0, 2),
                ChunkRange::Single(5),
                ChunkRange::Span(7, 8)
            ]
        );
    }

    #[test]
    fn merge_tolerates_duplicates_and_unsorted_input() {
        assert_eq!(merge(&[3, 1, 2, 2, 3]), merge(&[1, 2, 3]));
    }

    #[test]
    fn merge_empty() {
        let set = merge(&[]);
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        assert_eq!(set.last_index(), None);
    }

    #[test]
    fn expand_is_restartable() {
        let set = merge(&[1, 2, 3, 9]);
        assert_eq!(expand(&set), vec![1, 2, 3, 9]);
        assert_eq!(expand(&set), vec![1, 2, 3, 9]);
    }

    #[test]
    fn expand_huge_range_is_lazy() {
        let set = RangeSet::full(u64::MAX);
        let first: Vec<u64> = set.iter().take(3).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(set.len(), u64::MAX);
    }

    #[test]
    fn expand_range_ending_at_max() {
        let set = RangeSet::normalize(vec![ChunkRange::Span(u64::MAX - 1, u64::MAX)]);
        assert_eq!(expand(&set), vec![u64::MAX - 1, u64::MAX]);
    }

    #[test]
    fn length_and_last_index() {
        let set = merge(&[0, 1, 5, 8, 9]);
        assert_eq!(set.len(), 5);
        assert_eq!(set.last_index(), Some(9));
    }

    #[test]
    fn length_saturates_for_the_whole_index_space() {
        let all = ChunkRange::Span(0, u64::MAX);
        assert_eq!(all.len(), u64::MAX);
        assert_eq!(ChunkRange::Span(1, u64::MAX).len(), u64::MAX);

        let set = RangeSet::normalize(vec![ChunkRange::Single(0), ChunkRange::Span(2, u64::MAX)]);
        assert_eq!(set.len(), u64::MAX);
        assert_eq!(RangeSet::normalize(vec![all]).len(), u64::MAX);
    }

    #[test]
    fn contains_checks_every_range() {
        let set = merge(&[0, 1, 5, 8, 9]);
        for i in [0, 1, 5, 8, 9] {
            assert!(set.contains(i), "{i} should be present");
        }
        for i in [2, 3, 4, 6, 7, 10] {
            assert!(!set.contains(i), "{i} should be absent");
        }
    }

    #[test]
    fn complement_of_missing_chunks() {
        let have = merge(&[2, 3, 4, 7]);
        let missing = complement(10, &have);
        assert_eq!(
            missing.ranges(),
            &[
                ChunkRange::Span(0, 1),
                ChunkRange::Span(5, 6),
                ChunkRange::Span(8, 9)
            ]
        );
    }

    #[test]
    fn complement_edge_cases() {
        assert_eq!(complement(5, &RangeSet::new()), RangeSet::full(5));
        assert!(complement(5, &RangeSet::full(5)).is_empty());
        assert!(complement(0, &RangeSet::new()).is_empty());
        assert!(complement(3, &merge(&[0, 1, 2, 3, 4])).is_empty());
        assert_eq!(complement(4, &merge(&[0])), merge(&[1, 2, 3]));
        assert_eq!(complement(4, &merge(&[3, 10])), merge(&[0, 1, 2]));
    }

    #[test]
    fn complement_large_universe_is_fast() {
        let total = 10_000_000_000;
        let excluded: RangeSet = (0..100_000u64).map(|i| i * 2).collect();
        let missing = complement(total, &excluded);
        assert_eq!(missing.len(), total - 100_000);
        assert_eq!(missing.ranges().len(), 100_000);
    }

    #[test]
    fn complement_normalizes_non_canonical_input() {
        let messy = RangeSet(vec![
            ChunkRange::Span(5, 3),
            ChunkRange::Single(0),
            ChunkRange::Single(1),
        ]);
        assert!(!messy.is_canonical());
        assert_eq!(complement(7, &messy), merge(&[2, 6]));
    }

    #[test]
    fn canonical_detection() {
        assert!(merge(&[0, 2, 4]).is_canonical());
        assert!(!RangeSet(vec![ChunkRange::Single(0), ChunkRange::Single(1)]).is_canonical());
        assert!(!RangeSet(vec![ChunkRange::Span(2, 2)]).is_canonical());
        assert!(!RangeSet(vec![ChunkRange::Single(4), ChunkRange::Single(2)]).is_canonical());
    }

    #[test]
    fn json_wire_format() {
        let set = merge(&[0, 2, 3, 4, 7]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[0,[2,4],7]");

        let parsed: RangeSet = serde_json::from_str("[[0,1],5,[8,9]]").unwrap();
        assert_eq!(parsed, merge(&[0, 1, 5, 8, 9]));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(merge(&[0, 1, 5]).to_string(), "0-1,5");
    }

    proptest! {
        #[test]
        fn merge_expand_roundtrip(mut indices in prop::collection::vec(0u64..5_000, 0..300)) {
            indices.sort_unstable();
            indices.dedup();
            let set = merge(&indices);
            prop_assert!(set.is_canonical());
            prop_assert_eq!(expand(&set), indices.clone());
            prop_assert_eq!(set.len(), indices.len() as u64);
        }

        #[test]
        fn double_complement_is_identity(
            mut indices in prop::collection::vec(0u64..2_000, 0..200),
            extra in 0u64..100,
        ) {
            indices.sort_unstable();
            indices.dedup();
            let total = indices.last().map_or(0, |l| l + 1) + extra;
            let set = merge(&indices);
            prop_assert_eq!(complement(total, &complement(total, &set)), set);
        }

        #[test]
        fn complement_partitions_universe(
            indices in prop::collection::vec(0u64..500, 0..100),
            total in 0u64..600,
        ) {
            let set: RangeSet = indices.into_iter().collect();
            let missing = complement(total, &set);
            for i in 0..total {
                prop_assert_ne!(set.contains(i), missing.contains(i));
            }
            prop_assert!(missing.last_index().is_none_or(|l| l < total));
        }
    }
}
