use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use crate::sequence::sequence_number::SequenceNumber;

/// An inclusive range of sequence numbers, `lower <= upper`, both assignable.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SequenceRange {
    lower: SequenceNumber,
    upper: SequenceNumber,
}

impl Debug for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.lower, self.upper)
    }
}

impl SequenceRange {
    pub fn new(lower: SequenceNumber, upper: SequenceNumber) -> Option<SequenceRange> {
        if lower > upper || !lower.is_assignable() || !upper.is_assignable() {
            return None;
        }
        Some(SequenceRange { lower, upper })
    }

    pub fn single(number: SequenceNumber) -> Option<SequenceRange> {
        Self::new(number, number)
    }

    pub fn from_raw(lower: u64, upper: u64) -> Option<SequenceRange> {
        Self::new(SequenceNumber::from_raw(lower), SequenceNumber::from_raw(upper))
    }

    pub fn lower(&self) -> SequenceNumber {
        self.lower
    }

    pub fn upper(&self) -> SequenceNumber {
        self.upper
    }

    pub fn contains(&self, number: SequenceNumber) -> bool {
        self.lower <= number && number <= self.upper
    }

    pub fn contains_range(&self, other: &SequenceRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    /// number of sequence numbers in the range
    pub fn len(&self) -> u64 {
        self.upper.to_raw() - self.lower.to_raw() + 1
    }
}

/// Reasons why a list of ranges received from a peer can not be interpreted as a range set.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MalformedRanges {
    Unordered,
    Overlapping,
}

/// An immutable, ordered set of disjoint ranges representing the sequence numbers seen so far.
///  Adjacent ranges are always merged, so no two ranges in the set are contiguous.
///
/// 'Modifications' return a new set, sharing nothing mutable with the original. This allows
///  acknowledgments and reply records to hold on to a snapshot of the ranges.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct SequenceRangeSet {
    ranges: Arc<[SequenceRange]>,
}

impl Debug for SequenceRangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{:?}", r)?;
        }
        write!(f, "}}")
    }
}

impl Default for SequenceRangeSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl SequenceRangeSet {
    pub fn empty() -> SequenceRangeSet {
        SequenceRangeSet {
            ranges: Arc::from(Vec::new()),
        }
    }

    /// normalizes an arbitrary collection of ranges: sorting, merging overlapping and
    ///  adjacent ranges
    pub fn from_ranges(ranges: impl IntoIterator<Item = SequenceRange>) -> SequenceRangeSet {
        let mut sorted = ranges.into_iter().collect::<Vec<_>>();
        sorted.sort_by_key(|r| r.lower);

        let mut result: Vec<SequenceRange> = Vec::with_capacity(sorted.len());
        for r in sorted {
            match result.last_mut() {
                Some(prev) if prev.upper.to_raw().saturating_add(1) >= r.lower.to_raw() => {
                    if r.upper > prev.upper {
                        prev.upper = r.upper;
                    }
                }
                _ => result.push(r),
            }
        }

        SequenceRangeSet {
            ranges: Arc::from(result),
        }
    }

    /// Interprets ranges as received in an acknowledgment. Unlike [SequenceRangeSet::from_ranges],
    ///  this is strict: the ranges must be in ascending order and may not overlap. Adjacent ranges
    ///  are legal on the wire and are merged.
    pub fn try_from_received(ranges: &[SequenceRange]) -> Result<SequenceRangeSet, MalformedRanges> {
        for pair in ranges.windows(2) {
            if pair[1].lower <= pair[0].upper {
                if pair[1].lower < pair[0].lower {
                    return Err(MalformedRanges::Unordered);
                }
                return Err(MalformedRanges::Overlapping);
            }
        }
        Ok(Self::from_ranges(ranges.iter().cloned()))
    }

    #[cfg(test)]
    pub fn from_raw(ranges: &[(u64, u64)]) -> SequenceRangeSet {
        Self::from_ranges(ranges.iter()
            .map(|&(l, u)| SequenceRange::from_raw(l, u).expect("test ranges should be valid")))
    }

    pub fn ranges(&self) -> &[SequenceRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// total number of sequence numbers in the set
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn highest(&self) -> Option<SequenceNumber> {
        self.ranges.last().map(|r| r.upper)
    }

    pub fn contains(&self, number: SequenceNumber) -> bool {
        // binary search for the last range starting at or below the number
        let idx = self.ranges.partition_point(|r| r.lower <= number);
        idx > 0 && self.ranges[idx - 1].contains(number)
    }

    /// true iff every number in `other` is also in `self`
    pub fn contains_all(&self, other: &SequenceRangeSet) -> bool {
        other.ranges.iter().all(|o| {
            let idx = self.ranges.partition_point(|r| r.lower <= o.lower);
            idx > 0 && self.ranges[idx - 1].contains_range(o)
        })
    }

    /// If the set starts with 1, this is the upper bound of the range starting there, i.e. the
    ///  highest number up to which everything is contained
    pub fn contiguous_prefix_end(&self) -> Option<SequenceNumber> {
        match self.ranges.first() {
            Some(r) if r.lower == SequenceNumber::FIRST => Some(r.upper),
            _ => None,
        }
    }

    /// true iff the set is exactly `[1, last]`
    pub fn is_complete_up_to(&self, last: SequenceNumber) -> bool {
        self.ranges.len() == 1 && self.contiguous_prefix_end() == Some(last)
    }

    pub fn merged_with(&self, number: SequenceNumber) -> SequenceRangeSet {
        let Some(single) = SequenceRange::single(number) else {
            return self.clone();
        };
        if self.contains(number) {
            return self.clone();
        }

        let idx = self.ranges.partition_point(|r| r.lower <= number);
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        result.extend_from_slice(&self.ranges[..idx]);

        let joins_previous = result.last()
            .map(|prev: &SequenceRange| prev.upper.to_raw() + 1 == number.to_raw())
            .unwrap_or(false);
        let joins_next = self.ranges.get(idx)
            .map(|next| number.to_raw() + 1 == next.lower.to_raw())
            .unwrap_or(false);

        match (joins_previous, joins_next) {
            (true, true) => {
                let next_upper = self.ranges[idx].upper;
                if let Some(prev) = result.last_mut() {
                    prev.upper = next_upper;
                }
                result.extend_from_slice(&self.ranges[idx + 1..]);
            }
            (true, false) => {
                if let Some(prev) = result.last_mut() {
                    prev.upper = number;
                }
                result.extend_from_slice(&self.ranges[idx..]);
            }
            (false, true) => {
                let next = self.ranges[idx];
                result.push(SequenceRange { lower: number, upper: next.upper });
                result.extend_from_slice(&self.ranges[idx + 1..]);
            }
            (false, false) => {
                result.push(single);
                result.extend_from_slice(&self.ranges[idx..]);
            }
        }

        SequenceRangeSet {
            ranges: Arc::from(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn raw(set: &SequenceRangeSet) -> Vec<(u64, u64)> {
        set.ranges().iter()
            .map(|r| (r.lower().to_raw(), r.upper().to_raw()))
            .collect()
    }

    #[rstest]
    #[case::regular(1, 5, true)]
    #[case::single(3, 3, true)]
    #[case::inverted(5, 1, false)]
    #[case::zero(0, 5, false)]
    #[case::rollover(1, i64::MAX as u64, false)]
    fn test_range_new(#[case] lower: u64, #[case] upper: u64, #[case] expected_valid: bool) {
        assert_eq!(SequenceRange::from_raw(lower, upper).is_some(), expected_valid);
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![(1,1)], vec![(1,1)])]
    #[case::sorted(vec![(1,2), (4,5)], vec![(1,2), (4,5)])]
    #[case::unsorted(vec![(4,5), (1,2)], vec![(1,2), (4,5)])]
    #[case::adjacent(vec![(1,2), (3,5)], vec![(1,5)])]
    #[case::overlapping(vec![(1,4), (3,5)], vec![(1,5)])]
    #[case::contained(vec![(1,9), (3,5)], vec![(1,9)])]
    #[case::many(vec![(7,7), (1,1), (2,3), (9,12), (10,11)], vec![(1,3), (7,7), (9,12)])]
    fn test_from_ranges(#[case] input: Vec<(u64, u64)>, #[case] expected: Vec<(u64, u64)>) {
        let set = SequenceRangeSet::from_raw(&input);
        assert_eq!(raw(&set), expected);
    }

    #[rstest]
    #[case::empty(vec![], Ok(vec![]))]
    #[case::regular(vec![(1,2), (5,6)], Ok(vec![(1,2), (5,6)]))]
    #[case::adjacent(vec![(1,2), (3,6)], Ok(vec![(1,6)]))]
    #[case::overlapping(vec![(1,3), (3,6)], Err(MalformedRanges::Overlapping))]
    #[case::unordered(vec![(5,6), (1,2)], Err(MalformedRanges::Unordered))]
    fn test_try_from_received(#[case] input: Vec<(u64, u64)>, #[case] expected: Result<Vec<(u64, u64)>, MalformedRanges>) {
        let ranges = input.iter()
            .map(|&(l, u)| SequenceRange::from_raw(l, u).unwrap())
            .collect::<Vec<_>>();
        let actual = SequenceRangeSet::try_from_received(&ranges)
            .map(|s| raw(&s));
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::into_empty(vec![], 3, vec![(3,3)])]
    #[case::duplicate(vec![(1,5)], 3, vec![(1,5)])]
    #[case::append_adjacent(vec![(1,5)], 6, vec![(1,6)])]
    #[case::append_gap(vec![(1,5)], 7, vec![(1,5), (7,7)])]
    #[case::prepend_adjacent(vec![(2,5)], 1, vec![(1,5)])]
    #[case::prepend_gap(vec![(3,5)], 1, vec![(1,1), (3,5)])]
    #[case::fill_gap(vec![(1,2), (4,5)], 3, vec![(1,5)])]
    #[case::join_previous(vec![(1,2), (5,6)], 3, vec![(1,3), (5,6)])]
    #[case::join_next(vec![(1,2), (5,6)], 4, vec![(1,2), (4,6)])]
    #[case::middle_isolated(vec![(1,2), (8,9)], 5, vec![(1,2), (5,5), (8,9)])]
    #[case::zero_ignored(vec![(1,2)], 0, vec![(1,2)])]
    fn test_merged_with(#[case] initial: Vec<(u64, u64)>, #[case] number: u64, #[case] expected: Vec<(u64, u64)>) {
        let set = SequenceRangeSet::from_raw(&initial);
        let merged = set.merged_with(SequenceNumber::from_raw(number));
        assert_eq!(raw(&merged), expected);
        // the original is unchanged
        assert_eq!(raw(&set), initial);
    }

    #[rstest]
    #[case::empty(vec![], 1, false)]
    #[case::below(vec![(3,5)], 2, false)]
    #[case::lower(vec![(3,5)], 3, true)]
    #[case::inner(vec![(3,5)], 4, true)]
    #[case::upper(vec![(3,5)], 5, true)]
    #[case::above(vec![(3,5)], 6, false)]
    #[case::gap(vec![(1,2), (5,6)], 3, false)]
    #[case::second(vec![(1,2), (5,6)], 6, true)]
    fn test_contains(#[case] ranges: Vec<(u64, u64)>, #[case] number: u64, #[case] expected: bool) {
        assert_eq!(SequenceRangeSet::from_raw(&ranges).contains(SequenceNumber::from_raw(number)), expected);
    }

    #[rstest]
    #[case::both_empty(vec![], vec![], true)]
    #[case::other_empty(vec![(1,3)], vec![], true)]
    #[case::self_empty(vec![], vec![(1,1)], false)]
    #[case::equal(vec![(1,3), (5,6)], vec![(1,3), (5,6)], true)]
    #[case::superset(vec![(1,9)], vec![(1,3), (5,6)], true)]
    #[case::missing_part(vec![(1,3), (5,6)], vec![(1,4)], false)]
    #[case::spanning_gap(vec![(1,3), (5,6)], vec![(2,6)], false)]
    fn test_contains_all(#[case] set: Vec<(u64, u64)>, #[case] other: Vec<(u64, u64)>, #[case] expected: bool) {
        let set = SequenceRangeSet::from_raw(&set);
        let other = SequenceRangeSet::from_raw(&other);
        assert_eq!(set.contains_all(&other), expected);
    }

    #[rstest]
    #[case::empty(vec![], None, 3, false)]
    #[case::not_from_one(vec![(2,3)], None, 3, false)]
    #[case::prefix(vec![(1,3)], Some(3), 3, true)]
    #[case::prefix_too_short(vec![(1,2)], Some(2), 3, false)]
    #[case::with_gap(vec![(1,2), (4,4)], Some(2), 4, false)]
    fn test_prefix_and_completeness(#[case] ranges: Vec<(u64, u64)>, #[case] expected_prefix_end: Option<u64>, #[case] last: u64, #[case] expected_complete: bool) {
        let set = SequenceRangeSet::from_raw(&ranges);
        assert_eq!(set.contiguous_prefix_end(), expected_prefix_end.map(SequenceNumber::from_raw));
        assert_eq!(set.is_complete_up_to(SequenceNumber::from_raw(last)), expected_complete);
    }

    /// merging arbitrary (reordered, duplicated) numbers never produces overlapping or adjacent
    ///  ranges, and the set contains exactly the merged numbers
    #[test]
    fn test_merge_permutations_stay_normalized() {
        let orders: Vec<Vec<u64>> = vec![
            vec![5, 1, 3, 2, 4],
            vec![2, 2, 9, 1, 9, 7, 8, 3],
            vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1],
            vec![1, 3, 5, 7, 9, 2, 6, 4, 8],
        ];

        for order in orders {
            let mut set = SequenceRangeSet::empty();
            let mut seen = std::collections::BTreeSet::new();
            for n in order {
                set = set.merged_with(SequenceNumber::from_raw(n));
                seen.insert(n);

                for pair in set.ranges().windows(2) {
                    assert!(pair[0].upper().to_raw() + 1 < pair[1].lower().to_raw(), "ranges not normalized: {:?}", set);
                }
                for candidate in 1..=12 {
                    assert_eq!(set.contains(SequenceNumber::from_raw(candidate)), seen.contains(&candidate));
                }
            }
            assert_eq!(set.count(), seen.len() as u64);
        }
    }
}
