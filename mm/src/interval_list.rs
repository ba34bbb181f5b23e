//! Sorted list of closed `[from, to]` ranges.
//!
//! Ranges are kept in ascending order and never merged: two adjacent
//! entries stay two entries even when they touch. Lookups are linear; a
//! process owns a handful of regions, so a flat vector is cheaper than a
//! tree here.

use alloc::vec::Vec;
use core::ops::RangeInclusive;

/// Anything with closed bounds that can live in an [`IntervalList`].
pub trait Interval {
    fn from(&self) -> u64;
    fn to(&self) -> u64;

    #[inline]
    fn contains_addr(&self, addr: u64) -> bool {
        self.from() <= addr && addr <= self.to()
    }

    #[inline]
    fn size(&self) -> u64 {
        self.to() - self.from() + 1
    }
}

impl Interval for RangeInclusive<u64> {
    fn from(&self) -> u64 {
        *self.start()
    }

    fn to(&self) -> u64 {
        *self.end()
    }
}

#[derive(Clone, Debug)]
pub struct IntervalList<T> {
    items: Vec<T>,
    max: u64,
}

impl<T: Interval> IntervalList<T> {
    /// Empty list whose free space ends at `max` (inclusive).
    pub const fn new(max: u64) -> Self {
        Self {
            items: Vec::new(),
            max,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    /// Insert before the first entry that does not end below `interval`.
    pub fn add(&mut self, interval: T) {
        let at = self
            .items
            .iter()
            .position(|other| other.to() >= interval.from())
            .unwrap_or(self.items.len());
        self.items.insert(at, interval);
    }

    /// Entry containing `addr`, if any.
    pub fn contains(&self, addr: u64) -> Option<&T> {
        self.position_of(addr).map(|i| &self.items[i])
    }

    pub fn contains_mut(&mut self, addr: u64) -> Option<&mut T> {
        self.position_of(addr).map(move |i| &mut self.items[i])
    }

    fn position_of(&self, addr: u64) -> Option<usize> {
        for (i, item) in self.items.iter().enumerate() {
            if item.from() > addr {
                return None;
            }
            if item.contains_addr(addr) {
                return Some(i);
            }
        }
        None
    }

    /// True when `[from, to]` intersects any entry.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        self.items
            .iter()
            .take_while(|item| item.from() <= to)
            .any(|item| item.to() >= from)
    }

    /// First gap of `size` bytes, as a closed range.
    ///
    /// With a single entry the space below it is tried first. With two or
    /// more, only the gaps between neighbours and the space after the last
    /// entry are considered.
    pub fn find_free(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let after = |last: &T| {
            (self.max - last.to() >= size).then(|| (last.to() + 1, last.to() + size))
        };
        match self.items.as_slice() {
            [] => Some((0, size - 1)),
            [only] => {
                if only.from() >= size {
                    Some((0, size - 1))
                } else {
                    after(only)
                }
            }
            [.., last] => self
                .items
                .windows(2)
                .find_map(|pair| {
                    let end = pair[0].to().checked_add(size)?;
                    (pair[1].from() > end).then(|| (pair[0].to() + 1, end))
                })
                .or_else(|| after(last)),
        }
    }

    /// Find a gap of `size` bytes and claim it with the entry `make` builds
    /// from the gap's bounds.
    pub fn reserve(&mut self, size: u64, make: impl FnOnce(u64, u64) -> T) -> Option<&T> {
        let (from, to) = self.find_free(size)?;
        self.add(make(from, to));
        self.contains(from)
    }

    /// Remove the entry with exactly these bounds.
    pub fn del(&mut self, from: u64, to: u64) -> Option<T> {
        let at = self
            .items
            .iter()
            .position(|item| item.from() == from && item.to() == to)?;
        Some(self.items.remove(at))
    }

    /// Remove every entry matching `pred`, returning them in order.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ranges: &[(u64, u64)]) -> IntervalList<RangeInclusive<u64>> {
        let mut l = IntervalList::new(0xFFFF);
        for &(f, t) in ranges {
            l.add(f..=t);
        }
        l
    }

    #[test]
    fn add_keeps_order() {
        let l = list(&[(0x300, 0x3FF), (0x100, 0x1FF), (0x200, 0x2FF)]);
        let froms: Vec<u64> = l.iter().map(|r| r.from()).collect();
        assert_eq!(froms, [0x100, 0x200, 0x300]);
    }

    #[test]
    fn adjacent_entries_are_not_merged() {
        let l = list(&[(0x100, 0x1FF), (0x200, 0x2FF)]);
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn contains_finds_owner() {
        let l = list(&[(0x100, 0x1FF), (0x400, 0x4FF)]);
        assert_eq!(l.contains(0x1FF), Some(&(0x100..=0x1FF)));
        assert_eq!(l.contains(0x200), None);
        assert_eq!(l.contains(0x450), Some(&(0x400..=0x4FF)));
        assert_eq!(l.contains(0x50), None);
    }

    #[test]
    fn find_free_zero_size() {
        assert_eq!(list(&[]).find_free(0), None);
    }

    #[test]
    fn find_free_empty_list_starts_at_zero() {
        assert_eq!(list(&[]).find_free(0x10), Some((0, 0xF)));
    }

    #[test]
    fn find_free_single_prefers_gap_before() {
        assert_eq!(list(&[(0x100, 0x1FF)]).find_free(0x100), Some((0, 0xFF)));
        assert_eq!(
            list(&[(0x80, 0x1FF)]).find_free(0x100),
            Some((0x200, 0x2FF))
        );
        assert_eq!(list(&[(0x80, 0xFFF0)]).find_free(0x100), None);
    }

    #[test]
    fn find_free_between_pairs_then_after_last() {
        let l = list(&[(0x0, 0xFF), (0x180, 0x1FF), (0x400, 0x4FF)]);
        // Gap [0x100, 0x17F] is too small for 0x100 bytes.
        assert_eq!(l.find_free(0x100), Some((0x200, 0x2FF)));
        assert_eq!(l.find_free(0x80), Some((0x100, 0x17F)));
        assert_eq!(l.find_free(0x300), Some((0x500, 0x7FF)));
        assert_eq!(l.find_free(0x10000), None);
    }

    #[test]
    fn find_free_ignores_space_before_first_of_many() {
        let l = list(&[(0x1000, 0x1FFF), (0x2000, 0x2FFF)]);
        assert_eq!(l.find_free(0x100), Some((0x3000, 0x30FF)));
    }

    #[test]
    fn reserve_claims_gap() {
        let mut l = list(&[(0x0, 0xFF), (0x8000, 0xFFFF)]);
        let got = l.reserve(0x200, |f, t| f..=t).cloned();
        assert_eq!(got, Some(0x100..=0x2FF));
        assert_eq!(l.find_free(0x200), Some((0x300, 0x4FF)));
        assert!(l.overlaps(0x2FF, 0x300));
        assert!(!l.overlaps(0x300, 0x7FFF));
    }

    #[test]
    fn del_requires_exact_bounds() {
        let mut l = list(&[(0x100, 0x1FF)]);
        assert_eq!(l.del(0x100, 0x1FE), None);
        assert_eq!(l.del(0x100, 0x1FF), Some(0x100..=0x1FF));
        assert!(l.is_empty());
    }
}
