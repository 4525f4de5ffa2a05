//! Counting multiset.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A multiset that counts how many times each element was added.
///
/// The mode is tracked incrementally: the first element to reach the
/// highest count keeps the title until another strictly exceeds it.
///
/// ```
/// use savannah_utils::Bag;
///
/// let mut bag = Bag::new();
/// bag.add_count("x", 2);
/// bag.add("y");
/// assert_eq!(bag.count(&"x"), 2);
/// assert_eq!(bag.len(), 3);
/// assert_eq!(bag.mode(), Some((&"x", 2)));
/// ```
#[derive(Clone)]
pub struct Bag<T: Eq + Hash + Clone> {
    counts: HashMap<T, usize>,
    order: Vec<T>,
    size: usize,
    mode: Option<T>,
    mode_freq: usize,
    threshold: usize,
    met_threshold: HashSet<T>,
}

impl<T: Eq + Hash + Clone> Default for Bag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> Bag<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            order: Vec::new(),
            size: 0,
            mode: None,
            mode_freq: 0,
            threshold: 0,
            met_threshold: HashSet::new(),
        }
    }

    pub fn of<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut bag = Self::new();
        for item in iter {
            bag.add(item);
        }
        bag
    }

    pub fn add(&mut self, item: T) {
        self.add_count(item, 1);
    }

    /// Adds `count` copies of `item`; zero is a no-op.
    pub fn add_count(&mut self, item: T, count: usize) {
        if count == 0 {
            return;
        }
        let total = match self.counts.get_mut(&item) {
            Some(total) => {
                *total += count;
                *total
            }
            None => {
                self.order.push(item.clone());
                self.counts.insert(item.clone(), count);
                count
            }
        };
        self.size += count;
        if total > self.mode_freq {
            self.mode = Some(item.clone());
            self.mode_freq = total;
        }
        if self.threshold > 0 && total >= self.threshold {
            self.met_threshold.insert(item);
        }
    }

    #[must_use]
    pub fn count(&self, item: &T) -> usize {
        self.counts.get(item).copied().unwrap_or(0)
    }

    /// Total number of elements, counting duplicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Distinct elements in first-insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.order.clone()
    }

    /// Distinct elements with their counts, in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&T, usize)> {
        self.order.iter().map(|item| (item, self.count(item)))
    }

    #[must_use]
    pub fn mode(&self) -> Option<(&T, usize)> {
        self.mode.as_ref().map(|m| (m, self.mode_freq))
    }

    /// Tracks which elements have been added at least `threshold` times.
    pub fn set_threshold(&mut self, threshold: usize) {
        if self.threshold == threshold {
            return;
        }
        self.threshold = threshold;
        self.met_threshold = self
            .counts
            .iter()
            .filter(|(_, &c)| threshold > 0 && c >= threshold)
            .map(|(item, _)| item.clone())
            .collect();
    }

    #[must_use]
    pub fn threshold(&self) -> &HashSet<T> {
        &self.met_threshold
    }

    /// Keeps only the elements accepted by `keep`.
    #[must_use]
    pub fn filter<F: Fn(&T) -> bool>(&self, keep: F) -> Self {
        let mut out = Self::new();
        for (item, count) in self.iter() {
            if keep(item) {
                out.add_count(item.clone(), count);
            }
        }
        out
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> fmt::Debug for Bag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<T: Eq + Hash + Clone + fmt::Display> fmt::Display for Bag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bag[size={}]", self.size)?;
        for (item, count) in self.iter() {
            write!(f, " {item}:{count}")?;
        }
        Ok(())
    }
}

impl<T: Eq + Hash + Clone> PartialEq for Bag<T> {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.counts == other.counts
    }
}

impl<T: Eq + Hash + Clone> Eq for Bag<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_order() {
        let mut bag = Bag::new();
        bag.add(3);
        bag.add(1);
        bag.add(3);
        assert_eq!(bag.count(&3), 2);
        assert_eq!(bag.count(&9), 0);
        assert_eq!(bag.list(), vec![3, 1]);
        assert_eq!(bag.len(), 3);
    }

    #[test]
    fn test_mode_keeps_first_leader_on_tie() {
        let mut bag = Bag::new();
        bag.add("a");
        bag.add("b");
        assert_eq!(bag.mode(), Some((&"a", 1)));
        bag.add("b");
        assert_eq!(bag.mode(), Some((&"b", 2)));
        bag.add("a");
        assert_eq!(bag.mode(), Some((&"b", 2)));
    }

    #[test]
    fn test_threshold() {
        let mut bag = Bag::of([1, 1, 2]);
        bag.set_threshold(2);
        assert!(bag.threshold().contains(&1));
        assert!(!bag.threshold().contains(&2));
        bag.add(2);
        assert!(bag.threshold().contains(&2));
    }

    #[test]
    fn test_filter_and_eq() {
        let bag = Bag::of([1, 2, 2, 3]);
        let evens = bag.filter(|x| x % 2 == 0);
        assert_eq!(evens, Bag::of([2, 2]));
        assert_ne!(evens, bag);
    }

    #[test]
    fn test_zero_count_is_noop() {
        let mut bag = Bag::new();
        bag.add_count(5, 0);
        assert!(bag.is_empty());
        assert!(bag.mode().is_none());
    }
}
