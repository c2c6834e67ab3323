//! Coverage feedback maps.
//!
//! One reader/writer lock protects all three signal sets, so a writer
//! updates `max` and `new` atomically with respect to other writers and
//! the invariant `corpus ⊆ max` always holds.

use fsdiff_core::HashSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct Feedback {
    inner: RwLock<Signals>,
}

#[derive(Debug, Default)]
struct Signals {
    corpus: HashSet<u32>,
    max: HashSet<u32>,
    new: HashSet<u32>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal values not yet in the max set.
    pub fn diff_max(&self, signal: &[u32]) -> Vec<u32> {
        let inner = self.inner.read().unwrap();
        signal
            .iter()
            .copied()
            .filter(|s| !inner.max.contains(s))
            .collect()
    }

    /// Signal values not yet covered by the corpus.
    pub fn diff_corpus(&self, signal: &[u32]) -> HashSet<u32> {
        let inner = self.inner.read().unwrap();
        signal
            .iter()
            .copied()
            .filter(|s| !inner.corpus.contains(s))
            .collect()
    }

    /// Commits newly discovered signal to both `max` and `new`.
    pub fn add_max_new(&self, signal: &[u32]) {
        let mut inner = self.inner.write().unwrap();
        inner.max.extend(signal.iter().copied());
        inner.new.extend(signal.iter().copied());
    }

    /// Records stabilized input signal as corpus coverage.
    pub fn add_corpus(&self, signal: &[u32]) {
        let mut inner = self.inner.write().unwrap();
        inner.corpus.extend(signal.iter().copied());
        inner.max.extend(signal.iter().copied());
    }

    /// Merges manager-provided max signal without marking it new.
    pub fn merge_max(&self, signal: &[u32]) {
        let mut inner = self.inner.write().unwrap();
        inner.max.extend(signal.iter().copied());
    }

    /// Takes the accumulated new signal for the next manager poll.
    pub fn take_new(&self) -> Vec<u32> {
        let mut inner = self.inner.write().unwrap();
        inner.new.drain().collect()
    }

    pub fn max_len(&self) -> usize {
        self.inner.read().unwrap().max.len()
    }

    pub fn corpus_len(&self) -> usize {
        self.inner.read().unwrap().corpus.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_then_add() {
        let fb = Feedback::new();
        assert_eq!(fb.diff_max(&[1, 2, 3]).len(), 3);
        fb.add_max_new(&[1, 2]);
        assert_eq!(fb.diff_max(&[1, 2, 3]), vec![3]);
        assert_eq!(fb.take_new().len(), 2);
        assert!(fb.take_new().is_empty());
    }

    #[test]
    fn corpus_subset_of_max() {
        let fb = Feedback::new();
        fb.add_corpus(&[5, 6]);
        assert!(fb.diff_max(&[5, 6]).is_empty());
        assert!(fb.diff_corpus(&[5, 6]).is_empty());
        assert_eq!(fb.corpus_len(), 2);
        assert_eq!(fb.max_len(), 2);
    }

    #[test]
    fn merge_max_is_not_new() {
        let fb = Feedback::new();
        fb.merge_max(&[9]);
        assert!(fb.diff_max(&[9]).is_empty());
        assert!(fb.take_new().is_empty());
    }
}
