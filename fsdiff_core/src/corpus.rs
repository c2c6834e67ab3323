//! Shared corpus of interesting programs, deduplicated by content hash.

use crate::hash::Sig;
use crate::prog::Prog;
use crate::{HashSet, RngType};
use rand::Rng;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct CorpusWrapper {
    inner: RwLock<Corpus>,
}

impl CorpusWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.progs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `p` unless a program with the same content hash is already
    /// present. Returns whether the program was added.
    pub fn add_prog(&self, p: Prog) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !inner.hashes.insert(p.sig()) {
            return false;
        }
        inner.progs.push(p);
        true
    }

    pub fn select_one(&self, rng: &mut RngType) -> Option<Prog> {
        let inner = self.inner.read().unwrap();
        if inner.progs.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..inner.progs.len());
        Some(inner.progs[idx].clone())
    }

    /// Runs `f` over the current programs under the read lock.
    pub fn with_progs<R>(&self, f: impl FnOnce(&[Prog]) -> R) -> R {
        let inner = self.inner.read().unwrap();
        f(&inner.progs)
    }
}

#[derive(Debug, Default)]
struct Corpus {
    progs: Vec<Prog>,
    hashes: HashSet<Sig>,
}
