//! Program toolkit contract.
//!
//! Generation and mutation over the full typed-argument model live in the
//! external program database; the fuzzer only depends on this trait. The
//! bundled [`TableBuilder`] is a minimal table-driven implementation that
//! keeps the binaries runnable standalone.

use crate::prog::{Call, Prog, Syscall, SyscallId};
use crate::RngType;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

pub trait ProgBuilder: Send + Sync {
    /// Fresh program of at most `max_len` calls.
    fn generate(&self, rng: &mut RngType, max_len: usize) -> Prog;

    /// In-place mutation of `p`, possibly splicing from `corpus`.
    fn mutate(&self, rng: &mut RngType, p: &mut Prog, corpus: &[Prog], max_len: usize);

    /// Programs that must never be executed (e.g. calls that disrupt the
    /// testing setup itself).
    fn blacklisted(&self, _p: &Prog) -> bool {
        false
    }

    /// Clone of `p` with every user/uid token rewritten to the canonical
    /// single user. Implementations without argument access return the
    /// program unchanged.
    fn single_user_variant(&self, p: &Prog) -> Prog {
        p.clone()
    }
}

/// Table-driven builder: uniform random picks from a fixed syscall table
/// and call-level mutations (insert, remove, splice from corpus).
pub struct TableBuilder {
    table: Vec<Arc<Syscall>>,
}

impl TableBuilder {
    pub fn new(table: Vec<(SyscallId, &str)>) -> Self {
        assert!(!table.is_empty(), "syscall table must not be empty");
        Self {
            table: table
                .into_iter()
                .map(|(id, name)| Arc::new(Syscall::new(id, name)))
                .collect(),
        }
    }

    /// Common filesystem-facing syscalls of linux/amd64.
    pub fn with_default_table() -> Self {
        Self::new(vec![
            (0, "read"),
            (1, "write"),
            (2, "open"),
            (3, "close"),
            (4, "stat"),
            (5, "fstat"),
            (6, "lstat"),
            (8, "lseek"),
            (17, "pread64"),
            (18, "pwrite64"),
            (40, "sendfile"),
            (76, "truncate"),
            (77, "ftruncate"),
            (82, "rename"),
            (83, "mkdir"),
            (84, "rmdir"),
            (85, "creat"),
            (86, "link"),
            (87, "unlink"),
            (88, "symlink"),
            (90, "chmod"),
            (92, "chown"),
            (133, "mknod"),
            (188, "setxattr"),
            (191, "getxattr"),
            (197, "removexattr"),
            (257, "openat"),
            (280, "utimensat"),
            (285, "fallocate"),
        ])
    }

    /// Loads a `<id> <name>` table, one syscall per line.
    pub fn from_table_text(text: &str) -> Option<Self> {
        let mut table = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (id, name) = line.split_once(' ')?;
            table.push((id.parse::<SyscallId>().ok()?, name.trim()));
        }
        if table.is_empty() {
            return None;
        }
        Some(Self::new(table))
    }

    fn random_call(&self, rng: &mut RngType) -> Call {
        Call::new(Arc::clone(self.table.choose(rng).unwrap()))
    }
}

impl ProgBuilder for TableBuilder {
    fn generate(&self, rng: &mut RngType, max_len: usize) -> Prog {
        let len = rng.gen_range(1..=max_len.max(1));
        let calls = (0..len).map(|_| self.random_call(rng)).collect();
        Prog::new(calls)
    }

    fn mutate(&self, rng: &mut RngType, p: &mut Prog, corpus: &[Prog], max_len: usize) {
        for _ in 0..rng.gen_range(1..=3usize) {
            match rng.gen_range(0..3u8) {
                0 if p.len() < max_len => {
                    let idx = rng.gen_range(0..=p.len());
                    p.insert_call(idx, self.random_call(rng));
                }
                1 if p.len() > 1 => {
                    let idx = rng.gen_range(0..p.len());
                    p.remove_call(idx);
                }
                _ => {
                    // splice a call from another corpus program
                    if let Some(other) = corpus.choose(rng) {
                        if let Some(call) = other.calls().choose(rng) {
                            if p.len() < max_len {
                                let idx = rng.gen_range(0..=p.len());
                                p.insert_call(idx, call.clone());
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn generate_respects_length_bound() {
        let b = TableBuilder::with_default_table();
        let mut rng = RngType::seed_from_u64(7);
        for _ in 0..100 {
            let p = b.generate(&mut rng, 30);
            assert!(!p.is_empty());
            assert!(p.len() <= 30);
        }
    }

    #[test]
    fn mutate_keeps_program_nonempty() {
        let b = TableBuilder::with_default_table();
        let mut rng = RngType::seed_from_u64(11);
        let corpus = vec![b.generate(&mut rng, 10)];
        let mut p = b.generate(&mut rng, 10);
        for _ in 0..100 {
            b.mutate(&mut rng, &mut p, &corpus, 30);
            assert!(!p.is_empty());
            assert!(p.len() <= 30);
        }
    }

    #[test]
    fn table_text_round_trip() {
        let b = TableBuilder::from_table_text("2 open\n3 close\n# comment\n").unwrap();
        let mut rng = RngType::seed_from_u64(3);
        let p = b.generate(&mut rng, 5);
        for c in p.calls() {
            assert!(matches!(c.meta().name(), "open" | "close"));
        }
        assert!(TableBuilder::from_table_text("").is_none());
    }

    #[test]
    fn single_user_variant_defaults_to_identity() {
        let b = TableBuilder::with_default_table();
        let mut rng = RngType::seed_from_u64(5);
        let p = b.generate(&mut rng, 5);
        assert_eq!(b.single_user_variant(&p), p);
    }
}
