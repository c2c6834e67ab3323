//! Opaque program entity.
//!
//! A program is an ordered list of syscall invocations. Argument values,
//! their generation and their wire encoding live in the external program
//! database; this crate only carries the stable per-call metadata handle
//! (name and numeric id) that the supervisor needs for output validation,
//! reporting and diffing.

use crate::hash::Sig;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type SyscallId = u64;

/// Stable metadata handle of one syscall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Syscall {
    id: SyscallId,
    name: String,
}

impl Syscall {
    pub fn new(id: SyscallId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    #[inline]
    pub fn id(&self) -> SyscallId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    meta: Arc<Syscall>,
}

impl Call {
    pub fn new(meta: Arc<Syscall>) -> Self {
        Self { meta }
    }

    #[inline]
    pub fn meta(&self) -> &Syscall {
        &self.meta
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prog {
    calls: Vec<Call>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {0}: expected '<id> <name>'")]
    BadLine(usize),
    #[error("line {0}: bad syscall id: {1}")]
    BadId(usize, String),
    #[error("program is empty")]
    Empty,
}

impl Prog {
    pub fn new(calls: Vec<Call>) -> Self {
        Self { calls }
    }

    #[inline]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn remove_call(&mut self, idx: usize) {
        self.calls.remove(idx);
    }

    pub fn insert_call(&mut self, idx: usize, call: Call) {
        self.calls.insert(idx, call);
    }

    /// Textual form, one call per line: `<id> <name>`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for c in &self.calls {
            out.push_str(&format!("{} {}\n", c.meta().id(), c.meta().name()));
        }
        out.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Prog, ParseError> {
        let text = String::from_utf8_lossy(data);
        let mut calls = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (id, name) = line.split_once(' ').ok_or(ParseError::BadLine(i + 1))?;
            let id = id
                .parse::<SyscallId>()
                .map_err(|_| ParseError::BadId(i + 1, id.to_string()))?;
            calls.push(Call::new(Arc::new(Syscall::new(id, name.trim()))));
        }
        if calls.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(Prog::new(calls))
    }

    /// Content signature over the textual form, used for corpus dedup.
    pub fn sig(&self) -> Sig {
        Sig::hash(&self.serialize())
    }
}

/// One-liner used in logs and reports, e.g. `mkdir-open-write`.
impl fmt::Display for Prog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.calls {
            if !first {
                write!(f, "-")?;
            }
            first = false;
            write!(f, "{}", c.meta().name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub fn prog_of(names: &[(&str, SyscallId)]) -> Prog {
        let calls = names
            .iter()
            .map(|(n, id)| Call::new(Arc::new(Syscall::new(*id, *n))))
            .collect();
        Prog::new(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::prog_of;
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let p = prog_of(&[("open", 2), ("write", 1), ("close", 3)]);
        let data = p.serialize();
        let p2 = Prog::deserialize(&data).unwrap();
        assert_eq!(p, p2);
        assert_eq!(p.sig(), p2.sig());
    }

    #[test]
    fn one_liner() {
        let p = prog_of(&[("mkdir", 83), ("open", 2)]);
        assert_eq!(p.to_string(), "mkdir-open");
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(Prog::deserialize(b"").is_err());
        assert!(Prog::deserialize(b"nospace\n").is_err());
        assert!(Prog::deserialize(b"x open\n").is_err());
    }

    #[test]
    fn remove_call_shifts() {
        let mut p = prog_of(&[("a", 0), ("b", 1), ("c", 2)]);
        p.remove_call(1);
        assert_eq!(p.to_string(), "a-c");
    }
}
