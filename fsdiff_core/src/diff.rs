//! Discrepancy analysis over per-filesystem execution results.
//!
//! One program runs under N filesystem roots and yields one [`ExecResult`]
//! per root. The engine compares state hashes, state descriptions and
//! per-call errno vectors, and condenses any divergence into a delta map
//! whose canonical JSON encoding is the bug signature.

use crate::hash::Sig;
use crate::prog::Prog;
use crate::HashMap;
use std::collections::BTreeMap;
use std::fmt;

/// Execution outcome of one program under one filesystem root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Filesystem identifier (session directory of the executor child).
    pub fs: String,
    /// Per-call return values, possibly shorter than the program when the
    /// executor stopped early.
    pub res: Vec<i32>,
    /// Per-call errno values, same length as `res`.
    pub errnos: Vec<i32>,
    /// Textual post-execution state, one whitespace-separated record per
    /// file with comma-separated fields.
    pub state: Vec<u8>,
    /// SHA-1 over `state`.
    pub state_hash: Sig,
}

impl ExecResult {
    pub fn with_state(fs: impl Into<String>, state: Vec<u8>) -> Self {
        let state_hash = Sig::hash(&state);
        Self {
            fs: fs.into(),
            state,
            state_hash,
            ..Self::default()
        }
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{fs:{}\n  state:{}  res:{:?}\n  errnos:{:?}}}",
            self.fs,
            String::from_utf8_lossy(&self.state),
            self.res,
            self.errnos
        )
    }
}

/// Fields of one state record, in on-wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Mode,
    Uid,
    Gid,
    Link,
    Size,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Name => "Name",
            Field::Mode => "Mode",
            Field::Uid => "Uid",
            Field::Gid => "Gid",
            Field::Link => "Link",
            Field::Size => "Size",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// All record fields, in the order they appear on the wire.
pub const STATE_FIELDS: [Field; 6] = [
    Field::Name,
    Field::Mode,
    Field::Uid,
    Field::Gid,
    Field::Link,
    Field::Size,
];

/// Per-filesystem divergence descriptions, keyed by filesystem name.
/// `BTreeMap` keeps the keys sorted so the JSON encoding is canonical.
pub type Delta = BTreeMap<String, String>;

/// True iff at least one filesystem ended in a different state.
pub fn check_hash(rs: &[ExecResult]) -> bool {
    rs.iter().skip(1).any(|r| r.state_hash != rs[0].state_hash)
}

/// True iff at least one syscall set errno differently in two or more
/// filesystems. Vectors of different length count as a divergence (one
/// executor stopped early).
pub fn check_returns(rs: &[ExecResult]) -> bool {
    rs.iter().skip(1).any(|r| r.errnos != rs[0].errnos)
}

struct StateRecord {
    fields: Vec<String>,
}

impl StateRecord {
    fn get(&self, f: Field) -> &str {
        self.fields.get(f.index()).map(String::as_str).unwrap_or("")
    }
}

fn parse_state(s: &[u8]) -> Vec<StateRecord> {
    let text = String::from_utf8_lossy(s);
    text.split_whitespace()
        .map(|rec| StateRecord {
            fields: rec
                .trim_matches('\0')
                .split(',')
                .map(|f| f.to_string())
                .collect(),
        })
        .collect()
}

/// Describes how two states differ on the selected fields. Emits the
/// single token `File-Num ` when the record counts differ, otherwise one
/// `<Name>-<field> ` token per disagreeing field, record-major.
pub fn diff_state(s0: &[u8], s1: &[u8], fields: &[Field]) -> String {
    let r0 = parse_state(s0);
    let r1 = parse_state(s1);
    let mut diff = String::new();
    if r0.len() != r1.len() {
        diff.push_str("File-Num ");
        return diff;
    }
    for (a, b) in r0.iter().zip(r1.iter()) {
        for &f in fields {
            if a.get(f) != b.get(f) {
                diff.push_str(a.get(Field::Name));
                diff.push('-');
                diff.push_str(f.name());
                diff.push(' ');
            }
        }
    }
    diff
}

/// Smallest call index at which some pair of results disagrees on errno,
/// a missing value (shorter vector) counting as a disagreement.
pub fn first_diff_ret(rs: &[ExecResult]) -> Option<usize> {
    let max_len = rs.iter().map(|r| r.errnos.len()).max()?;
    for i in 0..max_len {
        let first = rs.first().map(|r| r.errnos.get(i))?;
        if rs.iter().any(|r| r.errnos.get(i) != first) {
            return Some(i);
        }
    }
    None
}

fn errno_phrase(p: &Prog, r: &ExecResult, call: usize) -> String {
    let name = p
        .calls()
        .get(call)
        .map(|c| c.meta().name())
        .unwrap_or("?");
    match r.errnos.get(call) {
        Some(e) => format!("{}(errno {})", name, e),
        None => format!("{}()=nil(nil)", name),
    }
}

/// Root component of a filesystem identifier; session directories live
/// one level below their root, so this stays stable across restarts.
pub fn fs_short(fs: &str) -> &str {
    fs.split('/').find(|c| !c.is_empty()).unwrap_or(fs)
}

fn reference_index(rs: &[ExecResult], reference: &str) -> usize {
    rs.iter()
        .position(|r| fs_short(&r.fs) == fs_short(reference))
        .unwrap_or(0)
}

/// Default reference filesystem root.
pub const REFERENCE_FS: &str = "/testfs1";

/// Summarizes the divergence of every filesystem from the reference one.
/// Each entry maps the filesystem name to its state-diff tokens against
/// the reference, optionally followed by the errno phrase at the first
/// diverging call.
pub fn difference(
    rs: &[ExecResult],
    p: &Prog,
    fields: &[Field],
    check_rets: bool,
    reference: &str,
) -> Delta {
    let mut delta = Delta::new();
    if rs.is_empty() {
        return delta;
    }
    let ref_idx = reference_index(rs, reference);
    let ret_loc = if check_rets { first_diff_ret(rs) } else { None };
    for r in rs {
        let mut d = diff_state(&rs[ref_idx].state, &r.state, fields);
        if let Some(i) = ret_loc {
            d.push_str(&errno_phrase(p, r, i));
        }
        delta.insert(fs_short(&r.fs).to_string(), d.trim().to_string());
    }
    delta
}

/// Canonical JSON encoding of a delta, keys sorted ascending by
/// code-point. Stable across runs and machines; used as bug signature.
pub fn delta_hash(delta: &Delta) -> String {
    serde_json::to_string(delta).unwrap_or_default()
}

pub fn has_difference(delta: &Delta) -> bool {
    delta.values().any(|v| !v.is_empty())
}

/// Partitions the results by final state: results with equal state hash
/// share a group id, and the id of each group is the smallest result
/// index in it.
pub fn group_results(rs: &[ExecResult]) -> Vec<usize> {
    let mut owners: HashMap<Sig, usize> = HashMap::default();
    rs.iter()
        .enumerate()
        .map(|(i, r)| *owners.entry(r.state_hash).or_insert(i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::test_util::prog_of;

    fn result(fs: &str, state: &str, errnos: &[i32]) -> ExecResult {
        let mut r = ExecResult::with_state(fs, state.as_bytes().to_vec());
        r.res = vec![0; errnos.len()];
        r.errnos = errnos.to_vec();
        r
    }

    #[test]
    fn identical_filesystems_produce_empty_delta() {
        let p = prog_of(&[("touch", 1)]);
        let rs = vec![
            result("fsA", "a,0644,0,0,1,0\n", &[0]),
            result("fsB", "a,0644,0,0,1,0\n", &[0]),
        ];
        assert!(!check_hash(&rs));
        assert!(!check_returns(&rs));
        let delta = difference(&rs, &p, &STATE_FIELDS, true, "fsA");
        assert!(!has_difference(&delta));
        assert_eq!(delta_hash(&delta), r#"{"fsA":"","fsB":""}"#);
    }

    #[test]
    fn mode_bit_difference() {
        let a = b"a,0644,0,0,1,0";
        let b = b"a,0600,0,0,1,0";
        assert_eq!(diff_state(a, b, &[Field::Mode]), "a-Mode ");
        assert_eq!(diff_state(a, b, &[Field::Uid]), "");
    }

    #[test]
    fn file_count_difference_short_circuits() {
        let a = b"a,0644,0,0,1,0 b,0644,0,0,1,0";
        let b = b"a,0600,0,0,1,0";
        assert_eq!(diff_state(a, b, &STATE_FIELDS), "File-Num ");
    }

    #[test]
    fn errno_divergence_location_and_phrases() {
        let p = prog_of(&[("open", 2), ("write", 1), ("close", 3)]);
        let rs = vec![
            result("/testfs1/d0", "x", &[0, 0, 0]),
            result("/testfs2/d1", "x", &[0, 2, 0]),
        ];
        assert!(check_returns(&rs));
        assert_eq!(first_diff_ret(&rs), Some(1));
        let delta = difference(&rs, &p, &STATE_FIELDS, true, REFERENCE_FS);
        assert_eq!(delta["testfs1"], "write(errno 0)");
        assert_eq!(delta["testfs2"], "write(errno 2)");
    }

    #[test]
    fn shorter_errno_vector_diverges() {
        let p = prog_of(&[("open", 2), ("write", 1)]);
        let rs = vec![
            result("fsA", "x", &[0, 0]),
            result("fsB", "x", &[0]),
        ];
        assert!(check_returns(&rs));
        assert_eq!(first_diff_ret(&rs), Some(1));
        let delta = difference(&rs, &p, &STATE_FIELDS, true, "fsA");
        assert_eq!(delta["fsB"], "write()=nil(nil)");
    }

    #[test]
    fn return_values_do_not_classify() {
        // benign res differences (e.g. file descriptors) are ignored;
        // only errnos participate in the comparison
        let mut a = result("fsA", "x", &[0, 0]);
        let mut b = result("fsB", "x", &[0, 0]);
        a.res = vec![3, 0];
        b.res = vec![4, 0];
        assert!(!check_returns(&[a, b]));
    }

    #[test]
    fn check_hash_detects_any_pair() {
        let rs = vec![
            result("a", "s1", &[]),
            result("b", "s1", &[]),
            result("c", "s2", &[]),
        ];
        assert!(check_hash(&rs));
        assert!(!check_hash(&rs[..2]));
    }

    #[test]
    fn group_ids_are_first_occurrence_indices() {
        let rs = vec![
            result("a", "s1", &[]),
            result("b", "s2", &[]),
            result("c", "s1", &[]),
            result("d", "s3", &[]),
            result("e", "s2", &[]),
        ];
        assert_eq!(group_results(&rs), vec![0, 1, 0, 3, 1]);
    }

    #[test]
    fn delta_hash_is_insertion_order_independent() {
        let mut d1 = Delta::new();
        d1.insert("b".into(), "x".into());
        d1.insert("a".into(), "".into());
        let mut d2 = Delta::new();
        d2.insert("a".into(), "".into());
        d2.insert("b".into(), "x".into());
        assert_eq!(delta_hash(&d1), delta_hash(&d2));
        assert_eq!(delta_hash(&d1), r#"{"a":"","b":"x"}"#);
    }

    #[test]
    fn empty_state_has_well_defined_hash() {
        let r = ExecResult::with_state("fs", Vec::new());
        assert_eq!(
            r.state_hash.to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn reference_defaults_to_first_when_absent() {
        let p = prog_of(&[("open", 2)]);
        let rs = vec![
            result("/other/d0", "a,1,0,0,1,0", &[0]),
            result("/fs2/d1", "b,1,0,0,1,0", &[0]),
        ];
        let delta = difference(&rs, &p, &[Field::Name], false, REFERENCE_FS);
        assert_eq!(delta["other"], "");
        assert_eq!(delta["fs2"], "a-Name");
    }
}
