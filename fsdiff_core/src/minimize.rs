//! Call-removal program minimization.
//!
//! The driver repeatedly drops calls the predicate allows. Argument-level
//! simplification belongs to the external program database; at this layer
//! a program only shrinks.

use crate::prog::Prog;

/// Minimizes `p` while `pred` keeps accepting candidates. When `call` is
/// given, that call is never removed and its index is tracked through
/// removals; the final index is returned alongside the program.
///
/// `pred` receives a candidate and the remapped protected-call index and
/// must be deterministic for the result to be meaningful.
pub fn minimize<F>(p: &Prog, call: Option<usize>, mut pred: F) -> (Prog, Option<usize>)
where
    F: FnMut(&Prog, Option<usize>) -> bool,
{
    let mut cur = p.clone();
    let mut cur_call = call;
    if cur.len() <= 1 {
        return (cur, cur_call);
    }

    let mut i = 0;
    while i < cur.len() && cur.len() > 1 {
        if Some(i) == cur_call {
            i += 1;
            continue;
        }
        let mut cand = cur.clone();
        cand.remove_call(i);
        let cand_call = cur_call.map(|c| if c > i { c - 1 } else { c });
        if pred(&cand, cand_call) {
            cur = cand;
            cur_call = cand_call;
        } else {
            i += 1;
        }
    }
    (cur, cur_call)
}
