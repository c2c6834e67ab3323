//! Triage work queues.
//!
//! Four LIFO stacks under one lock, popped in fixed priority order so
//! externally supplied work drains before internal discoveries and the
//! freshest item of each kind runs first.

use fsdiff_core::hash::Sig;
use fsdiff_core::prog::Prog;
use std::sync::Mutex;

/// A program that produced new coverage and awaits stabilization.
#[derive(Debug, Clone)]
pub struct Input {
    pub p: Prog,
    pub call: usize,
    pub signal: Vec<u32>,
    pub minimized: bool,
}

/// A program that reached a never-before-seen filesystem state.
#[derive(Debug, Clone)]
pub struct InputState {
    pub p: Prog,
    pub state_hash: Sig,
}

/// An externally supplied program awaiting admission.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub p: Prog,
    pub minimized: bool,
}

#[derive(Debug)]
pub enum Task {
    TriageCandidate(Input),
    Candidate(Candidate),
    Triage(Input),
    TriageState(InputState),
}

#[derive(Debug, Default)]
pub struct TriageQueues {
    inner: Mutex<Queues>,
}

#[derive(Debug, Default)]
struct Queues {
    triage_candidate: Vec<Input>,
    candidates: Vec<Candidate>,
    triage: Vec<Input>,
    triage_state: Vec<InputState>,
}

impl TriageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority ready task, or `None` when all queues are empty.
    pub fn pop(&self) -> Option<Task> {
        let mut q = self.inner.lock().unwrap();
        if let Some(inp) = q.triage_candidate.pop() {
            return Some(Task::TriageCandidate(inp));
        }
        if let Some(c) = q.candidates.pop() {
            return Some(Task::Candidate(c));
        }
        if let Some(inp) = q.triage.pop() {
            return Some(Task::Triage(inp));
        }
        if let Some(inp) = q.triage_state.pop() {
            return Some(Task::TriageState(inp));
        }
        None
    }

    pub fn push_triage(&self, inp: Input, candidate: bool) {
        let mut q = self.inner.lock().unwrap();
        if candidate {
            q.triage_candidate.push(inp);
        } else {
            q.triage.push(inp);
        }
    }

    pub fn push_candidate(&self, c: Candidate) {
        self.inner.lock().unwrap().candidates.push(c);
    }

    pub fn push_triage_state(&self, inp: InputState) {
        self.inner.lock().unwrap().triage_state.push(inp);
    }

    pub fn candidates_len(&self) -> usize {
        self.inner.lock().unwrap().candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsdiff_core::prog::{Call, Syscall};
    use std::sync::Arc;

    fn prog() -> Prog {
        Prog::new(vec![Call::new(Arc::new(Syscall::new(2, "open")))])
    }

    #[test]
    fn pop_priority_order() {
        let q = TriageQueues::new();
        q.push_triage_state(InputState {
            p: prog(),
            state_hash: Sig::default(),
        });
        q.push_triage(
            Input {
                p: prog(),
                call: 0,
                signal: vec![],
                minimized: false,
            },
            false,
        );
        q.push_candidate(Candidate {
            p: prog(),
            minimized: false,
        });
        q.push_triage(
            Input {
                p: prog(),
                call: 0,
                signal: vec![],
                minimized: false,
            },
            true,
        );

        assert!(matches!(q.pop(), Some(Task::TriageCandidate(_))));
        assert!(matches!(q.pop(), Some(Task::Candidate(_))));
        assert!(matches!(q.pop(), Some(Task::Triage(_))));
        assert!(matches!(q.pop(), Some(Task::TriageState(_))));
        assert!(q.pop().is_none());
    }

    #[test]
    fn lifo_within_a_queue() {
        let q = TriageQueues::new();
        for call in 0..3 {
            q.push_triage(
                Input {
                    p: prog(),
                    call,
                    signal: vec![],
                    minimized: false,
                },
                false,
            );
        }
        match q.pop() {
            Some(Task::Triage(inp)) => assert_eq!(inp.call, 2),
            other => panic!("unexpected task: {:?}", other),
        }
    }
}
