//! Fuzzer statistics, drained losslessly at manager-poll time.

use fsdiff_core::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Execution counters, broken down by what triggered the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Gen,
    Fuzz,
    Candidate,
    Triage,
    TriageState,
    Minimize,
    MinimizeState,
}

#[derive(Debug, Default)]
pub struct Stats {
    iteration: AtomicU64,
    generated: AtomicU64,
    fuzzed: AtomicU64,
    triaged: AtomicU64,
    new_input: AtomicU64,
    new_state: AtomicU64,
    new_diff: AtomicU64,
    exec_gen: AtomicU64,
    exec_fuzz: AtomicU64,
    exec_candidate: AtomicU64,
    exec_triage: AtomicU64,
    exec_triage_state: AtomicU64,
    exec_minimize: AtomicU64,
    exec_minimize_state: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_iteration(&self) {
        self.iteration.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_generated(&self) {
        self.generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fuzzed(&self) {
        self.fuzzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_triaged(&self) {
        self.triaged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_new_input(&self) {
        self.new_input.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_new_state(&self) {
        self.new_state.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_new_diff(&self) {
        self.new_diff.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_exec(&self, kind: ExecKind) {
        self.exec_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    fn exec_counter(&self, kind: ExecKind) -> &AtomicU64 {
        match kind {
            ExecKind::Gen => &self.exec_gen,
            ExecKind::Fuzz => &self.exec_fuzz,
            ExecKind::Candidate => &self.exec_candidate,
            ExecKind::Triage => &self.exec_triage,
            ExecKind::TriageState => &self.exec_triage_state,
            ExecKind::Minimize => &self.exec_minimize,
            ExecKind::MinimizeState => &self.exec_minimize_state,
        }
    }

    /// Swaps every counter to zero and records the deltas under their
    /// wire names. Returns the total of the exec breakdown counters.
    pub fn drain(&self, into: &mut HashMap<String, u64>) -> u64 {
        let mut swap = |name: &str, counter: &AtomicU64| {
            let v = counter.swap(0, Ordering::Relaxed);
            into.insert(name.to_string(), v);
            v
        };
        swap("#Iteration", &self.iteration);
        swap("#Generated", &self.generated);
        swap("#Fuzzed", &self.fuzzed);
        swap("#Triaged", &self.triaged);
        swap("fuzzer new inputs", &self.new_input);
        swap("fuzzer new state", &self.new_state);
        swap("fuzzer new diffs", &self.new_diff);
        let mut exec_total = 0;
        exec_total += swap("exec gen", &self.exec_gen);
        exec_total += swap("exec fuzz", &self.exec_fuzz);
        exec_total += swap("exec candidate", &self.exec_candidate);
        exec_total += swap("exec triage", &self.exec_triage);
        exec_total += swap("exec triage (state)", &self.exec_triage_state);
        exec_total += swap("exec minimize", &self.exec_minimize);
        exec_total += swap("exec minimize (state)", &self.exec_minimize_state);
        exec_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_lossless() {
        let stats = Stats::new();
        stats.inc_exec(ExecKind::Gen);
        stats.inc_exec(ExecKind::Gen);
        stats.inc_exec(ExecKind::Triage);
        stats.inc_iteration();

        let mut map = HashMap::default();
        let total = stats.drain(&mut map);
        assert_eq!(total, 3);
        assert_eq!(map["exec gen"], 2);
        assert_eq!(map["exec triage"], 1);
        assert_eq!(map["#Iteration"], 1);

        let mut map = HashMap::default();
        assert_eq!(stats.drain(&mut map), 0);
        assert_eq!(map["exec gen"], 0);
    }
}
