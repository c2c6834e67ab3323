//! Fuzzer worker: one executor environment driven by the shared triage
//! queues, with generation/mutation filling the idle iterations.

use crate::config::{Config, OutputKind};
use crate::feedback::Feedback;
use crate::manager::{Manager, RpcInput};
use crate::queue::{Input, InputState, Task, TriageQueues};
use crate::stats::{ExecKind, Stats};
use crate::util::stop_soon;
use anyhow::Context;
use fsdiff_core::builder::ProgBuilder;
use fsdiff_core::corpus::CorpusWrapper;
use fsdiff_core::diff::{check_hash, check_returns, ExecResult};
use fsdiff_core::hash::Sig;
use fsdiff_core::lru::Lru;
use fsdiff_core::minimize::minimize;
use fsdiff_core::prog::Prog;
use fsdiff_core::{HashSet, RngType};
use fsdiff_exec::env::{CallInfo, Env};
use fsdiff_exec::gate::Gate;
use fsdiff_exec::ExecOpt;
use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

/// Upper bound on generated program length.
pub const PROGRAM_LENGTH: usize = 30;

/// Seen-state fingerprints; local to this process, not shared with other
/// fuzzer instances.
pub struct StateCache {
    inner: Mutex<Lru<Sig, ()>>,
}

impl StateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(capacity)),
        }
    }

    pub fn contains(&self, sig: &Sig) -> bool {
        self.inner.lock().unwrap().get(sig).is_some()
    }

    pub fn add(&self, sig: Sig) {
        self.inner.lock().unwrap().add(sig, ());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SharedState {
    pub corpus: Arc<CorpusWrapper>,
    pub feedback: Arc<Feedback>,
    pub queues: Arc<TriageQueues>,
    pub stats: Arc<Stats>,
    pub state_cache: Option<Arc<StateCache>>,
    pub gate: Arc<Gate>,
    pub manager: Arc<dyn Manager>,
    pub builder: Arc<dyn ProgBuilder>,
}

impl Clone for SharedState {
    fn clone(&self) -> Self {
        Self {
            corpus: Arc::clone(&self.corpus),
            feedback: Arc::clone(&self.feedback),
            queues: Arc::clone(&self.queues),
            stats: Arc::clone(&self.stats),
            state_cache: self.state_cache.as_ref().map(Arc::clone),
            gate: Arc::clone(&self.gate),
            manager: Arc::clone(&self.manager),
            builder: Arc::clone(&self.builder),
        }
    }
}

pub struct Fuzzer {
    pub shared: SharedState,
    pub config: Arc<Config>,
    pub id: u64,
    pub rng: RngType,
    pub env: Env,
    pub poll_wake: Sender<()>,
}

impl Fuzzer {
    pub fn fuzz_loop(&mut self) -> anyhow::Result<()> {
        let mut iter: u64 = 0;
        while !stop_soon() {
            iter += 1;
            self.shared.stats.inc_iteration();

            if let Some(task) = self.shared.queues.pop() {
                self.shared.stats.inc_triaged();
                match task {
                    Task::TriageCandidate(inp) => {
                        log::debug!("fuzzer-{}: triaging candidate: {}", self.id, inp.p);
                        self.triage_input(inp)?;
                    }
                    Task::Candidate(c) => {
                        if self.shared.queues.candidates_len() < self.config.procs {
                            let _ = self.poll_wake.send(());
                        }
                        log::debug!("fuzzer-{}: executing candidate: {}", self.id, c.p);
                        self.execute(&c.p, c.minimized, true, ExecKind::Candidate)?;
                    }
                    Task::Triage(inp) => {
                        log::debug!("fuzzer-{}: triaging: {}", self.id, inp.p);
                        self.triage_input(inp)?;
                    }
                    Task::TriageState(inp) => {
                        log::debug!("fuzzer-{}: triaging by state: {}", self.id, inp.p);
                        self.triage_input_by_state(inp)?;
                    }
                }
                continue;
            }

            if self.shared.corpus.is_empty() || iter % 100 == 0 {
                self.shared.stats.inc_generated();
                let p = loop {
                    let p = self
                        .shared
                        .builder
                        .generate(&mut self.rng, PROGRAM_LENGTH);
                    if !self.shared.builder.blacklisted(&p) {
                        break p;
                    }
                };
                log::debug!("fuzzer-{}: generating: {}", self.id, p);
                self.execute(&p, false, false, ExecKind::Gen)?;
            } else {
                let p = match self.shared.corpus.select_one(&mut self.rng) {
                    Some(p) => p,
                    None => continue,
                };
                self.shared.stats.inc_fuzzed();
                let mut p = p;
                let shared = &self.shared;
                let rng = &mut self.rng;
                shared.corpus.with_progs(|progs| {
                    shared.builder.mutate(rng, &mut p, progs, PROGRAM_LENGTH)
                });
                if p.is_empty() || self.shared.builder.blacklisted(&p) {
                    continue;
                }
                log::debug!("fuzzer-{}: mutating: {}", self.id, p);
                self.execute(&p, false, false, ExecKind::Fuzz)?;
            }
        }
        Ok(())
    }

    /// Runs `p` under every filesystem: a discrepancy is reported and the
    /// program dropped, new coverage queues coverage triage, and an
    /// unseen first-filesystem state queues state triage.
    fn execute(
        &mut self,
        p: &Prog,
        minimized: bool,
        candidate: bool,
        kind: ExecKind,
    ) -> anyhow::Result<()> {
        let (info, states) = self.execute_all(p, kind, false, true)?;

        if check_hash(&states) || check_returns(&states) {
            self.report_diff(p)?;
            // don't let diff-inducing programs into the corpus
            return Ok(());
        }

        let mut added = false;
        for (i, inf) in info.iter().enumerate() {
            let new = self.shared.feedback.diff_max(&inf.signal);
            if new.is_empty() {
                continue;
            }
            self.shared.feedback.add_max_new(&new);
            self.shared.queues.push_triage(
                Input {
                    p: p.clone(),
                    call: i,
                    signal: inf.signal.clone(),
                    minimized,
                },
                candidate,
            );
            added = true;
        }

        if let (Some(cache), false) = (self.shared.state_cache.as_ref(), added) {
            if let Some(first) = states.first() {
                if !cache.contains(&first.state_hash) {
                    self.shared.queues.push_triage_state(InputState {
                        p: p.clone(),
                        state_hash: first.state_hash,
                    });
                }
            }
        }
        Ok(())
    }

    /// Coverage triage: strip flaky signal by re-execution under the
    /// reference filesystem, minimize while the stable signal survives,
    /// then publish.
    fn triage_input(&mut self, mut inp: Input) -> anyhow::Result<()> {
        let mut new_signal = self.shared.feedback.diff_corpus(&inp.signal);
        if new_signal.is_empty() {
            return Ok(());
        }
        let call_name = match inp.p.calls().get(inp.call) {
            Some(c) => c.meta().name().to_string(),
            None => return Ok(()),
        };
        log::debug!(
            "fuzzer-{}: triaging input for {} (new signal={})",
            self.id,
            call_name,
            new_signal.len()
        );

        let reference = self.config.reference_fs().to_string();
        let mut input_cover: Vec<u32> = Vec::new();
        if inp.minimized {
            // just collect input coverage
            for _ in 0..3 {
                let (info, _) =
                    self.execute_internal(&inp.p, ExecKind::Triage, true, false, &reference)?;
                match info.get(inp.call) {
                    Some(inf) if !inf.cover.is_empty() => {
                        input_cover = inf.cover.clone();
                        break;
                    }
                    // the call was not executed, happens sometimes
                    _ => continue,
                }
            }
        } else {
            let mut not_executed = false;
            for _ in 0..3 {
                let (info, _) =
                    self.execute_internal(&inp.p, ExecKind::Triage, true, false, &reference)?;
                let inf = match info.get(inp.call) {
                    Some(inf) if !inf.signal.is_empty() => inf,
                    _ => {
                        if not_executed {
                            return Ok(()); // not executed twice, give up
                        }
                        not_executed = true;
                        continue;
                    }
                };
                let observed: HashSet<u32> = inf.signal.iter().copied().collect();
                new_signal.retain(|s| observed.contains(s));
                if new_signal.is_empty() {
                    return Ok(());
                }
                if input_cover.is_empty() {
                    input_cover = inf.cover.clone();
                } else {
                    let mut cover: HashSet<u32> = input_cover.iter().copied().collect();
                    cover.extend(inf.cover.iter().copied());
                    input_cover = cover.into_iter().collect();
                }
            }

            let stable = new_signal.clone();
            let mut exec_err = None;
            let (p_min, call_min) = minimize(&inp.p, Some(inp.call), |cand, cand_call| {
                if exec_err.is_some() {
                    return false;
                }
                let call = match cand_call {
                    Some(c) => c,
                    None => return false,
                };
                match self.execute_internal(cand, ExecKind::Minimize, false, false, &reference) {
                    Ok((info, _)) => match info.get(call) {
                        Some(inf) if !inf.signal.is_empty() => {
                            let sig: HashSet<u32> = inf.signal.iter().copied().collect();
                            stable.iter().all(|s| sig.contains(s))
                        }
                        _ => false,
                    },
                    Err(e) => {
                        exec_err = Some(e);
                        false
                    }
                }
            });
            if let Some(e) = exec_err {
                return Err(e);
            }
            inp.p = p_min;
            if let Some(c) = call_min {
                inp.call = c;
            }
        }

        self.shared.stats.inc_new_input();
        log::debug!(
            "fuzzer-{}: added new input for {} to corpus",
            self.id,
            call_name
        );
        self.shared
            .manager
            .new_input(
                &self.config.name,
                RpcInput {
                    call: call_name,
                    prog: inp.p.serialize(),
                    call_index: inp.call,
                    signal: inp.signal.clone(),
                    cover: input_cover,
                },
            )
            .context("failed to publish new input")?;
        self.shared.feedback.add_corpus(&inp.signal);
        self.shared.corpus.add_prog(inp.p);
        Ok(())
    }

    /// State triage: minimize while the first filesystem keeps reaching
    /// the same state and no cross-filesystem divergence appears, then
    /// remember the state and admit the program.
    fn triage_input_by_state(&mut self, inp: InputState) -> anyhow::Result<()> {
        self.shared.stats.inc_exec(ExecKind::TriageState);

        let mut exec_err = None;
        let (p_min, _) = minimize(&inp.p, None, |cand, _| {
            if exec_err.is_some() {
                return false;
            }
            match self.execute_all(cand, ExecKind::MinimizeState, false, true) {
                Ok((_, states)) => {
                    match states.first() {
                        Some(first) if first.state_hash == inp.state_hash => {
                            // keep only candidates that introduce no divergence
                            !check_hash(&states)
                        }
                        _ => false, // state changed
                    }
                }
                Err(e) => {
                    exec_err = Some(e);
                    false
                }
            }
        });
        if let Some(e) = exec_err {
            return Err(e);
        }

        self.shared.stats.inc_new_state();
        if let Some(cache) = self.shared.state_cache.as_ref() {
            cache.add(inp.state_hash);
        }
        if p_min.is_empty() {
            return Ok(());
        }
        self.shared.corpus.add_prog(p_min);
        Ok(())
    }

    /// One program under all filesystem roots; per-call signal and cover
    /// are combined across roots.
    fn execute_all(
        &mut self,
        p: &Prog,
        kind: ExecKind,
        need_cover: bool,
        need_state: bool,
    ) -> anyhow::Result<(Vec<CallInfo>, Vec<ExecResult>)> {
        let mut combined = vec![CallInfo::default(); p.len()];
        let mut states = Vec::new();
        let roots = self.config.rootdirs.clone();
        for fs in &roots {
            let (info, state) = self.execute_internal(p, kind, need_cover, need_state, fs)?;
            if let Some(state) = state {
                states.push(state);
            }
            for (call, inf) in info.into_iter().enumerate() {
                combined[call].signal.extend(inf.signal);
                combined[call].cover.extend(inf.cover);
            }
        }
        Ok((combined, states))
    }

    fn execute_internal(
        &mut self,
        p: &Prog,
        kind: ExecKind,
        need_cover: bool,
        need_state: bool,
        fs: &str,
    ) -> anyhow::Result<(Vec<CallInfo>, Option<ExecResult>)> {
        // limit the concurrency window; leak checking piggybacks on the
        // gate's hook
        let _permit = self.shared.gate.enter();
        self.log_program(p);

        let opt = ExecOpt {
            cover: need_cover,
            dedup: true,
            need_state,
        };
        let mut tries = 0;
        loop {
            self.shared.stats.inc_exec(kind);
            match self.env.exec(Some(p), &opt, fs) {
                Ok(out) if out.failed => {
                    log::error!(
                        "fuzzer-{}: BUG: executor-detected bug:\n{}",
                        self.id,
                        String::from_utf8_lossy(&out.output)
                    );
                    // return no cover so the input never reaches the corpus
                    return Ok((Vec::new(), None));
                }
                Ok(out) => return Ok((out.info, out.state)),
                Err(e) => {
                    if e.is_executor_failure() || tries > 10 {
                        return Err(e).context("executor failure");
                    }
                    tries += 1;
                    log::debug!(
                        "fuzzer-{}: executor error '{}', retrying #{}",
                        self.id,
                        e,
                        tries
                    );
                    sleep(Duration::from_secs(1));
                }
            }
        }
    }

    fn report_diff(&self, p: &Prog) -> anyhow::Result<()> {
        self.shared.stats.inc_new_diff();
        log::info!("fuzzer-{}: reporting new diff: {}", self.id, p);
        let data = p.serialize();
        let mut last_err = None;
        for attempt in 1..=3 {
            match self.shared.manager.new_diff(&self.config.name, data.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("failed to report new diff (try {}): {}", attempt, e);
                    last_err = Some(e);
                    sleep(Duration::from_secs(1));
                }
            }
        }
        Err(last_err.unwrap()).context("failed to report new diff")
    }

    fn log_program(&self, p: &Prog) {
        match self.config.output {
            OutputKind::None => {}
            OutputKind::Stdout => log::info!(
                "fuzzer-{}: executing program:\n{}",
                self.id,
                String::from_utf8_lossy(&p.serialize())
            ),
            OutputKind::Dmesg => {
                if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
                    let _ = write!(
                        f,
                        "fsdiff-fuzzer: executing program {}:\n{}",
                        self.id,
                        String::from_utf8_lossy(&p.serialize())
                    );
                }
            }
            OutputKind::File => {
                let _ = std::fs::write(
                    format!("{}-{}.prog", self.config.name, self.id),
                    p.serialize(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cache_remembers() {
        let cache = StateCache::new(2);
        let a = Sig::hash(b"a");
        let b = Sig::hash(b"b");
        let c = Sig::hash(b"c");
        assert!(!cache.contains(&a));
        cache.add(a);
        assert!(cache.contains(&a));
        cache.add(b);
        cache.add(c); // evicts a
        assert!(!cache.contains(&a));
        assert_eq!(cache.len(), 2);
    }
}
