//! fsdiff fuzzer: differential testing of filesystems through a fleet of
//! syscall programs.

pub mod config;
pub mod feedback;
pub mod fuzzer;
pub mod leak;
pub mod manager;
pub mod queue;
pub mod stats;
pub mod util;

use crate::config::{Config, OutputKind};
use crate::feedback::Feedback;
use crate::fuzzer::{Fuzzer, SharedState, StateCache};
use crate::manager::{Manager, PollArgs, PollRes, RpcCandidate, RpcInput};
use crate::queue::{Candidate, TriageQueues};
use crate::stats::Stats;
use crate::util::{stop_req, stop_soon};
use anyhow::Context;
use fsdiff_core::builder::ProgBuilder;
use fsdiff_core::corpus::CorpusWrapper;
use fsdiff_core::prog::Prog;
use fsdiff_core::{HashMap, RngType};
use fsdiff_exec::env::{Env, EnvConfig, EnvStats};
use fsdiff_exec::gate::{Gate, GateHook};
use rand::SeedableRng;
use std::fs::{self, File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn boot(
    config: Config,
    builder: Arc<dyn ProgBuilder>,
    manager: Arc<dyn Manager>,
) -> anyhow::Result<()> {
    config.check().context("config error")?;
    let config = Arc::new(config);
    log::info!("fuzzer started");

    fs::create_dir_all(&config.workdir).context("failed to create workdir")?;
    fs::create_dir_all(config.workdir.join("logs"))?;
    for dir in &config.rootdirs {
        fs::set_permissions(dir, Permissions::from_mode(0o777))
            .with_context(|| format!("failed to chmod {}", dir))?;
    }

    leak::init(config.leak).context("kmemleak init")?;
    let all_triaged = Arc::new(AtomicBool::new(false));
    let gate_hook: Option<GateHook> = if config.leak {
        let triaged = Arc::clone(&all_triaged);
        Some(Box::new(move || {
            // scan for leaks once in a while, it is slow; wait until the
            // initial triage phase has drained
            if triaged.load(Ordering::SeqCst) {
                if let Err(e) = leak::scan(true) {
                    log::warn!("kmemleak scan: {}", e);
                }
            }
        }))
    } else {
        None
    };

    let shared = SharedState {
        corpus: Arc::new(CorpusWrapper::new()),
        feedback: Arc::new(Feedback::new()),
        queues: Arc::new(TriageQueues::new()),
        stats: Arc::new(Stats::new()),
        state_cache: config
            .state_guided
            .then(|| Arc::new(StateCache::new(config.state_cache_size))),
        gate: Arc::new(Gate::new(2 * config.procs, gate_hook)),
        manager,
        builder,
    };

    setup_signal_handler();

    log::info!(
        "dialing manager at {}",
        if config.manager.is_empty() {
            "<standalone>"
        } else {
            &config.manager
        }
    );
    let connect = shared
        .manager
        .connect(&config.name)
        .context("manager connect")?;
    shared.feedback.merge_max(&connect.max_signal);
    for inp in connect.inputs {
        if let Err(e) = add_input(&shared, &config, inp) {
            log::warn!("dropping bad manager input: {:#}", e);
        }
    }
    enqueue_candidates(&shared, &config, connect.candidates)?;

    let (wake_tx, wake_rx) = mpsc::channel();
    let mut env_stats = Vec::with_capacity(config.procs);
    for pid in 0..config.procs as u64 {
        let env = Env::make(EnvConfig {
            bin: config.executor.to_string_lossy().into_owned(),
            timeout: config.timeout,
            flags: config.env_flags(),
            pid,
            debug_file: if config.debug {
                Some(File::options().write(true).open("/dev/stdout")?)
            } else {
                None
            },
        })
        .with_context(|| format!("failed to create env for fuzzer-{}", pid))?;
        env_stats.push(env.stats());

        let mut worker = Fuzzer {
            shared: shared.clone(),
            config: Arc::clone(&config),
            id: pid,
            rng: RngType::from_entropy(),
            env,
            poll_wake: wake_tx.clone(),
        };
        thread::Builder::new()
            .name(format!("fuzzer-{}", pid))
            .spawn(move || {
                if let Err(e) = worker.fuzz_loop() {
                    log::error!("fuzzer-{} exits with error: {:#}", worker.id, e);
                    stop_req();
                    process::exit(1);
                }
            })?;
    }
    log::info!("{} fuzzers started", config.procs);

    poll_loop(&shared, &config, env_stats, wake_rx, all_triaged)
}

fn setup_signal_handler() {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::Signals;

    thread::spawn(move || {
        let mut signals = match Signals::new(TERM_SIGNALS) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("failed to install signal handler: {}", e);
                return;
            }
        };
        if let Some(sig) = signals.forever().next() {
            log::info!("signal {} received, terminating", sig);
            stop_req();
            process::exit(1);
        }
    });
}

/// Admits a manager-provided input: corpus (deduplicated) plus its
/// signal into the coverage maps.
fn add_input(shared: &SharedState, config: &Config, inp: RpcInput) -> anyhow::Result<()> {
    if !config.cover {
        anyhow::bail!("manager inputs require coverage");
    }
    let p = Prog::deserialize(&inp.prog).context("bad input prog")?;
    if inp.call_index >= p.len() {
        anyhow::bail!("bad call index {} for {} calls", inp.call_index, p.len());
    }
    shared.corpus.add_prog(p);
    let new = shared.feedback.diff_max(&inp.signal);
    if !new.is_empty() {
        shared.feedback.add_corpus(&new);
    }
    Ok(())
}

fn enqueue_candidates(
    shared: &SharedState,
    config: &Config,
    candidates: Vec<RpcCandidate>,
) -> anyhow::Result<()> {
    for c in candidates {
        let p = Prog::deserialize(&c.prog).context("bad candidate prog")?;
        if !config.cover {
            shared.corpus.add_prog(p);
        } else {
            shared.queues.push_candidate(Candidate {
                p,
                minimized: c.minimized,
            });
        }
    }
    Ok(())
}

/// Periodic manager poll: ships stat deltas and new signal, pulls peer
/// inputs and fresh candidates. Polls are deferred while the local
/// candidate queue is saturated and forced when it drains.
fn poll_loop(
    shared: &SharedState,
    config: &Config,
    env_stats: Vec<Arc<EnvStats>>,
    wake_rx: Receiver<()>,
    all_triaged: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut exec_total: u64 = 0;
    let mut last_poll = Instant::now();
    let mut last_print = Instant::now();
    while !stop_soon() {
        let woken = matches!(wake_rx.recv_timeout(Duration::from_secs(3)), Ok(()));

        if config.output != OutputKind::Stdout && last_print.elapsed() > Duration::from_secs(10) {
            // keep-alive for the manager
            log::info!("alive, executed {}", exec_total);
            last_print = Instant::now();
        }
        if !woken && last_poll.elapsed() <= Duration::from_secs(10) {
            continue;
        }
        if shared.queues.candidates_len() > config.procs {
            continue;
        }

        let mut stats = HashMap::default();
        let mut env_execs = 0;
        let mut env_restarts = 0;
        for es in &env_stats {
            env_execs += es.execs.swap(0, Ordering::Relaxed);
            env_restarts += es.restarts.swap(0, Ordering::Relaxed);
        }
        stats.insert("exec total".to_string(), env_execs);
        stats.insert("executor restarts".to_string(), env_restarts);
        exec_total += shared.stats.drain(&mut stats);

        let args = PollArgs {
            name: config.name.clone(),
            stats,
            max_signal: shared.feedback.take_new(),
        };
        let res = poll_with_retry(shared.manager.as_ref(), args)?;

        if !res.max_signal.is_empty() {
            shared.feedback.merge_max(&res.max_signal);
        }
        let got_inputs = !res.new_inputs.is_empty();
        let got_candidates = !res.candidates.is_empty();
        for inp in res.new_inputs {
            if let Err(e) = add_input(shared, config, inp) {
                log::warn!("dropping bad manager input: {:#}", e);
            }
        }
        enqueue_candidates(shared, config, res.candidates)?;

        if !got_candidates && !all_triaged.load(Ordering::SeqCst) {
            if config.leak {
                if let Err(e) = leak::scan(false) {
                    log::warn!("kmemleak scan: {}", e);
                }
            }
            all_triaged.store(true, Ordering::SeqCst);
        }
        if !got_inputs && !got_candidates {
            last_poll = Instant::now();
        }
    }
    Ok(())
}

fn poll_with_retry(manager: &dyn Manager, args: PollArgs) -> anyhow::Result<PollRes> {
    let mut last_err = None;
    for attempt in 1..=3 {
        match manager.poll(args.clone()) {
            Ok(res) => return Ok(res),
            Err(e) => {
                log::warn!("manager poll failed (try {}): {}", attempt, e);
                last_err = Some(e);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    Err(last_err.unwrap()).context("manager poll failed")
}
