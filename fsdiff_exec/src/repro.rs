//! Deterministic single-program reproduction pipeline:
//! execute under every filesystem, classify the discrepancy, minimize
//! while preserving the delta fingerprint, then try a single-user
//! variant.

use crate::env::{Env, EnvConfig, ExecError};
use crate::report::ReportWriter;
use crate::{ExecOpt, FLAG_DEBUG, FLAG_REPRO};
use fsdiff_core::builder::ProgBuilder;
use fsdiff_core::diff::{
    check_hash, check_returns, delta_hash, difference, fs_short, ExecResult, REFERENCE_FS,
    STATE_FIELDS,
};
use fsdiff_core::minimize::minimize;
use fsdiff_core::prog::Prog;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const REPRO_TIMEOUT: Duration = Duration::from_secs(180);
const DEBUG_COPY_CHUNK: u64 = 8 << 20;

#[derive(Debug, Error)]
pub enum ReproError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("exec: {0}")]
    Exec(#[from] ExecError),
    #[error("executor-detected bug:\n{0}")]
    ExecutorBug(String),
    #[error("executor hanged")]
    Hang,
    #[error("executor restarted mid-reproduction")]
    Restarted,
    #[error("config: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct ReproConfig {
    /// Filesystem roots, at least two.
    pub testfs: Vec<String>,
    pub executor: PathBuf,
    pub log: PathBuf,
    pub minimize: bool,
    /// Keep session working directories on exit.
    pub save_dirs: bool,
    /// Include return-value checking in the classification.
    pub check_returns: bool,
    pub reference: String,
}

impl ReproConfig {
    pub fn new(testfs: Vec<String>, executor: PathBuf, log: PathBuf) -> Self {
        Self {
            testfs,
            executor,
            log,
            minimize: false,
            save_dirs: false,
            check_returns: true,
            reference: REFERENCE_FS.to_string(),
        }
    }

    pub fn check(&self) -> Result<(), ReproError> {
        if self.testfs.len() < 2 {
            return Err(ReproError::Config(
                "must specify two or more test filesystems".to_string(),
            ));
        }
        if !self.executor.exists() {
            return Err(ReproError::Config(format!(
                "executor binary {} not found",
                self.executor.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ReproOutcome {
    Reproduced {
        state_diff: bool,
        return_diff: bool,
        min_prog: Option<Prog>,
    },
    NotReproduced,
}

/// Reproduces one diff-inducing program and writes the report to
/// `config.log` (child debug output goes to `<log>.dbg`).
pub fn reproduce(
    config: &ReproConfig,
    name: &str,
    p: &Prog,
    builder: &dyn ProgBuilder,
) -> Result<ReproOutcome, ReproError> {
    config.check()?;
    let mut env = init_executor(config)?;
    let result = reproduce_in(config, name, p, builder, &mut env);
    let close_result = if config.save_dirs {
        env.close_without_rm()
    } else {
        env.close()
    };
    if let Err(e) = close_result {
        log::warn!("env teardown: {}", e);
    }
    result
}

fn reproduce_in(
    config: &ReproConfig,
    name: &str,
    p: &Prog,
    builder: &dyn ProgBuilder,
    env: &mut Env,
) -> Result<ReproOutcome, ReproError> {
    let mut report = ReportWriter::create(&config.log)?;
    report.header(name)?;

    if p.is_empty() {
        log::info!("received empty test program");
        return Ok(ReproOutcome::NotReproduced);
    }
    log::info!("received program to reproduce: {}", p);
    report.prog(p)?;

    let rs = match execute_all(env, p, &config.testfs) {
        Ok(rs) => rs,
        Err(e) => {
            report.failure(&format!("failed to execute program: {}", e))?;
            return Err(e);
        }
    };
    report.states(&rs)?;
    report.returns(p, &rs)?;

    let state_diff = check_hash(&rs);
    let return_diff = config.check_returns && check_returns(&rs);
    if !state_diff && !return_diff {
        report.failure("failed to reproduce discrepancy")?;
        return Ok(ReproOutcome::NotReproduced);
    }
    log::info!(
        "reproduced program {} (state_diff={}, return_diff={})",
        p,
        state_diff,
        return_diff
    );

    if !config.minimize {
        return Ok(ReproOutcome::Reproduced {
            state_diff,
            return_diff,
            min_prog: None,
        });
    }

    // The minimization fingerprint covers the reference filesystem plus
    // every filesystem whose initial state diverged from it.
    let (subset, fingerprint) = if state_diff {
        let ref_idx = rs
            .iter()
            .position(|r| fs_short(&r.fs) == fs_short(&config.reference))
            .unwrap_or(0);
        let mut subset = Vec::new();
        let mut rs_subset = Vec::new();
        for (i, r) in rs.iter().enumerate() {
            if i == ref_idx || r.state_hash != rs[ref_idx].state_hash {
                subset.push(config.testfs[i].clone());
                rs_subset.push(r.clone());
            }
        }
        let fp = delta_hash(&difference(
            &rs_subset,
            p,
            &STATE_FIELDS,
            false,
            &config.reference,
        ));
        (subset, Some(fp))
    } else {
        (config.testfs.clone(), None)
    };

    let (p1, _) = minimize(p, None, |cand, _| {
        let rs1 = match execute_all(env, cand, &subset) {
            Ok(rs1) => rs1,
            Err(e) => {
                log::warn!("execution threw error during minimization: {}", e);
                return false;
            }
        };
        match &fingerprint {
            Some(fp) => {
                delta_hash(&difference(
                    &rs1,
                    cand,
                    &STATE_FIELDS,
                    false,
                    &config.reference,
                )) == *fp
            }
            None => check_returns(&rs1),
        }
    });

    // single-user variant: adopt it only if the discrepancy survives
    let p2 = builder.single_user_variant(&p1);
    let p1 = match execute_all(env, &p2, &subset) {
        Ok(rs2) => {
            let keep = match &fingerprint {
                Some(fp) => {
                    delta_hash(&difference(
                        &rs2,
                        &p2,
                        &STATE_FIELDS,
                        false,
                        &config.reference,
                    )) == *fp
                }
                None => false,
            } || check_returns(&rs2);
            if keep {
                p2
            } else {
                p1
            }
        }
        Err(e) => {
            log::warn!("single-user variant failed to execute: {}", e);
            p1
        }
    };

    log::info!("minimized prog to {}", p1);
    report.minimized(&p1)?;
    Ok(ReproOutcome::Reproduced {
        state_diff,
        return_diff,
        min_prog: Some(p1),
    })
}

/// Executes `p` under each filesystem in order; any executor failure,
/// hang or restart aborts reproduction.
fn execute_all(env: &mut Env, p: &Prog, testfs: &[String]) -> Result<Vec<ExecResult>, ReproError> {
    let mut rs = Vec::with_capacity(testfs.len());
    for fs in testfs {
        let out = env.exec(Some(p), &ExecOpt::state_only(), fs)?;
        if out.failed {
            return Err(ReproError::ExecutorBug(
                String::from_utf8_lossy(&out.output).into_owned(),
            ));
        }
        if out.hanged {
            return Err(ReproError::Hang);
        }
        rs.push(out.state.ok_or(ReproError::Restarted)?);
    }
    Ok(rs)
}

/// Builds the environment with the child's debug output forwarded to
/// `<log>.dbg` on a bounded drain task.
fn init_executor(config: &ReproConfig) -> Result<Env, ReproError> {
    let (mut rp, wp) = os_pipe::pipe()?;
    let dbg_path = PathBuf::from(format!("{}.dbg", config.log.display()));
    let mut dbg_file = File::create(dbg_path)?;
    thread::spawn(move || loop {
        let mut chunk = Read::take(&mut rp, DEBUG_COPY_CHUNK);
        match io::copy(&mut chunk, &mut dbg_file) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    });

    let env = Env::make(EnvConfig {
        bin: config.executor.to_string_lossy().into_owned(),
        timeout: REPRO_TIMEOUT,
        flags: FLAG_REPRO | FLAG_DEBUG,
        pid: 0,
        debug_file: Some(File::from(OwnedFd::from(wp))),
    })?;
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_two_filesystems() {
        let cfg = ReproConfig::new(
            vec!["/testfs1".to_string()],
            PathBuf::from("/bin/true"),
            PathBuf::from("/tmp/repro.log"),
        );
        assert!(matches!(cfg.check(), Err(ReproError::Config(_))));
    }

    #[test]
    fn config_requires_existing_executor() {
        let cfg = ReproConfig::new(
            vec!["/testfs1".to_string(), "/testfs2".to_string()],
            PathBuf::from("/nonexistent/executor"),
            PathBuf::from("/tmp/repro.log"),
        );
        assert!(matches!(cfg.check(), Err(ReproError::Config(_))));
    }
}
