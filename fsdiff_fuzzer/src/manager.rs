//! Manager contract.
//!
//! The cross-host RPC transport is provided by the deployment; the
//! fuzzer only depends on this trait. [`LocalManager`] runs the fuzzer
//! standalone, persisting diff-inducing programs to the work directory.

use fsdiff_core::hash::Sig;
use fsdiff_core::HashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcInput {
    pub call: String,
    pub prog: Vec<u8>,
    pub call_index: usize,
    pub signal: Vec<u32>,
    pub cover: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcCandidate {
    pub prog: Vec<u8>,
    pub minimized: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConnectRes {
    pub inputs: Vec<RpcInput>,
    pub max_signal: Vec<u32>,
    pub candidates: Vec<RpcCandidate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollArgs {
    pub name: String,
    pub stats: HashMap<String, u64>,
    pub max_signal: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRes {
    pub max_signal: Vec<u32>,
    pub new_inputs: Vec<RpcInput>,
    pub candidates: Vec<RpcCandidate>,
}

pub trait Manager: Send + Sync {
    fn connect(&self, name: &str) -> io::Result<ConnectRes>;
    fn poll(&self, args: PollArgs) -> io::Result<PollRes>;
    fn new_input(&self, name: &str, input: RpcInput) -> io::Result<()>;
    fn new_diff(&self, name: &str, prog: Vec<u8>) -> io::Result<()>;
}

/// Standalone manager: no candidates, no peers; diff-inducing programs
/// land under `<workdir>/diffs/<sig>.prog`.
pub struct LocalManager {
    workdir: PathBuf,
}

impl LocalManager {
    pub fn new(workdir: PathBuf) -> io::Result<LocalManager> {
        fs::create_dir_all(workdir.join("diffs"))?;
        fs::create_dir_all(workdir.join("corpus"))?;
        Ok(LocalManager { workdir })
    }
}

impl Manager for LocalManager {
    fn connect(&self, _name: &str) -> io::Result<ConnectRes> {
        Ok(ConnectRes::default())
    }

    fn poll(&self, args: PollArgs) -> io::Result<PollRes> {
        for (stat, val) in args.stats.iter() {
            if *val != 0 {
                log::debug!("stat {}: +{}", stat, val);
            }
        }
        Ok(PollRes::default())
    }

    fn new_input(&self, _name: &str, input: RpcInput) -> io::Result<()> {
        let sig = Sig::hash(&input.prog);
        fs::write(
            self.workdir.join("corpus").join(format!("{}.prog", sig)),
            &input.prog,
        )
    }

    fn new_diff(&self, name: &str, prog: Vec<u8>) -> io::Result<()> {
        let sig = Sig::hash(&prog);
        let path = self.workdir.join("diffs").join(format!("{}.prog", sig));
        log::info!("{}: new diff-inducing program saved to {}", name, path.display());
        fs::write(path, &prog)
    }
}
