//! Fuzzer configuration.

use anyhow::Context;
use fsdiff_core::diff::{fs_short, REFERENCE_FS};
use fsdiff_exec::env::DEFAULT_TIMEOUT;
use fsdiff_exec::{
    sandbox_to_flags, EnvFlags, FLAG_COLLIDE, FLAG_DEBUG, FLAG_SIGNAL, FLAG_THREADED,
};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where executed programs are echoed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    None,
    Stdout,
    Dmesg,
    File,
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(OutputKind::None),
            "stdout" => Ok(OutputKind::Stdout),
            "dmesg" => Ok(OutputKind::Dmesg),
            "file" => Ok(OutputKind::File),
            _ => Err(format!(
                "output must be one of none/stdout/dmesg/file, got '{}'",
                s
            )),
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputKind::None => "none",
            OutputKind::Stdout => "stdout",
            OutputKind::Dmesg => "dmesg",
            OutputKind::File => "file",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique name, reported to the manager.
    pub name: String,
    pub executor: PathBuf,
    /// Manager RPC address; standalone when empty.
    pub manager: String,
    pub procs: usize,
    pub output: OutputKind,
    /// Filesystem roots, at least two.
    pub rootdirs: Vec<String>,
    /// Enable guidance by never-before-seen filesystem states.
    pub state_guided: bool,
    pub leak: bool,
    pub threaded: bool,
    pub collide: bool,
    pub cover: bool,
    pub sandbox: String,
    pub debug: bool,
    pub timeout: Duration,
    pub workdir: PathBuf,
    pub state_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "fsdiff-fuzzer".to_string(),
            executor: PathBuf::from("./fsdiff-executor"),
            manager: String::new(),
            procs: 1,
            output: OutputKind::Stdout,
            rootdirs: Vec::new(),
            state_guided: false,
            leak: false,
            threaded: false,
            collide: false,
            cover: true,
            sandbox: "setuid".to_string(),
            debug: false,
            timeout: DEFAULT_TIMEOUT,
            workdir: PathBuf::from("./workdir"),
            state_cache_size: STATE_CACHE_SIZE,
        }
    }
}

/// Default capacity of the seen-state LRU.
pub const STATE_CACHE_SIZE: usize = 1 << 20;

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.procs == 0 {
            anyhow::bail!("procs must be positive");
        }
        if self.rootdirs.len() < 2 {
            anyhow::bail!("must specify two or more rootdirs");
        }
        if !self.executor.exists() {
            anyhow::bail!("executor binary {} not found", self.executor.display());
        }
        sandbox_to_flags(&self.sandbox)
            .with_context(|| format!("bad sandbox '{}'", self.sandbox))?;
        for dir in &self.rootdirs {
            if !PathBuf::from(dir).is_dir() {
                anyhow::bail!("rootdir {} is not a directory", dir);
            }
        }
        Ok(())
    }

    pub fn env_flags(&self) -> EnvFlags {
        let mut flags = 0;
        if self.threaded {
            flags |= FLAG_THREADED;
        }
        if self.collide {
            flags |= FLAG_COLLIDE;
        }
        if self.cover {
            flags |= FLAG_SIGNAL;
        }
        flags |= sandbox_to_flags(&self.sandbox).unwrap_or(0);
        if self.debug {
            flags |= FLAG_DEBUG;
        }
        flags
    }

    /// Reference filesystem used by coverage triage.
    pub fn reference_fs(&self) -> &str {
        self.rootdirs
            .iter()
            .find(|d| fs_short(d) == fs_short(REFERENCE_FS))
            .map(String::as_str)
            .unwrap_or(&self.rootdirs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flags_compose() {
        let config = Config {
            threaded: true,
            cover: true,
            sandbox: "namespace".to_string(),
            ..Config::default()
        };
        let flags = config.env_flags();
        assert_ne!(flags & FLAG_THREADED, 0);
        assert_ne!(flags & FLAG_SIGNAL, 0);
        assert_eq!(flags & FLAG_COLLIDE, 0);
        assert_ne!(flags & fsdiff_exec::FLAG_SANDBOX_NAMESPACE, 0);
    }

    #[test]
    fn output_kind_parses() {
        assert_eq!("none".parse::<OutputKind>().unwrap(), OutputKind::None);
        assert_eq!("stdout".parse::<OutputKind>().unwrap(), OutputKind::Stdout);
        assert!("bogus".parse::<OutputKind>().is_err());
    }

    #[test]
    fn check_rejects_single_rootdir() {
        let config = Config {
            rootdirs: vec!["/tmp".to_string()],
            ..Config::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn reference_prefers_designated_root() {
        let config = Config {
            rootdirs: vec!["/testfs2".to_string(), "/testfs1".to_string()],
            ..Config::default()
        };
        assert_eq!(config.reference_fs(), "/testfs1");
        let config = Config {
            rootdirs: vec!["/a".to_string(), "/b".to_string()],
            ..Config::default()
        };
        assert_eq!(config.reference_fs(), "/a");
    }
}
