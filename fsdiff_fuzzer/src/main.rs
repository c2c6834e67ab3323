use clap::Parser;
use env_logger::fmt::TimestampPrecision;
use env_logger::Env as LogEnv;
use fsdiff_core::builder::TableBuilder;
use fsdiff_fuzzer::config::{Config, OutputKind};
use fsdiff_fuzzer::manager::LocalManager;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Differential filesystem fuzzer.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Settings {
    /// Unique name reported to the manager.
    #[arg(long, default_value = "fsdiff-fuzzer")]
    name: String,
    /// Path to the executor binary.
    #[arg(long, default_value = "./fsdiff-executor")]
    executor: PathBuf,
    /// Manager rpc address; runs standalone when empty.
    #[arg(long, default_value = "")]
    manager: String,
    /// Number of parallel test processes.
    #[arg(long, default_value_t = 1)]
    procs: usize,
    /// Write executed programs to none/stdout/dmesg/file.
    #[arg(long, default_value = "stdout")]
    output: OutputKind,
    /// Colon-separated list of filesystem root directories.
    #[arg(long)]
    rootdirs: String,
    /// Enable guidance by new filesystem states.
    #[arg(long)]
    state: bool,
    /// Detect kernel memory leaks.
    #[arg(long)]
    leak: bool,
    /// Use threaded mode in executor.
    #[arg(long)]
    threaded: bool,
    /// Collide syscalls to provoke data races.
    #[arg(long)]
    collide: bool,
    /// Collect feedback signals (coverage).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    cover: bool,
    /// Sandbox for fuzzing (none/setuid/namespace).
    #[arg(long, default_value = "setuid")]
    sandbox: String,
    /// Debug output from executor.
    #[arg(long)]
    debug: bool,
    /// Execution timeout in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
    /// Directory for logs and discovered diffs.
    #[arg(long, default_value = "./workdir")]
    workdir: PathBuf,
    /// Optional syscall table file, one `<id> <name>` per line.
    #[arg(long)]
    calls: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = LogEnv::new()
        .filter_or("FSDIFF_LOG", "info")
        .write_style_or("FSDIFF_LOG_STYLE", "auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let builder = match settings.calls.as_ref() {
        Some(path) => {
            let text = read_to_string(path)?;
            TableBuilder::from_table_text(&text)
                .ok_or_else(|| anyhow::anyhow!("bad syscall table {}", path.display()))?
        }
        None => TableBuilder::with_default_table(),
    };

    let config = Config {
        name: settings.name,
        executor: settings.executor,
        manager: settings.manager,
        procs: settings.procs,
        output: settings.output,
        rootdirs: settings
            .rootdirs
            .split(':')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        state_guided: settings.state,
        leak: settings.leak,
        threaded: settings.threaded,
        collide: settings.collide,
        cover: settings.cover,
        sandbox: settings.sandbox,
        debug: settings.debug,
        timeout: Duration::from_secs(settings.timeout),
        workdir: settings.workdir.clone(),
        ..Config::default()
    };

    if !config.manager.is_empty() {
        log::warn!(
            "manager rpc transport is supplied by the deployment; running standalone against {}",
            settings.workdir.display()
        );
    }
    let manager = Arc::new(LocalManager::new(settings.workdir)?);

    fsdiff_fuzzer::boot(config, Arc::new(builder), manager)
}
