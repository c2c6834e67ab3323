use anyhow::Context;
use clap::Parser;
use env_logger::fmt::TimestampPrecision;
use env_logger::Env as LogEnv;
use fsdiff_core::builder::TableBuilder;
use fsdiff_core::diff::REFERENCE_FS;
use fsdiff_core::prog::Prog;
use fsdiff_exec::repro::{reproduce, ReproConfig, ReproOutcome};
use std::fs;
use std::path::{Path, PathBuf};

/// Reproduce a diff-inducing program against a set of test filesystems.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Settings {
    /// Colon-separated list of test filesystems (two or more).
    #[arg(long)]
    testfs: String,
    /// Diff-inducing program to reproduce.
    #[arg(long, conflicts_with = "dir")]
    prog: Option<PathBuf>,
    /// Directory of diff-inducing programs to reproduce.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Path to the executor binary.
    #[arg(long, default_value = "./fsdiff-executor")]
    executor: PathBuf,
    /// Summary of reproduction and minimization.
    #[arg(long, default_value = "repro.log")]
    log: PathBuf,
    /// Minimize the input program.
    #[arg(long)]
    min: bool,
    /// Keep session working directories on exit.
    #[arg(long)]
    save: bool,
    /// Include return values in the discrepancy classification.
    #[arg(long)]
    ret: bool,
    /// Reference filesystem root.
    #[arg(long, default_value = REFERENCE_FS)]
    reference: String,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = LogEnv::new()
        .filter_or("FSDIFF_LOG", "info")
        .write_style_or("FSDIFF_LOG_STYLE", "auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let testfs: Vec<String> = settings
        .testfs
        .split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let builder = TableBuilder::with_default_table();
    let mut config = ReproConfig::new(testfs, settings.executor, settings.log.clone());
    config.minimize = settings.min;
    config.save_dirs = settings.save;
    config.check_returns = settings.ret;
    config.reference = settings.reference;

    let mut failures = 0usize;
    match (&settings.prog, &settings.dir) {
        (Some(prog), _) => {
            if !run_one(&config, prog, &builder)? {
                failures += 1;
            }
        }
        (None, Some(dir)) => {
            // one report per program, named after the input file
            fs::create_dir_all(&settings.log)
                .with_context(|| format!("failed to create {}", settings.log.display()))?;
            let mut entries: Vec<_> = fs::read_dir(dir)
                .with_context(|| format!("failed to read {}", dir.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            for path in entries {
                let name = file_name(&path);
                let mut config = config.clone();
                config.log = settings.log.join(format!("{}.log", name));
                match run_one(&config, &path, &builder) {
                    Ok(true) => {}
                    Ok(false) => failures += 1,
                    Err(e) => {
                        log::error!("{}: {:#}", name, e);
                        failures += 1;
                    }
                }
            }
        }
        (None, None) => anyhow::bail!("must specify a program to reproduce (-prog or -dir)"),
    }

    if failures != 0 {
        anyhow::bail!("{} program(s) failed to reproduce", failures);
    }
    Ok(())
}

fn run_one(config: &ReproConfig, prog_path: &Path, builder: &TableBuilder) -> anyhow::Result<bool> {
    let data = fs::read(prog_path)
        .with_context(|| format!("failed to read {}", prog_path.display()))?;
    let p = Prog::deserialize(&data)
        .with_context(|| format!("failed to parse {}", prog_path.display()))?;
    let name = file_name(prog_path);

    match reproduce(config, &name, &p, builder)? {
        ReproOutcome::Reproduced {
            state_diff,
            return_diff,
            min_prog,
        } => {
            log::info!(
                "{}: reproduced (state_diff={}, return_diff={}), report: {}",
                name,
                state_diff,
                return_diff,
                config.log.display()
            );
            if let Some(min) = min_prog {
                log::info!("{}: minimized prog: {}", name, min);
            }
            Ok(true)
        }
        ReproOutcome::NotReproduced => {
            log::warn!("{}: failed to reproduce discrepancy", name);
            Ok(false)
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prog".to_string())
}
