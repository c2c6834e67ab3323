//! Execution environment: the shared arenas plus one executor session
//! per filesystem root, with the output-region parser.

use crate::command::{Session, SessionError};
use crate::serialization::{self, SerializeError};
use crate::shm::ShmArena;
use crate::{EnvFlags, ExecOpt, FLAG_SIGNAL, IN_HEADER_SIZE, OUTPUT_SIZE, PROG_BUFFER_SIZE};
use bytes::Buf;
use fsdiff_core::diff::ExecResult;
use fsdiff_core::prog::Prog;
use fsdiff_core::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The supervisor timeout must outlive the executor's own per-program
/// timeout, otherwise a killed parent leaves a child executor alive.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("prog serialization: {0}")]
    Serialize(#[from] SerializeError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("output parse: {0}")]
    OutputParse(String),
    #[error("executor binary is an empty string")]
    EmptyBin,
}

impl ExecError {
    pub fn is_executor_failure(&self) -> bool {
        matches!(
            self,
            ExecError::Session(SessionError::ExecutorFailure(_))
        )
    }
}

#[derive(Debug, Default)]
pub struct EnvStats {
    pub execs: AtomicU64,
    pub restarts: AtomicU64,
}

pub struct EnvConfig {
    /// Executor binary, possibly with arguments, space-separated.
    pub bin: String,
    pub timeout: Duration,
    pub flags: EnvFlags,
    /// Worker id, written into the input arena header.
    pub pid: u64,
    pub debug_file: Option<File>,
}

/// Per-call coverage and errno, parsed from the output region.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub signal: Vec<u32>,
    pub cover: Vec<u32>,
    pub errno: i32,
}

/// Everything one `Env::exec` produced.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub info: Vec<CallInfo>,
    pub state: Option<ExecResult>,
    pub output: Vec<u8>,
    /// Executor detected a kernel bug in the target.
    pub failed: bool,
    pub hanged: bool,
}

pub struct Env {
    input: ShmArena,
    output: ShmArena,
    cmds: HashMap<String, Option<Session>>,
    bin: Vec<String>,
    timeout: Duration,
    flags: EnvFlags,
    debug_file: Option<File>,
    stats: Arc<EnvStats>,
}

impl Env {
    pub fn make(config: EnvConfig) -> Result<Env, ExecError> {
        let timeout = config.timeout.max(MIN_TIMEOUT);
        let tmp = std::env::temp_dir();
        let mut input = ShmArena::new(&tmp, "fsdiff-in-shm-", PROG_BUFFER_SIZE)?;
        let output = ShmArena::new(&tmp, "fsdiff-out-shm-", OUTPUT_SIZE)?;

        let header = input.bytes_mut();
        header[..8].copy_from_slice(&config.flags.to_le_bytes());
        header[8..16].copy_from_slice(&config.pid.to_le_bytes());

        let mut bin: Vec<String> = config
            .bin
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if bin.is_empty() {
            return Err(ExecError::EmptyBin);
        }
        // we chdir the child into its session dir
        bin[0] = std::path::absolute(&bin[0])?
            .to_string_lossy()
            .into_owned();

        Ok(Env {
            input,
            output,
            cmds: HashMap::default(),
            bin,
            timeout,
            flags: config.flags,
            debug_file: config.debug_file,
            stats: Arc::new(EnvStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<EnvStats> {
        Arc::clone(&self.stats)
    }

    /// Runs `p` once under `root_dir`, reusing (or lazily rebuilding) the
    /// session for that root. A `restart` outcome is invisible to the
    /// caller apart from the restart statistic; the next exec rebuilds
    /// the session.
    pub fn exec(
        &mut self,
        p: Option<&Prog>,
        opt: &ExecOpt,
        root_dir: &str,
    ) -> Result<ExecOutput, ExecError> {
        if let Some(p) = p {
            let in_buf = self.input.bytes_mut();
            serialization::serialize(p, &mut in_buf[IN_HEADER_SIZE..])?;
        }
        if self.flags & FLAG_SIGNAL != 0 || opt.need_state {
            // zero the leading words so a crashing executor leaves no
            // garbage where the record count lives
            self.output.bytes_mut()[..16].fill(0);
        }
        self.stats.execs.fetch_add(1, Ordering::Relaxed);

        if !matches!(self.cmds.get(root_dir), Some(Some(_))) {
            if matches!(self.cmds.get(root_dir), Some(None)) {
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            }
            let session = match Session::spawn(
                &self.bin,
                self.timeout,
                self.flags,
                self.input.file(),
                self.output.file(),
                Path::new(root_dir),
                self.debug_file.as_ref(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    self.cmds.insert(root_dir.to_string(), None);
                    return Err(e.into());
                }
            };
            self.cmds.insert(root_dir.to_string(), Some(session));
        }

        let session = self.cmds.get_mut(root_dir).unwrap().as_mut().unwrap();
        let run = match session.exec(opt) {
            Ok(run) => run,
            Err(e) => {
                self.discard(root_dir);
                return Err(e.into());
            }
        };
        if run.restart || run.failed {
            self.discard(root_dir);
            return Ok(ExecOutput {
                output: run.output,
                failed: run.failed,
                hanged: run.hanged,
                ..Default::default()
            });
        }

        let mut out = ExecOutput {
            output: run.output,
            hanged: run.hanged,
            ..Default::default()
        };
        let p = match p {
            Some(p) => p,
            None => return Ok(out),
        };
        if self.flags & FLAG_SIGNAL != 0 || opt.need_state {
            let (info, state) = parse_output(self.output.bytes(), p, opt.need_state)?;
            out.info = info;
            out.state = state.map(|mut r| {
                r.fs = self
                    .cmds
                    .get(root_dir)
                    .and_then(|s| s.as_ref())
                    .map(|s| s.dir().to_string_lossy().into_owned())
                    .unwrap_or_default();
                r
            });
        }
        Ok(out)
    }

    fn discard(&mut self, root_dir: &str) {
        if let Some(slot) = self.cmds.get_mut(root_dir) {
            if let Some(session) = slot.take() {
                session.close(true);
            }
        }
    }

    pub fn close(self) -> io::Result<()> {
        self.close_inner(true)
    }

    /// Closes everything but keeps the session working directories.
    pub fn close_without_rm(self) -> io::Result<()> {
        self.close_inner(false)
    }

    fn close_inner(mut self, remove_dirs: bool) -> io::Result<()> {
        for (_, slot) in self.cmds.drain() {
            if let Some(session) = slot {
                session.close(remove_dirs);
            }
        }
        let r1 = self.input.close();
        let r2 = self.output.close();
        r1.and(r2)
    }
}

/// Parses the output region: `ncmd`, a reserved state-offset word, `ncmd`
/// six-word records each followed by its signal and cover words, then the
/// packed state iff requested. Every read is bounds-checked; any
/// violation aborts with the offending record and call index.
fn parse_output(
    mut out: &[u8],
    p: &Prog,
    need_state: bool,
) -> Result<(Vec<CallInfo>, Option<ExecResult>), ExecError> {
    let ncmd = read_u32(&mut out)
        .ok_or_else(|| parse_err("failed to read record count".to_string()))?;
    let _state_offset = read_u32(&mut out)
        .ok_or_else(|| parse_err("failed to read state offset".to_string()))?;

    let mut info = vec![CallInfo::default(); p.len()];
    let mut seen = vec![false; p.len()];
    let mut res = Vec::new();
    let mut errnos = Vec::new();

    for i in 0..ncmd {
        let mut word = |what: &str| {
            read_u32(&mut out)
                .ok_or_else(|| parse_err(format!("record {}: failed to read {}", i, what)))
        };
        let call_index = word("call index")? as usize;
        let call_num = word("call num")?;
        let res_val = word("res")?;
        let errno = word("errno")?;
        let signal_size = word("signal size")? as usize;
        let cover_size = word("cover size")? as usize;

        if call_index >= info.len() {
            return Err(parse_err(format!(
                "record {}: bad call index {}/{}",
                i,
                call_index,
                info.len()
            )));
        }
        let meta = p.calls()[call_index].meta();
        if meta.id() != call_num as u64 {
            return Err(parse_err(format!(
                "record {} call {}: expected syscall {}, got {}",
                i,
                call_index,
                meta.id(),
                call_num
            )));
        }
        if seen[call_index] {
            return Err(parse_err(format!(
                "record {}: duplicate reply for call {}",
                i, call_index
            )));
        }
        seen[call_index] = true;
        info[call_index].errno = errno as i32;
        if need_state {
            res.push(res_val as i32);
            errnos.push(errno as i32);
        }

        info[call_index].signal = read_u32_vec(&mut out, signal_size).ok_or_else(|| {
            parse_err(format!(
                "record {} call {}: signal overflow: {}/{}",
                i,
                call_index,
                signal_size,
                out.len() / 4
            ))
        })?;
        info[call_index].cover = read_u32_vec(&mut out, cover_size).ok_or_else(|| {
            parse_err(format!(
                "record {} call {}: cover overflow: {}/{}",
                i,
                call_index,
                cover_size,
                out.len() / 4
            ))
        })?;
    }

    let state = if need_state {
        let state_size = read_u32(&mut out)
            .ok_or_else(|| parse_err("failed to read state size".to_string()))?
            as usize;
        if state_size.checked_mul(4).map(|b| b > out.len()).unwrap_or(true) {
            return Err(parse_err(format!(
                "state overflow: size={} words, {} bytes left",
                state_size,
                out.len()
            )));
        }
        let mut state_bytes = Vec::with_capacity(state_size * 4);
        for _ in 0..state_size {
            // little-endian packed state text
            state_bytes.extend_from_slice(&out.get_u32_le().to_le_bytes());
        }
        let mut r = ExecResult::with_state("", state_bytes);
        r.res = res;
        r.errnos = errnos;
        Some(r)
    } else {
        None
    };

    Ok((info, state))
}

fn parse_err(msg: String) -> ExecError {
    ExecError::OutputParse(msg)
}

fn read_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.remaining() >= 4 {
        Some(buf.get_u32_le())
    } else {
        None
    }
}

fn read_u32_vec(buf: &mut &[u8], len: usize) -> Option<Vec<u32>> {
    if len.checked_mul(4)? > buf.len() {
        return None;
    }
    Some((0..len).map(|_| buf.get_u32_le()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsdiff_core::prog::{Call, Syscall};
    use std::fs::{self, Permissions};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn prog_of(calls: &[(&str, u64)]) -> Prog {
        Prog::new(
            calls
                .iter()
                .map(|(n, id)| Call::new(Arc::new(Syscall::new(*id, *n))))
                .collect(),
        )
    }

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn parse_round_trip_with_state() {
        let p = prog_of(&[("open", 2), ("write", 1)]);
        // two records, one signal word each, then a 2-word state
        let mut buf = words(&[
            2, 0, // ncmd, state offset
            0, 2, 3, 0, 1, 0, // call 0: res=3 errno=0, one signal word
            7, // signal of call 0
            1, 1, u32::MAX, 2, 0, 0, // call 1: res=-1 errno=2
            2, // state size in words
        ]);
        buf.extend_from_slice(b"a,1,0b,2,"); // 8 bytes of state text + ignored tail
        let (info, state) = parse_output(&buf, &p, true).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].signal, vec![7]);
        assert_eq!(info[0].errno, 0);
        assert_eq!(info[1].errno, 2);
        let state = state.unwrap();
        assert_eq!(state.res, vec![3, -1]);
        assert_eq!(state.errnos, vec![0, 2]);
        assert_eq!(&state.state, b"a,1,0b,2");
    }

    #[test]
    fn parse_rejects_bad_call_index() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[1, 0, 5, 2, 0, 0, 0, 0]);
        let err = parse_output(&buf, &p, false).unwrap_err();
        assert!(err.to_string().contains("bad call index"));
    }

    #[test]
    fn parse_rejects_wrong_syscall_id() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[1, 0, 0, 9, 0, 0, 0, 0]);
        let err = parse_output(&buf, &p, false).unwrap_err();
        assert!(err.to_string().contains("expected syscall"));
    }

    #[test]
    fn parse_rejects_duplicate_reply() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[2, 0, 0, 2, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0]);
        let err = parse_output(&buf, &p, false).unwrap_err();
        assert!(err.to_string().contains("duplicate reply"));
    }

    #[test]
    fn parse_rejects_signal_overflow() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[1, 0, 0, 2, 0, 0, 100, 0]);
        let err = parse_output(&buf, &p, false).unwrap_err();
        assert!(err.to_string().contains("signal overflow"));
    }

    #[test]
    fn parse_accepts_exactly_full_region() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[1, 0, 0, 2, 0, 0, 1, 0, 0xdead]);
        let (info, _) = parse_output(&buf, &p, false).unwrap();
        assert_eq!(info[0].signal, vec![0xdead]);
    }

    #[test]
    fn parse_empty_state_has_well_defined_hash() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[0, 0, 0]); // no records, state size 0
        let (_, state) = parse_output(&buf, &p, true).unwrap();
        let state = state.unwrap();
        assert!(state.state.is_empty());
        assert_eq!(
            state.state_hash.to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn parse_rejects_state_overflow() {
        let p = prog_of(&[("open", 2)]);
        let buf = words(&[0, 0, 9]);
        let err = parse_output(&buf, &p, true).unwrap_err();
        assert!(err.to_string().contains("state overflow"));
    }

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-executor.sh");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        drop(f);
        fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn retry_rebuilds_session_invisibly() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        // first session asks for a retry, its replacement serves forever
        let bin = write_script(
            scratch.path(),
            r#"
printf R >&6
while :; do
  dd bs=1 count=1 <&5 >/dev/null 2>&1 || exit 1
  if [ -e ../retry_marker ]; then
    printf '\000' >&6
  else
    : > ../retry_marker
    printf '\105' >&6
    exit 0
  fi
done
"#,
        );
        let mut env = Env::make(EnvConfig {
            bin,
            timeout: Duration::from_secs(10),
            flags: 0,
            pid: 0,
            debug_file: None,
        })
        .unwrap();
        let root_dir = root.path().to_str().unwrap();

        let out = env.exec(None, &ExecOpt::default(), root_dir).unwrap();
        assert!(!out.failed && !out.hanged);
        assert_eq!(env.stats().restarts.load(Ordering::Relaxed), 0);

        let out = env.exec(None, &ExecOpt::default(), root_dir).unwrap();
        assert!(!out.failed && !out.hanged);
        assert_eq!(env.stats().restarts.load(Ordering::Relaxed), 1);
        assert_eq!(env.stats().execs.load(Ordering::Relaxed), 2);
        env.close().unwrap();
    }

    #[test]
    fn header_carries_flags_and_pid() {
        let scratch = tempfile::tempdir().unwrap();
        let bin = write_script(scratch.path(), "printf R >&6\nsleep 1\n");
        let env = Env::make(EnvConfig {
            bin,
            timeout: Duration::from_secs(10),
            flags: 0x2a,
            pid: 7,
            debug_file: None,
        })
        .unwrap();
        let header = env.input.bytes();
        assert_eq!(u64::from_le_bytes(header[..8].try_into().unwrap()), 0x2a);
        assert_eq!(u64::from_le_bytes(header[8..16].try_into().unwrap()), 7);
        env.close().unwrap();
    }
}
