//! Long-lived executor session, one per filesystem root.
//!
//! A session owns a child executor process rooted in a fresh
//! world-writable subdirectory of its filesystem root. The child inherits
//! the two arena files and the control pipe ends at fixed fd slots,
//! handshakes once on startup, and then serves one execution per flag
//! byte written to the control-out pipe.

use crate::{EnvFlags, ExecOpt, FLAG_DEBUG};
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::{kill, Signal::SIGKILL};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use os_pipe::{PipeReader, PipeWriter};
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Magic status bytes written by the executor, doubling as exit codes.
pub const STATUS_FAIL: i32 = 67;
pub const STATUS_ERROR: i32 = 68;
pub const STATUS_RETRY: i32 = 69;

/// First inherited fd slot: input region, output region, control-out
/// read end, control-in write end, in that order.
const EXEC_FD_BASE: i32 = 3;
// Inherited fds are first shifted into a scratch range so the dup2 into
// the final slots never clobbers a source fd.
const SCRATCH_FD_BASE: i32 = 50;

const SERVE_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_BUF_SIZE: usize = 128 << 10;

static TIMER: Lazy<timer::Timer> = Lazy::new(timer::Timer::new);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("executor failed: {0}")]
    ExecutorFailure(String),
    #[error("executor is not serving: {0}")]
    NotServing(String),
    #[error("executor did not answer (status {status}): {output}")]
    NoAnswer {
        status: i32,
        hanged: bool,
        output: String,
    },
}

impl SessionError {
    pub fn hanged(&self) -> bool {
        matches!(self, SessionError::NoAnswer { hanged: true, .. })
    }
}

/// Outcome of one served execution.
#[derive(Debug, Default)]
pub struct SessionRun {
    pub output: Vec<u8>,
    /// Executor detected a kernel bug in the target (status 68).
    pub failed: bool,
    /// The execution timed out and the child was killed.
    pub hanged: bool,
    /// Transient condition (status 69); discard the session silently.
    pub restart: bool,
}

pub struct Session {
    timeout: Duration,
    child: Child,
    dir: PathBuf,
    ctrl_in: PipeReader,
    ctrl_out: PipeWriter,
    read_done: Option<Receiver<Vec<u8>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timeout", &self.timeout)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn spawn(
        bin: &[String],
        timeout: Duration,
        flags: EnvFlags,
        in_file: &File,
        out_file: &File,
        root_dir: &Path,
        debug_file: Option<&File>,
    ) -> Result<Session, SessionError> {
        let dir = tempfile::Builder::new()
            .prefix("fsdiff-testdir-")
            .tempdir_in(root_dir)?
            .into_path();
        match Self::spawn_in(bin, timeout, flags, in_file, out_file, &dir, debug_file) {
            Ok(session) => Ok(session),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    fn spawn_in(
        bin: &[String],
        timeout: Duration,
        flags: EnvFlags,
        in_file: &File,
        out_file: &File,
        dir: &Path,
        debug_file: Option<&File>,
    ) -> Result<Session, SessionError> {
        fs::set_permissions(dir, Permissions::from_mode(0o777))?;

        // Output capture pipe.
        let (out_rp, out_wp) = os_pipe::pipe()?;
        // Control-in pipe: handshake and status bytes, child to us.
        let (in_rp, in_wp) = os_pipe::pipe()?;
        // Control-out pipe: per-exec flag byte, us to child.
        let (ctl_rp, ctl_wp) = os_pipe::pipe()?;

        let mut cmd = Command::new(&bin[0]);
        cmd.args(&bin[1..]).env_clear().current_dir(dir);

        let mut read_done = None;
        match debug_file {
            Some(f) if flags & FLAG_DEBUG != 0 => {
                cmd.stdout(f.try_clone()?);
                cmd.stderr(f.try_clone()?);
            }
            _ => {
                cmd.stdout(out_wp.try_clone()?);
                cmd.stderr(out_wp);
                read_done = Some(drain_background(out_rp));
            }
        }

        let inherit = [
            in_file.as_raw_fd(),
            out_file.as_raw_fd(),
            ctl_rp.as_raw_fd(),
            in_wp.as_raw_fd(),
        ];
        unsafe {
            cmd.pre_exec(move || {
                for (i, &fd) in inherit.iter().enumerate() {
                    if libc::dup2(fd, SCRATCH_FD_BASE + i as i32) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                for i in 0..inherit.len() as i32 {
                    if libc::dup2(SCRATCH_FD_BASE + i, EXEC_FD_BASE + i) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    libc::close(SCRATCH_FD_BASE + i);
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        drop(ctl_rp);
        drop(in_wp);

        let mut session = Session {
            timeout,
            child,
            dir: dir.to_path_buf(),
            ctrl_in: in_rp,
            ctrl_out: ctl_wp,
            read_done,
        };
        session.wait_serving()?;
        Ok(session)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Waits for the executor to signal readiness; sandbox setup can take
    /// significant time.
    fn wait_serving(&mut self) -> Result<(), SessionError> {
        let mut rp = self.ctrl_in.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 1];
            let _ = tx.send(rp.read_exact(&mut buf));
        });
        match rx.recv_timeout(SERVE_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            res => {
                self.kill();
                let output = self.drain_output();
                let exit = self.child.wait().ok();
                let cause = match res {
                    Ok(Err(e)) => e.to_string(),
                    _ => "handshake timeout".to_string(),
                };
                let text = format!("{}\n{}", cause, String::from_utf8_lossy(&output));
                if exit.and_then(|st| st.code()) == Some(STATUS_FAIL) {
                    return Err(SessionError::ExecutorFailure(text));
                }
                Err(SessionError::NotServing(text))
            }
        }
    }

    /// Serves one execution. On `Err` or a `restart`/`failed` run the
    /// session must be discarded by the caller.
    pub fn exec(&mut self, opt: &ExecOpt) -> Result<SessionRun, SessionError> {
        let mut flag = 0u8;
        if opt.cover {
            flag |= 1 << 0;
            if opt.dedup {
                flag |= 1 << 1;
            }
        }
        if opt.need_state {
            flag |= 1 << 2;
        }
        self.ctrl_out.write_all(&[flag])?;

        let hang = Arc::new(AtomicBool::new(false));
        let hang_set = Arc::clone(&hang);
        let child_pid = Pid::from_raw(self.child.id() as i32);
        let guard = TIMER.schedule_with_delay(
            chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            move || {
                hang_set.store(true, Ordering::SeqCst);
                let _ = kill(child_pid, SIGKILL);
            },
        );

        let mut status_byte = [0u8; 1];
        let read_res = self.ctrl_in.read_exact(&mut status_byte);
        drop(guard);
        if read_res.is_ok() && status_byte[0] == 0 {
            return Ok(SessionRun::default());
        }

        // The executor writes magic status bytes before exiting, so kill
        // and join it either way.
        let mut status = match read_res {
            Ok(()) => status_byte[0] as i32,
            Err(_) => 0,
        };
        self.kill();
        let mut output = self.drain_output();
        let exit = self.child.wait().ok();
        let mut hanged = false;
        if hang.load(Ordering::SeqCst) && !exit.map(|st| st.success()).unwrap_or(false) {
            hanged = true;
            output.extend_from_slice(format!("killed on timeout: {}\n", exit_text(exit)).as_bytes());
        }
        if !matches!(status, STATUS_FAIL | STATUS_ERROR | STATUS_RETRY) {
            if let Some(code) = exit.and_then(|st| st.code()) {
                status = code;
            }
        }
        match status {
            STATUS_FAIL => Err(SessionError::ExecutorFailure(
                String::from_utf8_lossy(&output).into_owned(),
            )),
            STATUS_ERROR => Ok(SessionRun {
                output,
                failed: true,
                hanged,
                restart: false,
            }),
            // Transient condition (e.g. out of memory, disrupted executor
            // loop); pretend nothing happened and rebuild the session.
            STATUS_RETRY => Ok(SessionRun {
                output,
                failed: false,
                hanged: false,
                restart: true,
            }),
            _ => Err(SessionError::NoAnswer {
                status,
                hanged,
                output: String::from_utf8_lossy(&output).into_owned(),
            }),
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
    }

    fn drain_output(&mut self) -> Vec<u8> {
        match self.read_done.take() {
            Some(rx) => rx.recv().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Joins the child and tears down the session directory. `remove_dir`
    /// is false when working directories are kept for inspection.
    pub fn close(self, remove_dir: bool) {
        let dir = self.dir.clone();
        drop(self);
        if remove_dir {
            umount_all(&dir);
            let _ = fs::remove_dir_all(&dir);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn exit_text(exit: Option<ExitStatus>) -> String {
    match exit {
        Some(st) => st.to_string(),
        None => "unknown exit status".to_string(),
    }
}

/// Keeps reading child output so a chatty executor never blocks, holding
/// on to roughly the most recent 128 KiB.
fn drain_background(mut rp: PipeReader) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = vec![0u8; OUTPUT_BUF_SIZE];
        let mut size = 0;
        loop {
            match rp.read(&mut buf[size..]) {
                Ok(n) if n > 0 => {
                    size += n;
                    if size >= OUTPUT_BUF_SIZE * 3 / 4 {
                        buf.copy_within(size - OUTPUT_BUF_SIZE / 2..size, 0);
                        size = OUTPUT_BUF_SIZE / 2;
                    }
                }
                _ => {
                    buf.truncate(size);
                    let _ = tx.send(buf);
                    return;
                }
            }
        }
    });
    rx
}

/// Unmounts everything below `dir`, deepest mount point first.
fn umount_all(dir: &Path) {
    let mounts = match fs::read_to_string("/proc/self/mounts") {
        Ok(m) => m,
        Err(_) => return,
    };
    let mut points: Vec<&str> = mounts
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter(|m| Path::new(m).starts_with(dir))
        .collect();
    points.sort_by_key(|m| std::cmp::Reverse(m.len()));
    for point in points {
        let _ = umount2(point, MntFlags::MNT_FORCE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &Path, body: &str) -> Vec<String> {
        let path = dir.join("fake-executor.sh");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        drop(f);
        fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        vec![path.to_str().unwrap().to_string()]
    }

    fn arenas() -> (File, File) {
        (tempfile::tempfile().unwrap(), tempfile::tempfile().unwrap())
    }

    const SERVE_LOOP: &str = r#"
printf R >&6
while :; do
  dd bs=1 count=1 <&5 >/dev/null 2>&1 || exit 1
  printf '\000' >&6
done
"#;

    #[test]
    fn handshake_and_serve() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(scratch.path(), SERVE_LOOP);
        let (in_f, out_f) = arenas();
        let mut session = Session::spawn(
            &bin,
            Duration::from_secs(10),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap();
        for _ in 0..3 {
            let run = session.exec(&ExecOpt::default()).unwrap();
            assert!(!run.failed && !run.hanged && !run.restart);
        }
        let dir = session.dir().to_path_buf();
        assert!(dir.exists());
        session.close(true);
        assert!(!dir.exists());
    }

    #[test]
    fn retry_status_requests_restart() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        // 0105 octal == 69, the retry status
        let bin = write_script(
            scratch.path(),
            r#"
printf R >&6
dd bs=1 count=1 <&5 >/dev/null 2>&1
printf '\105' >&6
exit 69
"#,
        );
        let (in_f, out_f) = arenas();
        let mut session = Session::spawn(
            &bin,
            Duration::from_secs(10),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap();
        let run = session.exec(&ExecOpt::default()).unwrap();
        assert!(run.restart);
        assert!(!run.failed && !run.hanged);
        session.close(true);
    }

    #[test]
    fn hang_is_killed_and_reported() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(
            scratch.path(),
            r#"
printf R >&6
dd bs=1 count=1 <&5 >/dev/null 2>&1
sleep 60 >/dev/null 2>&1 5<&- 6>&-
"#,
        );
        let (in_f, out_f) = arenas();
        let mut session = Session::spawn(
            &bin,
            Duration::from_millis(300),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap();
        let err = session.exec(&ExecOpt::default()).unwrap_err();
        assert!(err.hanged(), "unexpected error: {}", err);
        session.close(true);
    }

    #[test]
    fn kernel_bug_status_marks_failed() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        // 0104 octal == 68, the kernel-bug status
        let bin = write_script(
            scratch.path(),
            r#"
printf R >&6
dd bs=1 count=1 <&5 >/dev/null 2>&1
printf '\104' >&6
exit 68
"#,
        );
        let (in_f, out_f) = arenas();
        let mut session = Session::spawn(
            &bin,
            Duration::from_secs(10),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap();
        let run = session.exec(&ExecOpt::default()).unwrap();
        assert!(run.failed);
        assert!(!run.restart);
        session.close(true);
    }

    #[test]
    fn missing_handshake_is_not_serving() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(scratch.path(), "exit 1\n");
        let (in_f, out_f) = arenas();
        let err = Session::spawn(
            &bin,
            Duration::from_secs(10),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::NotServing(_)));
    }

    #[test]
    fn session_dir_is_world_writable() {
        let scratch = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(scratch.path(), SERVE_LOOP);
        let (in_f, out_f) = arenas();
        let session = Session::spawn(
            &bin,
            Duration::from_secs(10),
            0,
            &in_f,
            &out_f,
            root.path(),
            None,
        )
        .unwrap();
        let mode = fs::metadata(session.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        session.close(true);
    }
}
