//! Kernel memory-leak scanning via kmemleak.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::thread::sleep;
use std::time::Duration;

const KMEMLEAK: &str = "/sys/kernel/debug/kmemleak";
const REPORT_BUF: usize = 128 << 10;

/// Puts kmemleak into manual-scan mode (or turns it off entirely when
/// leak checking is disabled).
pub fn init(leak: bool) -> io::Result<()> {
    let mut f = match OpenOptions::new().read(true).write(true).open(KMEMLEAK) {
        Ok(f) => f,
        Err(e) if !leak => {
            log::debug!("kmemleak unavailable: {}", e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let what: &[u8] = if leak { b"scan=off" } else { b"off" };
    if let Err(e) = f.write_all(what) {
        // EBUSY means kmemleak is already off
        if e.raw_os_error() != Some(libc::EBUSY) {
            return Err(e);
        }
    }
    Ok(())
}

/// Scans for leaks; kmemleak checksums candidate objects and reports
/// them only when a re-scan agrees, so scan twice with a pause before
/// reading and once more before trusting the report.
pub fn scan(report: bool) -> io::Result<()> {
    let mut f = OpenOptions::new().read(true).write(true).open(KMEMLEAK)?;
    f.write_all(b"scan")?;
    sleep(Duration::from_secs(1));
    f.write_all(b"scan")?;
    if report {
        let mut buf = vec![0u8; REPORT_BUF];
        let n = read_some(&mut f, &mut buf)?;
        if n != 0 {
            sleep(Duration::from_secs(1));
            f.write_all(b"scan")?;
            let n = read_some(&mut f, &mut buf)?;
            if n != 0 {
                log::error!("BUG: memory leak:\n{}", String::from_utf8_lossy(&buf[..n]));
            }
        }
    }
    f.write_all(b"clear")?;
    Ok(())
}

fn read_some(f: &mut std::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    f.seek(SeekFrom::Start(0))?;
    f.read(buf)
}
