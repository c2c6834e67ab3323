//! Human-readable reproduction reports.

use fsdiff_core::diff::{fs_short, ExecResult};
use fsdiff_core::prog::Prog;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub struct ReportWriter<W: Write> {
    w: W,
}

impl ReportWriter<File> {
    pub fn create(path: &Path) -> io::Result<ReportWriter<File>> {
        Ok(ReportWriter {
            w: File::create(path)?,
        })
    }
}

impl<W: Write> ReportWriter<W> {
    pub fn new(w: W) -> ReportWriter<W> {
        ReportWriter { w }
    }

    pub fn header(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.w, "ReproDiff: {}", name)?;
        writeln!(self.w, "=====================================")
    }

    pub fn prog(&mut self, p: &Prog) -> io::Result<()> {
        writeln!(self.w, "## Prog: {}", p)?;
        self.w.write_all(&p.serialize())?;
        writeln!(self.w)
    }

    pub fn states(&mut self, rs: &[ExecResult]) -> io::Result<()> {
        writeln!(self.w, "## State:")?;
        for r in rs {
            writeln!(self.w, "### {}", fs_short(&r.fs))?;
            let state = String::from_utf8_lossy(&r.state);
            writeln!(self.w, "{}", state.trim_end())?;
            writeln!(self.w)?;
        }
        Ok(())
    }

    /// One row per call: the call name followed by `res(errno)` for every
    /// filesystem, `nil(nil)` where an executor stopped early.
    pub fn returns(&mut self, p: &Prog, rs: &[ExecResult]) -> io::Result<()> {
        writeln!(self.w, "## Return values:")?;
        for (i, call) in p.calls().iter().enumerate() {
            write!(self.w, "{} ", call.meta().name())?;
            for r in rs {
                match (r.res.get(i), r.errnos.get(i)) {
                    (Some(res), Some(errno)) => write!(self.w, "{}({}) ", res, errno)?,
                    _ => write!(self.w, "nil(nil) ")?,
                }
            }
            writeln!(self.w)?;
        }
        writeln!(self.w)
    }

    pub fn minimized(&mut self, p: &Prog) -> io::Result<()> {
        writeln!(self.w, "## Minimized Prog: {}", p)?;
        self.w.write_all(&p.serialize())?;
        writeln!(self.w)
    }

    pub fn failure(&mut self, msg: &str) -> io::Result<()> {
        writeln!(self.w, "\nFailed: {}\n", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsdiff_core::prog::{Call, Syscall};
    use std::sync::Arc;

    fn prog_of(calls: &[(&str, u64)]) -> Prog {
        Prog::new(
            calls
                .iter()
                .map(|(n, id)| Call::new(Arc::new(Syscall::new(*id, *n))))
                .collect(),
        )
    }

    #[test]
    fn report_layout() {
        let p = prog_of(&[("open", 2), ("write", 1)]);
        let mut r1 = ExecResult::with_state("/testfs1/d0", b"a,1,0\n".to_vec());
        r1.res = vec![3, 5];
        r1.errnos = vec![0, 0];
        let mut r2 = ExecResult::with_state("/testfs2/d1", b"a,2,0\n".to_vec());
        r2.res = vec![3];
        r2.errnos = vec![0];

        let mut out = Vec::new();
        {
            let mut w = ReportWriter::new(&mut out);
            w.header("prog42").unwrap();
            w.prog(&p).unwrap();
            w.states(&[r1.clone(), r2.clone()]).unwrap();
            w.returns(&p, &[r1, r2]).unwrap();
            w.minimized(&prog_of(&[("write", 1)])).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        let expected = "ReproDiff: prog42\n\
                        =====================================\n\
                        ## Prog: open-write\n\
                        2 open\n\
                        1 write\n\
                        \n\
                        ## State:\n\
                        ### testfs1\n\
                        a,1,0\n\
                        \n\
                        ### testfs2\n\
                        a,2,0\n\
                        \n\
                        ## Return values:\n\
                        open 3(0) 3(0) \n\
                        write 5(0) nil(nil) \n\
                        \n\
                        ## Minimized Prog: write\n\
                        1 write\n";
        assert_eq!(text, expected);
    }
}
