//! Crash records: an immutable snapshot of everything needed to look at a
//! crash later — the signal, the exact target invocation, the input, the
//! trace that was captured before the child died, and the explored graph at
//! that moment.
//!
//! Same file framing as checkpoints (magic, version, endianness byte, speedy
//! body in native byte order).

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use speedy::{Endianness, Readable, Writable};

use crate::error::Error;
use crate::graph::GraphSnapshot;

const MAGIC: [u8; 4] = *b"TPCR";
const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub(crate) struct CrashReport {
    pub little_endian: bool,
    pub signal: i32,
    /// Target program invocation: the tracer argument vector from `--` on.
    pub target_args: Vec<String>,
    pub input: Vec<u8>,
    /// Possibly empty if the target died before reaching app code.
    pub trace: Vec<u32>,
    pub graph: GraphSnapshot,
}

impl CrashReport {
    /// Write the report into `dir`, named after the thread, the signal and
    /// the input hash so repeated crashes don't collide.
    pub(crate) fn save(&self, dir: &Path, thread_id: u32) -> Result<PathBuf, Error> {
        let filename = format!(
            "crash_t{thread_id}_sig{}_{:x}.crash",
            self.signal,
            md5::compute(&self.input)
        );
        let path = dir.join(filename);

        let mut bytes = Vec::with_capacity(1024);
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.push(u8::from(cfg!(target_endian = "little")));
        bytes.extend_from_slice(&self.write_to_vec_with_ctx(Endianness::NATIVE)?);
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }

    pub(crate) fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 6 {
            return Err(Error::Corrupt("crash file is truncated".to_owned()));
        }
        if bytes[..4] != MAGIC {
            return Err(Error::Corrupt("not a crash record".to_owned()));
        }
        if bytes[4] != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported crash record version {}",
                bytes[4]
            )));
        }
        if bytes[5] != u8::from(cfg!(target_endian = "little")) {
            return Err(Error::Corrupt(
                "crash record was written on a host with different endianness".to_owned(),
            ));
        }
        Ok(Self::read_from_buffer_with_ctx(
            Endianness::NATIVE,
            &bytes[6..],
        )?)
    }
}

/// The signal that terminated the child, if it died from one. A normal exit
/// (any status code) is not a crash.
pub(crate) fn crash_signal(status: &WaitStatus) -> Option<Signal> {
    match status {
        WaitStatus::Signaled(_, signal, _) => Some(*signal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExploredGraph, GraphParams};
    use nix::unistd::Pid;

    #[test]
    fn signaled_status_is_a_crash() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            crash_signal(&WaitStatus::Signaled(pid, Signal::SIGSEGV, false)),
            Some(Signal::SIGSEGV)
        );
        assert_eq!(crash_signal(&WaitStatus::Exited(pid, 0)), None);
        assert_eq!(crash_signal(&WaitStatus::Exited(pid, 1)), None);
    }

    #[test]
    fn report_roundtrips_through_disk() {
        let graph = ExploredGraph::new(GraphParams::default());
        graph.update_from_trace(&[0x40, 0x80]);
        let report = CrashReport {
            little_endian: cfg!(target_endian = "little"),
            signal: Signal::SIGSEGV as i32,
            target_args: vec!["./target-bin".to_owned()],
            input: vec![0xde, 0xad],
            trace: vec![0x40, 0x80],
            graph: graph.snapshot(),
        };

        let dir = std::env::temp_dir();
        let path = report.save(&dir, 3).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("crash_t3_sig11_"));
        let restored = CrashReport::load(&path).unwrap();
        assert_eq!(restored, report);
        std::fs::remove_file(&path).unwrap();
    }
}
