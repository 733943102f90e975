//! Spawning one traced execution of the target.
//!
//! The child runs the instrumentation driver, which loads the tracer client
//! and hands it `-shm <region>`; the target itself only ever sees its input
//! on stdin. The parent writes the input into a pipe, waits, and then reads
//! the published trace out of the shared region.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execvp, fork, pipe, write, ForkResult, Pid};

use crate::channel::{djb2, TraceChannel};
use crate::crash::crash_signal;
use crate::error::Error;
use crate::knowledge::FuzzExecution;
use crate::settings::Settings;

/// The fixed argument vector a fuzz thread uses to invoke the tracer:
/// `driver -c tracer_lib -shm <region> -- target`.
pub(crate) struct TracerCommand {
    argv: Vec<CString>,
    target_args: Vec<String>,
    stdout_redirect: String,
}

impl TracerCommand {
    pub(crate) fn new(settings: &Settings, region_name: &str) -> Self {
        let args = [
            settings.driver_path.as_str(),
            "-c",
            settings.tracer_lib.as_str(),
            "-shm",
            region_name,
            "--",
            settings.target_program.as_str(),
        ];
        let argv = args
            .iter()
            .map(|arg| CString::new(*arg).expect("nul byte in tracer argument"))
            .collect();
        let target_args = args
            .iter()
            .skip_while(|arg| **arg != "--")
            .skip(1)
            .map(|arg| (*arg).to_owned())
            .collect();
        Self {
            argv,
            target_args,
            stdout_redirect: settings.stdout_redirect.clone(),
        }
    }

    /// The target program invocation (everything after `--`), as stored in
    /// crash records.
    pub(crate) fn target_args(&self) -> &[String] {
        &self.target_args
    }
}

/// Run the target once on `input` and collect its trace from `channel`.
/// Returns the execution (the trace may be empty if the child died before
/// reaching app code) and the terminating signal if the child crashed.
///
/// `current_child` is published for the coordinator so it can SIGKILL a
/// child that a shutdown would otherwise wait on forever.
pub(crate) fn exec_once(
    channel: &TraceChannel,
    command: &TracerCommand,
    input: &[u8],
    current_child: &AtomicI32,
) -> Result<(FuzzExecution, Option<Signal>), Error> {
    assert!(!input.is_empty(), "exec_once: empty input");

    channel.clear();

    // Opened before fork so the child only has to dup2 + exec.
    let redirect = OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .open(&command.stdout_redirect)?;

    let (pipe_read, pipe_write) = pipe()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            // Only async-signal-safe calls from here to exec.
            let _ = dup2(pipe_read.as_raw_fd(), libc::STDIN_FILENO);
            let _ = dup2(redirect.as_raw_fd(), libc::STDOUT_FILENO);
            let _ = dup2(redirect.as_raw_fd(), libc::STDERR_FILENO);
            let _ = execvp(&command.argv[0], &command.argv);
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            current_child.store(child.as_raw(), Ordering::SeqCst);
            drop(pipe_read);
            drop(redirect);

            let write_result = write_all(&pipe_write, input);
            drop(pipe_write);

            let status = loop {
                match waitpid(child, None) {
                    Err(Errno::EINTR) => continue,
                    other => break other?,
                }
            };
            current_child.store(0, Ordering::SeqCst);

            write_result?;

            let execution = FuzzExecution {
                trace: channel.read_trace(),
                input: input.to_vec(),
            };
            // The tracer hashes the bytes the target actually read, which
            // can legitimately differ when the target leaves stdin unread.
            if !execution.trace.is_empty() && channel.input_hash() != djb2(input) {
                log::debug!("target did not consume stdin verbatim");
            }
            Ok((execution, crash_signal(&status)))
        }
    }
}

fn write_all<Fd: std::os::fd::AsFd>(fd: &Fd, input: &[u8]) -> Result<(), Error> {
    let mut written = 0;
    while written < input.len() {
        match write(fd, &input[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    if written != input.len() {
        return Err(Error::ShortPipeWrite {
            written,
            expected: input.len(),
        });
    }
    Ok(())
}

/// SIGKILL the currently running child of a fuzz thread, if any. Used on
/// shutdown to unblock `waitpid`.
pub(crate) fn kill_current_child(current_child: &AtomicI32) {
    let pid = current_child.load(Ordering::SeqCst);
    if pid > 0 {
        let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}
