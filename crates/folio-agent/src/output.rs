//! Capture of standard output/error during evaluation.
//!
//! The agent swaps the process's stdout and stderr descriptors for pipes
//! while a cell runs; reader threads tag every written segment with the
//! owning cell id and forward it on the event channel. Restoration is an
//! RAII postcondition: dropping the guard always puts the original
//! descriptors back, even when evaluation fails or unwinds.
//!
//! The protocol stream is unaffected because the agent duplicates its
//! stdio descriptors at startup (see [`take_protocol_stdio`]) before any
//! capture can occur.

use std::io::Write;
use std::sync::Arc;

use folio_core::evaluating::{CapturedOutputSegment, OutputStream};
use folio_core::graph::CellId;
use folio_core::ipc::{AgentEvent, AgentEventSink};

/// Duplicate the process's stdin/stdout for exclusive protocol use, then
/// point fd 1 at stderr so stray writes outside a capture window land in
/// the log instead of corrupting protocol frames.
#[cfg(unix)]
pub fn take_protocol_stdio() -> std::io::Result<(std::fs::File, std::fs::File)> {
    use std::os::fd::FromRawFd;

    let stdin_fd = unsafe { libc::dup(libc::STDIN_FILENO) };
    if stdin_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let stdout_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if stdout_fd < 0 {
        unsafe { libc::close(stdin_fd) };
        return Err(std::io::Error::last_os_error());
    }

    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        unsafe {
            libc::close(stdin_fd);
            libc::close(stdout_fd);
        }
        return Err(std::io::Error::last_os_error());
    }

    // Safety: the descriptors were just duplicated and are owned here.
    unsafe {
        Ok((
            std::fs::File::from_raw_fd(stdin_fd),
            std::fs::File::from_raw_fd(stdout_fd),
        ))
    }
}

/// Installed capture state for one evaluation.
pub struct CaptureGuard {
    #[cfg(unix)]
    inner: Option<unix_capture::CaptureInner>,
}

impl CaptureGuard {
    /// A guard that captures nothing, used when capture is disabled or
    /// unsupported on the platform.
    pub fn disabled() -> Self {
        Self {
            #[cfg(unix)]
            inner: None,
        }
    }

    /// Swap stdout/stderr for tagged capture pipes.
    #[cfg(unix)]
    pub fn install(cell_id: CellId, sink: Arc<dyn AgentEventSink>) -> std::io::Result<Self> {
        Ok(Self {
            inner: Some(unix_capture::CaptureInner::install(cell_id, sink)?),
        })
    }

    #[cfg(not(unix))]
    pub fn install(_cell_id: CellId, _sink: Arc<dyn AgentEventSink>) -> std::io::Result<Self> {
        tracing::warn!("output capture is not supported on this platform");
        Ok(Self::disabled())
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(inner) = self.inner.take() {
            inner.restore();
        }
    }
}

/// Flush the Rust-level buffered handles so pending writes reach the
/// current descriptors before they are swapped.
#[cfg(unix)]
fn flush_std_handles() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

#[cfg(unix)]
mod unix_capture {
    use super::*;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::thread::JoinHandle;

    pub(super) struct CaptureInner {
        saved_stdout: libc::c_int,
        saved_stderr: libc::c_int,
        readers: Vec<JoinHandle<()>>,
    }

    fn make_pipe() -> std::io::Result<(libc::c_int, libc::c_int)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((fds[0], fds[1]))
    }

    fn spawn_reader(
        read_fd: libc::c_int,
        cell_id: CellId,
        stream: OutputStream,
        sink: Arc<dyn AgentEventSink>,
    ) -> JoinHandle<()> {
        // Safety: the read end was just created and is owned by the thread.
        let mut reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let value = String::from_utf8_lossy(&buf[..n]).to_string();
                        sink.on_event(AgentEvent::Output(CapturedOutputSegment {
                            cell_id,
                            stream,
                            value,
                        }));
                    }
                }
            }
        })
    }

    impl CaptureInner {
        pub(super) fn install(
            cell_id: CellId,
            sink: Arc<dyn AgentEventSink>,
        ) -> std::io::Result<Self> {
            flush_std_handles();

            let saved_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
            let saved_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };
            if saved_stdout < 0 || saved_stderr < 0 {
                return Err(std::io::Error::last_os_error());
            }

            let mut readers = Vec::with_capacity(2);
            for (target_fd, stream) in [
                (libc::STDOUT_FILENO, OutputStream::Stdout),
                (libc::STDERR_FILENO, OutputStream::Stderr),
            ] {
                let (read_fd, write_fd) = make_pipe()?;
                if unsafe { libc::dup2(write_fd, target_fd) } < 0 {
                    let err = std::io::Error::last_os_error();
                    unsafe {
                        libc::close(read_fd);
                        libc::close(write_fd);
                    }
                    return Err(err);
                }
                unsafe { libc::close(write_fd) };
                readers.push(spawn_reader(read_fd, cell_id, stream, sink.clone()));
            }

            Ok(Self {
                saved_stdout,
                saved_stderr,
                readers,
            })
        }

        pub(super) fn restore(self) {
            flush_std_handles();

            // Putting the saved descriptors back closes the pipes' last
            // write ends; the readers see EOF and drain.
            unsafe {
                libc::dup2(self.saved_stdout, libc::STDOUT_FILENO);
                libc::dup2(self.saved_stderr, libc::STDERR_FILENO);
                libc::close(self.saved_stdout);
                libc::close(self.saved_stderr);
            }

            for reader in self.readers {
                let _ = reader.join();
            }
        }
    }
}
