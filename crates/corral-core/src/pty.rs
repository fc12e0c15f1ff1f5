//! Pseudo-terminal and shell process collaborator.
//!
//! [`PtySpawner`] starts a [`ShellCommand`] with a pty as its controlling
//! terminal and returns the pieces the terminal bridge takes ownership of.
//! [`NativePty`] is the production implementation on top of `portable-pty`.

use crate::codec::WindowSize;
use crate::engine::ShellCommand;
use crate::error::{CoreError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::sync::Mutex;

/// Exit status of a shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellExit {
    /// Exit code reported by the process.
    pub code: u32,
}

impl ShellExit {
    /// Whether the shell exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Master side of a pty: the part that can change the window size.
pub trait PtyMaster: Send + Sync {
    /// Apply a window size change.
    fn resize(&self, size: WindowSize) -> io::Result<()>;
}

/// Handle to the shell process running on the pty.
pub trait ShellChild: Send {
    /// Check for exit without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ShellExit>>;

    /// Block until the process exits.
    fn wait(&mut self) -> io::Result<ShellExit>;

    /// Tell the process its terminal is gone (`SIGHUP`).
    fn hangup(&mut self) -> io::Result<()>;

    /// Forcefully terminate the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Everything produced by starting a shell on a pty.
pub struct PtyProcess {
    /// Window size control.
    pub master: Box<dyn PtyMaster>,
    /// Output of the shell (blocking reads).
    pub reader: Box<dyn Read + Send>,
    /// Input of the shell (blocking writes).
    pub writer: Box<dyn Write + Send>,
    /// The shell process.
    pub child: Box<dyn ShellChild>,
}

/// Starts shell commands on pseudo-terminals.
pub trait PtySpawner: Send + Sync {
    /// Start `command` on a new pty of the given size.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PtyStartFailed`] if the pty cannot be allocated or
    /// the command cannot be started. No process is left running on error.
    fn spawn(&self, command: &ShellCommand, size: WindowSize) -> Result<PtyProcess>;
}

/// Host pseudo-terminals via `portable-pty`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePty;

impl PtySpawner for NativePty {
    fn spawn(&self, command: &ShellCommand, size: WindowSize) -> Result<PtyProcess> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| pty_error("open pty", e))?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| pty_error("spawn shell", e))?;
        // The child holds its own copy of the slave.
        drop(pair.slave);

        let mut child = NativeChild { child };
        let reader = pair.master.try_clone_reader();
        let writer = pair.master.take_writer();
        let (reader, writer) = match (reader, writer) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(pty_error("attach pty", e));
            }
        };

        Ok(PtyProcess {
            master: Box::new(NativeMaster {
                master: Mutex::new(pair.master),
            }),
            reader,
            writer,
            child: Box::new(child),
        })
    }
}

struct NativeMaster {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyMaster for NativeMaster {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        master
            .resize(pty_size(size))
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

struct NativeChild {
    child: Box<dyn Child + Send + Sync>,
}

impl ShellChild for NativeChild {
    fn try_wait(&mut self) -> io::Result<Option<ShellExit>> {
        Ok(self.child.try_wait()?.map(|status| ShellExit {
            code: status.exit_code(),
        }))
    }

    fn wait(&mut self) -> io::Result<ShellExit> {
        let status = self.child.wait()?;
        Ok(ShellExit {
            code: status.exit_code(),
        })
    }

    fn hangup(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.process_id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
        match signal::kill(Pid::from_raw(pid), Signal::SIGHUP) {
            // Already exited and waiting to be reaped.
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

/// Convert to a `PtySize`, clamping to the kernel's 16-bit fields.
fn pty_size(size: WindowSize) -> PtySize {
    let clamp = |v: u32| v.min(u32::from(u16::MAX)) as u16;
    PtySize {
        rows: clamp(size.rows).max(1),
        cols: clamp(size.cols).max(1),
        pixel_width: clamp(size.pixel_width),
        pixel_height: clamp(size.pixel_height),
    }
}

fn pty_error(action: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::PtyStartFailed(format!("{action}: {err}"))
}
