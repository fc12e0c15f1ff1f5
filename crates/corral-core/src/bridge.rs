//! Terminal bridge: pumps bytes between a remote channel and a shell's pty.
//!
//! ```text
//!  remote input ──► input pump ──(blocking write)──► pty writer ──► shell
//!  remote sink  ◄── output pump ◄──(reader thread)── pty reader ◄── shell
//! ```
//!
//! Whichever side finishes first triggers [`TerminalBridge::close`]. Close is
//! guarded by a compare-and-swap latch and runs exactly once: it closes the
//! remote channel, releases the pty, sends the shell `SIGHUP`, then reaps it
//! (killing it if it outlives the grace period).

use crate::codec::WindowSize;
use crate::dispatch::WindowSizer;
use crate::error::{CoreError, Result};
use crate::pty::{PtyMaster, PtyProcess, ShellChild, ShellExit};
use crate::transport::ChannelSink;
use bytes::Bytes;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::Instrument;

/// Default time a shell gets to exit after hang-up before it is killed.
pub const DEFAULT_SHELL_EXIT_GRACE: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 4096;
const OUTPUT_QUEUE: usize = 32;
const REAP_POLL: Duration = Duration::from_millis(20);

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The remote side closed its channel.
    RemoteClosed,
    /// The shell exited (its pty output ended).
    ShellExited,
    /// Writing to the remote channel failed.
    OutputFailed,
    /// Writing to the pty failed.
    InputFailed,
    /// Explicitly requested by the owner.
    Shutdown,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RemoteClosed => "remote closed",
            Self::ShellExited => "shell exited",
            Self::OutputFailed => "channel write failed",
            Self::InputFailed => "pty write failed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Close a channel whose session never got a shell.
///
/// There is no pty or process to release; only the channel is closed.
pub async fn close_unstarted(sink: &dyn ChannelSink, err: &CoreError) {
    tracing::error!(error = %err, "Session setup failed");
    sink.close().await;
}

/// A running pty bridge. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct TerminalBridge {
    shared: Arc<Shared>,
}

struct Shared {
    sink: Arc<dyn ChannelSink>,
    master: Mutex<Option<Box<dyn PtyMaster>>>,
    child: Mutex<Option<Box<dyn ShellChild>>>,
    latch: AtomicBool,
    stop_input: Notify,
    closed: watch::Sender<bool>,
    grace: Duration,
}

impl TerminalBridge {
    /// Take ownership of `process` and start pumping.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PtyStartFailed`] if the reader thread cannot be
    /// started. The shell is reaped and the channel closed before returning.
    pub async fn start(
        process: PtyProcess,
        input: mpsc::Receiver<Bytes>,
        sink: Arc<dyn ChannelSink>,
        grace: Duration,
    ) -> Result<Self> {
        let PtyProcess {
            master,
            reader,
            writer,
            child,
        } = process;

        let (closed, _) = watch::channel(false);
        let bridge = Self {
            shared: Arc::new(Shared {
                sink,
                master: Mutex::new(Some(master)),
                child: Mutex::new(Some(child)),
                latch: AtomicBool::new(false),
                stop_input: Notify::new(),
                closed,
                grace,
            }),
        };

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        if let Err(e) = spawn_reader(reader, out_tx) {
            drop(writer);
            bridge.close(CloseCause::Shutdown).await;
            return Err(CoreError::PtyStartFailed(format!("spawn reader thread: {e}")));
        }

        let span = tracing::Span::current();
        tokio::spawn(pump_output(bridge.clone(), out_rx).instrument(span.clone()));
        tokio::spawn(pump_input(bridge.clone(), input, writer).instrument(span));
        Ok(bridge)
    }

    /// Tear the session down. Only the first call has any effect.
    pub async fn close(&self, cause: CloseCause) {
        let shared = &self.shared;
        if shared
            .latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!(%cause, "Closing session");

        shared.stop_input.notify_one();
        shared.sink.close().await;

        // The reader thread keeps its own handle on the master, so releasing
        // ours does not hang the terminal up; `reap` signals the shell.
        drop(lock(&shared.master).take());

        let child = lock(&shared.child).take();
        if let Some(child) = child {
            let grace = shared.grace;
            match tokio::task::spawn_blocking(move || reap(child, grace)).await {
                Ok(Ok(exit)) if exit.success() => tracing::debug!("Shell exited cleanly"),
                Ok(Ok(exit)) => tracing::info!(code = exit.code, "Shell exited with error"),
                Ok(Err(e)) => tracing::error!(error = %CoreError::ShellWait(e), "Could not reap shell"),
                Err(e) => tracing::error!(error = %e, "Reaper task failed"),
            }
        }

        shared.closed.send_replace(true);
    }

    /// Whether close has been initiated.
    pub fn is_closing(&self) -> bool {
        self.shared.latch.load(Ordering::Acquire)
    }

    /// Wait until close has completed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        // The sender lives in `shared`, so this cannot fail while we hold it.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl WindowSizer for TerminalBridge {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        match lock(&self.shared.master).as_ref() {
            Some(master) => master.resize(size),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pty already released",
            )),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hang the shell up and wait for it, killing it once `grace` has elapsed.
fn reap(mut child: Box<dyn ShellChild>, grace: Duration) -> io::Result<ShellExit> {
    if let Err(e) = child.hangup() {
        tracing::debug!(error = %e, "Hang-up failed");
    }
    let deadline = Instant::now() + grace;
    loop {
        if let Some(exit) = child.try_wait()? {
            return Ok(exit);
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(REAP_POLL);
    }
    tracing::warn!(grace_ms = grace.as_millis() as u64, "Shell ignored hang-up, killing");
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "Kill failed");
    }
    child.wait()
}

/// Blocking pty reads on a dedicated thread, forwarded into `tx`.
///
/// A plain thread instead of the blocking pool: a read can outlive the
/// runtime when the shell never closes its terminal.
fn spawn_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("corral-pty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // Linux reports a hung-up pty as EIO.
                    Err(e) => {
                        tracing::debug!(error = %e, "Pty read ended");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

async fn pump_output(bridge: TerminalBridge, mut output: mpsc::Receiver<Bytes>) {
    while let Some(data) = output.recv().await {
        if let Err(e) = bridge.shared.sink.send(data).await {
            if !bridge.is_closing() {
                tracing::warn!(error = %e, "Failed to write to channel");
            }
            bridge.close(CloseCause::OutputFailed).await;
            return;
        }
    }
    bridge.close(CloseCause::ShellExited).await;
}

async fn pump_input(
    bridge: TerminalBridge,
    mut input: mpsc::Receiver<Bytes>,
    mut writer: Box<dyn Write + Send>,
) {
    loop {
        tokio::select! {
            _ = bridge.shared.stop_input.notified() => break,
            chunk = input.recv() => match chunk {
                Some(data) => {
                    let written = tokio::task::spawn_blocking(move || {
                        let result = writer.write_all(&data).and_then(|()| writer.flush());
                        (writer, result)
                    })
                    .await;
                    match written {
                        Ok((w, Ok(()))) => writer = w,
                        Ok((_, Err(e))) => {
                            tracing::warn!(error = %e, "Failed to write to pty");
                            bridge.close(CloseCause::InputFailed).await;
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Pty writer task failed");
                            bridge.close(CloseCause::InputFailed).await;
                            return;
                        }
                    }
                }
                None => {
                    // Releasing the writer delivers EOF to the shell.
                    drop(writer);
                    bridge.close(CloseCause::RemoteClosed).await;
                    return;
                }
            },
        }
    }
}
