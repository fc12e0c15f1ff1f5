//! In-memory collaborators for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use corral_core::{
    ChannelSink, ControlRequest, CoreError, LaunchSpec, PtyMaster, PtyProcess, PtySpawner,
    SandboxEngine, SandboxId, SessionChannel, ShellChild, ShellCommand, ShellExit, ShellTarget,
    WindowSize,
};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Engine that records calls instead of starting containers.
///
/// Like a real daemon it keeps a container under its name from the moment a
/// create starts, even when the create then fails or its caller gives up.
#[derive(Default)]
pub struct FakeEngine {
    pub creates: AtomicUsize,
    pub removes: Mutex<Vec<Vec<SandboxId>>>,
    containers: Mutex<HashSet<String>>,
    fail_creates: AtomicUsize,
    fail_removes: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` creations fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn fail_removes(&self) {
        self.fail_removes.store(true, Ordering::SeqCst);
    }

    /// Make every creation take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> Vec<Vec<SandboxId>> {
        self.removes.lock().unwrap().clone()
    }

    /// Names of the containers the engine currently holds.
    pub fn containers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.containers.lock().unwrap().iter().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_detached(&self, spec: &LaunchSpec) -> corral_core::Result<SandboxId> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.containers.lock().unwrap().insert(spec.name.clone()) {
            return Err(CoreError::SandboxCreateFailed {
                output: format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                ),
            });
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreError::SandboxCreateFailed {
                output: "Unable to find image".into(),
            });
        }
        Ok(SandboxId::new(format!("{}-id{}", spec.name, n)))
    }

    fn shell_command(&self, target: &ShellTarget, script: &str) -> ShellCommand {
        let target = match target {
            ShellTarget::Existing(id) => format!("exec:{id}"),
            ShellTarget::Fresh(spec) => format!("run:{}", spec.name),
        };
        ShellCommand {
            program: "fake-engine".into(),
            args: vec![target, script.to_string()],
        }
    }

    async fn remove(&self, ids: &[SandboxId]) -> corral_core::Result<()> {
        self.removes.lock().unwrap().push(ids.to_vec());
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(CoreError::SandboxRemoveFailed {
                output: "daemon unreachable".into(),
            });
        }
        // Containers can be removed by name or by id.
        self.containers.lock().unwrap().retain(|name| {
            !ids.iter().any(|id| {
                let id = id.as_str();
                id == name || id.starts_with(&format!("{name}-id"))
            })
        });
        Ok(())
    }
}

/// State of one fake shell process.
pub struct FakeShell {
    output: Mutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    pub input: Mutex<Vec<u8>>,
    /// Size the pty was opened with.
    pub initial_size: WindowSize,
    /// Resizes applied afterwards.
    pub sizes: Mutex<Vec<WindowSize>>,
    exit_code: Mutex<Option<u32>>,
    /// Ignores both end of input and `SIGHUP`.
    stubborn: bool,
    pub eofs: AtomicUsize,
    pub hangups: AtomicUsize,
    pub kills: AtomicUsize,
    pub reaped: AtomicUsize,
}

impl FakeShell {
    /// Print `data` on the terminal.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Exit with `code`, closing the terminal.
    pub fn exit(&self, code: u32) {
        let mut exit_code = self.exit_code.lock().unwrap();
        if exit_code.is_none() {
            *exit_code = Some(code);
        }
        self.output.lock().unwrap().take();
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    /// Wait until the shell has read `expected`.
    pub async fn wait_for_input(&self, expected: &[u8]) {
        for _ in 0..500 {
            if self.input() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("shell never received {expected:?}");
    }

    pub fn sizes(&self) -> Vec<WindowSize> {
        self.sizes.lock().unwrap().clone()
    }

    /// Current terminal size.
    pub fn size(&self) -> WindowSize {
        self.sizes().last().copied().unwrap_or(self.initial_size)
    }

    /// Wait until the terminal has `expected` size.
    pub async fn wait_for_size(&self, expected: WindowSize) {
        for _ in 0..500 {
            if self.size() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("terminal never reached {expected:?}, history {:?}", self.sizes());
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn reaped(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }

    fn status(&self) -> Option<ShellExit> {
        self.exit_code
            .lock()
            .unwrap()
            .map(|code| ShellExit { code })
    }
}

/// Pty spawner whose shells are [`FakeShell`]s.
#[derive(Default)]
pub struct FakePty {
    pub commands: Mutex<Vec<ShellCommand>>,
    pub shells: Mutex<Vec<Arc<FakeShell>>>,
    stubborn: AtomicBool,
    fail: AtomicBool,
}

impl FakePty {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Shells ignore hang-up and must be killed.
    pub fn stubborn(&self) {
        self.stubborn.store(true, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.shells.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<ShellCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Wait for the `index`-th shell to be started.
    pub async fn shell(&self, index: usize) -> Arc<FakeShell> {
        for _ in 0..500 {
            if let Some(shell) = self.shells.lock().unwrap().get(index) {
                return Arc::clone(shell);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("shell {index} was never spawned");
    }
}

impl PtySpawner for FakePty {
    fn spawn(&self, command: &ShellCommand, size: WindowSize) -> corral_core::Result<PtyProcess> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::PtyStartFailed("no ptys left".into()));
        }
        let (tx, rx) = std_mpsc::channel();
        let shell = Arc::new(FakeShell {
            output: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            initial_size: size,
            sizes: Mutex::new(Vec::new()),
            exit_code: Mutex::new(None),
            stubborn: self.stubborn.load(Ordering::SeqCst),
            eofs: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            reaped: AtomicUsize::new(0),
        });
        self.commands.lock().unwrap().push(command.clone());
        self.shells.lock().unwrap().push(Arc::clone(&shell));

        Ok(PtyProcess {
            master: Box::new(FakeMaster(Arc::clone(&shell))),
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(FakeWriter(Arc::clone(&shell))),
            child: Box::new(FakeChild(shell)),
        })
    }
}

struct FakeMaster(Arc<FakeShell>);

impl PtyMaster for FakeMaster {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        self.0.sizes.lock().unwrap().push(size);
        Ok(())
    }
}

struct FakeReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter(Arc<FakeShell>);

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.status().is_some() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.0.input.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Releasing the writer ends the shell's input, like `^D` at a prompt.
impl Drop for FakeWriter {
    fn drop(&mut self) {
        self.0.eofs.fetch_add(1, Ordering::SeqCst);
        if !self.0.stubborn {
            self.0.exit(0);
        }
    }
}

struct FakeChild(Arc<FakeShell>);

impl ShellChild for FakeChild {
    fn try_wait(&mut self) -> io::Result<Option<ShellExit>> {
        let status = self.0.status();
        if status.is_some() {
            self.0.reaped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(status)
    }

    fn wait(&mut self) -> io::Result<ShellExit> {
        // Only called after kill, so the status is always set.
        let status = self.0.status().unwrap_or(ShellExit { code: 137 });
        self.0.reaped.fetch_add(1, Ordering::SeqCst);
        Ok(status)
    }

    fn hangup(&mut self) -> io::Result<()> {
        self.0.hangups.fetch_add(1, Ordering::SeqCst);
        if !self.0.stubborn {
            self.0.exit(129);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
        self.0.exit(137);
        Ok(())
    }
}

/// Channel sink that records everything sent to the client.
#[derive(Default)]
pub struct FakeSink {
    pub data: Mutex<Vec<u8>>,
    pub closes: AtomicUsize,
    failing: AtomicBool,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make every further send fail, as if the client stopped reading.
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelSink for FakeSink {
    async fn send(&self, data: Bytes) -> io::Result<()> {
        if self.closes() > 0 || self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.data.lock().unwrap().extend_from_slice(&data);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// The client's ends of a session channel.
pub struct FakeClient {
    pub input: mpsc::Sender<Bytes>,
    pub requests: mpsc::Sender<ControlRequest>,
    pub sink: Arc<FakeSink>,
}

impl FakeClient {
    /// Send a request and wait for its reply.
    pub async fn request(&self, kind: &str, payload: impl Into<Bytes>) -> bool {
        let (req, rx) = ControlRequest::new(kind, payload, true);
        self.requests.send(req).await.unwrap();
        await_reply(rx).await
    }

    pub async fn type_bytes(&self, data: &'static [u8]) {
        self.input.send(Bytes::from_static(data)).await.unwrap();
    }
}

pub async fn await_reply(rx: oneshot::Receiver<bool>) -> bool {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply timed out")
        .expect("request dropped without reply")
}

/// Build a session channel and the client handles that drive it.
pub fn session_channel() -> (SessionChannel, FakeClient) {
    let (input_tx, input_rx) = mpsc::channel(16);
    let (req_tx, req_rx) = mpsc::channel(16);
    let sink = FakeSink::new();
    let channel = SessionChannel {
        input: input_rx,
        output: sink.clone(),
        requests: req_rx,
    };
    let client = FakeClient {
        input: input_tx,
        requests: req_tx,
        sink,
    };
    (channel, client)
}

pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}
