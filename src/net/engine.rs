//! The transfer engine: one instance per process.
//!
//! [`Engine`] owns the discovery socket and the listening stream socket,
//! serializes every transfer behind a single session state and routes
//! inbound connections through an approval gate.
//!
//! # Session state
//!
//! ```text
//! Idle ──inbound──▶ AwaitingApproval ──approve──▶ Receiving ──▶ Idle
//!   │                      └─────────reject─────────────────▶ Idle
//!   └──send_file/send_text──▶ Sending ──────────────────────▶ Idle
//! ```
//!
//! A second transfer attempted while the state is not `Idle` is refused
//! outright: outbound calls fail with [`EngineError::Busy`], inbound
//! connections are reset without reading. The state returns to `Idle`
//! before the terminal callback of a session runs, so a collaborator may
//! start the next transfer from inside that callback.
//!
//! # Approval
//!
//! An inbound connection publishes a pending decision slot and suspends on
//! it. The collaborator resolves it with [`Engine::approve_transfer`] or
//! [`Engine::reject_transfer`] from any thread. Without an
//! `on_receive_request` handler every request is rejected.
//!
//! A send completes only after the receiver has read the whole stream and
//! closed its end. Rejected, busy and failed receivers reset the
//! connection, so the sender reports an error instead.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::discovery::{bind_udp, system_signature, Discovery, HelloTarget};
use super::events::{EngineCallbacks, SentPayload};
use super::peers::{Peer, PeerDirectory};
use super::transfer::{
    await_peer_close, expand_tree, refused_or_io, ReceiveOutcome, Session, TransferDirection,
    TransferError, TransferProgress, DEFAULT_CHUNK_SIZE,
};
use super::wire::DEFAULT_PORT;

/// Default wait for the transfer header once a request was approved.
const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory received files land in, under the home directory.
const RECEIVE_DIR: &str = "Received";

/// Back-off after a failed `accept`, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors returned by engine commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Already busy with another transfer")]
    Busy,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine has been shut down")]
    Shutdown,
}

/// What the engine is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingApproval,
    Sending,
    Receiving,
}

/// Answer to a pending receive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approve,
    Reject,
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Discovery port; 0 binds an ephemeral port.
    pub udp_port: u16,
    /// Listening stream port; 0 binds an ephemeral port.
    pub tcp_port: u16,
    /// Where received files and directories are written.
    pub receive_dir: PathBuf,
    /// Destination of broadcast announcements.
    pub broadcast_addr: Ipv4Addr,
    /// Size of the chunks file data is streamed in.
    pub chunk_size: usize,
    /// Longest wait for the transfer header after approval.
    pub header_timeout: Duration,
    /// Identity announced to peers.
    pub signature: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_PORT,
            tcp_port: DEFAULT_PORT,
            receive_dir: default_receive_dir(),
            broadcast_addr: Ipv4Addr::BROADCAST,
            chunk_size: DEFAULT_CHUNK_SIZE,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            signature: system_signature().to_string(),
        }
    }
}

impl EngineConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// Respects `DUKTO_UDP_PORT`, `DUKTO_TCP_PORT`, `DUKTO_RECEIVE_DIR` and
    /// `DUKTO_BROADCAST_ADDR`, which makes it easy to run several instances
    /// on one machine. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse("DUKTO_UDP_PORT") {
            config.udp_port = port;
        }
        if let Some(port) = env_parse("DUKTO_TCP_PORT") {
            config.tcp_port = port;
        }
        if let Some(addr) = env_parse("DUKTO_BROADCAST_ADDR") {
            config.broadcast_addr = addr;
        }
        if let Ok(dir) = std::env::var("DUKTO_RECEIVE_DIR") {
            config.receive_dir = PathBuf::from(dir);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "Ignoring invalid environment override");
            None
        }
    }
}

fn default_receive_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(RECEIVE_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Sockets and background tasks of an initialized engine.
struct Running {
    discovery: Arc<Discovery>,
    udp_port: u16,
    tcp_port: u16,
    tasks: Vec<JoinHandle<()>>,
}

enum Lifecycle {
    Configured,
    Running(Running),
    Shutdown,
}

struct Inner {
    config: RwLock<EngineConfig>,
    callbacks: Arc<EngineCallbacks>,
    peers: Arc<PeerDirectory>,
    state: Mutex<SessionState>,
    /// Decision slot of the connection awaiting approval.
    pending: Mutex<Option<oneshot::Sender<Decision>>>,
    lifecycle: RwLock<Lifecycle>,
    cancel: CancellationToken,
}

impl Inner {
    fn discovery(&self) -> Result<Arc<Discovery>, EngineError> {
        match &*self.lifecycle.read() {
            Lifecycle::Running(running) => Ok(Arc::clone(&running.discovery)),
            Lifecycle::Configured => Err(EngineError::NotInitialized),
            Lifecycle::Shutdown => Err(EngineError::Shutdown),
        }
    }

    fn progress_reporter(&self) -> impl FnMut(&TransferProgress) + Send + 'static {
        let callbacks = Arc::clone(&self.callbacks);
        move |progress: &TransferProgress| {
            callbacks.transfer_progress(progress.total_bytes, progress.transferred_bytes)
        }
    }
}

/// Holds the session state out of `Idle`; resets it when dropped.
struct SessionGuard {
    inner: Arc<Inner>,
}

impl SessionGuard {
    /// Moves `Idle` to `next`, or returns `None` if a session is active.
    fn try_begin(inner: &Arc<Inner>, next: SessionState) -> Option<Self> {
        let mut state = inner.state.lock();
        if *state != SessionState::Idle {
            return None;
        }
        *state = next;
        Some(Self {
            inner: Arc::clone(inner),
        })
    }

    fn set(&self, next: SessionState) {
        *self.inner.state.lock() = next;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.inner.state.lock() = SessionState::Idle;
    }
}

/// Payload of an outbound transfer.
enum Outbound {
    Files(Vec<PathBuf>),
    Text(String),
}

impl Outbound {
    fn error_prefix(&self) -> &'static str {
        match self {
            Self::Files(_) => "Send error",
            Self::Text(_) => "Send text error",
        }
    }

    fn into_sent(self) -> SentPayload {
        match self {
            Self::Files(paths) => SentPayload::Files(paths),
            Self::Text(_) => SentPayload::Text,
        }
    }
}

/// LAN discovery and transfer engine.
///
/// Cheap to clone; all clones drive the same sockets. Commands that spawn
/// work must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("local_ports", &self.local_ports())
            .field("peers", &self.inner.peers.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(callbacks: EngineCallbacks) -> Self {
        Self::with_config(EngineConfig::default(), callbacks)
    }

    /// Creates an engine. Nothing is bound until [`initialize`](Self::initialize).
    pub fn with_config(config: EngineConfig, callbacks: EngineCallbacks) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                callbacks: Arc::new(callbacks),
                peers: Arc::new(PeerDirectory::new()),
                state: Mutex::new(SessionState::Idle),
                pending: Mutex::new(None),
                lifecycle: RwLock::new(Lifecycle::Configured),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Overrides the discovery and stream ports. Only valid before
    /// [`initialize`](Self::initialize).
    pub fn set_ports(&self, udp_port: u16, tcp_port: u16) -> Result<(), EngineError> {
        match &*self.inner.lifecycle.read() {
            Lifecycle::Configured => {}
            Lifecycle::Running(_) => return Err(EngineError::AlreadyInitialized),
            Lifecycle::Shutdown => return Err(EngineError::Shutdown),
        }
        let mut config = self.inner.config.write();
        config.udp_port = udp_port;
        config.tcp_port = tcp_port;
        Ok(())
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> EngineConfig {
        self.inner.config.read().clone()
    }

    /// Binds both sockets and starts the discovery and accept loops.
    ///
    /// Bind failures are returned to the caller; nothing is started in that
    /// case.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        match &*self.inner.lifecycle.read() {
            Lifecycle::Configured => {}
            Lifecycle::Running(_) => return Err(EngineError::AlreadyInitialized.into()),
            Lifecycle::Shutdown => return Err(EngineError::Shutdown.into()),
        }
        let config = self.config();

        tokio::fs::create_dir_all(&config.receive_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create receive directory {}",
                    config.receive_dir.display()
                )
            })?;

        let udp = bind_udp(config.udp_port)
            .with_context(|| format!("failed to bind discovery port {}", config.udp_port))?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.tcp_port))
            .await
            .with_context(|| format!("failed to bind transfer port {}", config.tcp_port))?;
        let tcp_port = listener
            .local_addr()
            .context("failed to read transfer port")?
            .port();

        let discovery = Arc::new(
            Discovery::new(
                udp,
                config.signature.as_str(),
                config.broadcast_addr,
                Arc::clone(&self.inner.peers),
                Arc::clone(&self.inner.callbacks),
            )
            .context("failed to read discovery port")?,
        );
        let udp_port = discovery.local_port();

        let mut lifecycle = self.inner.lifecycle.write();
        if !matches!(*lifecycle, Lifecycle::Configured) {
            return Err(EngineError::AlreadyInitialized.into());
        }

        let cancel = self.inner.cancel.clone();
        let tasks = vec![
            tokio::spawn(Arc::clone(&discovery).run(cancel.clone())),
            tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, cancel)),
        ];
        *lifecycle = Lifecycle::Running(Running {
            discovery,
            udp_port,
            tcp_port,
            tasks,
        });

        info!(
            udp_port,
            tcp_port,
            receive_dir = %config.receive_dir.display(),
            "Engine initialized"
        );
        Ok(())
    }

    /// Announces this instance. `port` defaults to our own discovery port.
    #[instrument(skip(self))]
    pub async fn say_hello(&self, target: HelloTarget, port: Option<u16>) -> Result<()> {
        let discovery = self.inner.discovery()?;
        discovery
            .announce(&target, port)
            .await
            .with_context(|| format!("failed to send hello to {target:?}"))
    }

    /// Tells every known port that this instance is leaving.
    #[instrument(skip(self))]
    pub async fn say_goodbye(&self) -> Result<()> {
        self.inner.discovery()?.announce_goodbye().await;
        Ok(())
    }

    /// Sends files and directories to `address`. Port 0 means the default
    /// port.
    ///
    /// Returns immediately with a handle to the background session. Fails
    /// with [`EngineError::Busy`] (after reporting it through `on_error`) if
    /// another transfer is active.
    pub fn send_file(
        &self,
        address: &str,
        paths: Vec<PathBuf>,
        port: u16,
    ) -> Result<JoinHandle<()>, EngineError> {
        self.start_send(address, Outbound::Files(paths), port)
    }

    /// Sends a text snippet to `address`. Port 0 means the default port.
    pub fn send_text(
        &self,
        address: &str,
        text: impl Into<String>,
        port: u16,
    ) -> Result<JoinHandle<()>, EngineError> {
        self.start_send(address, Outbound::Text(text.into()), port)
    }

    fn start_send(
        &self,
        address: &str,
        outbound: Outbound,
        port: u16,
    ) -> Result<JoinHandle<()>, EngineError> {
        self.inner.discovery()?;

        let Some(guard) = SessionGuard::try_begin(&self.inner, SessionState::Sending) else {
            warn!(address, "Refusing send while another transfer is active");
            self.inner.callbacks.error(&EngineError::Busy.to_string());
            return Err(EngineError::Busy);
        };

        let port = if port == 0 { DEFAULT_PORT } else { port };
        let inner = Arc::clone(&self.inner);
        let address = address.to_string();

        Ok(tokio::spawn(async move {
            inner.callbacks.send_start(&address);
            let result = deliver(&inner, &address, port, &outbound).await;
            drop(guard);

            match result {
                Ok(total) => {
                    info!(address = %address, port, total, "Send complete");
                    inner.callbacks.send_complete(&outbound.into_sent());
                }
                Err(e) => {
                    error!(address = %address, port, error = %e, "Send failed");
                    inner
                        .callbacks
                        .error(&format!("{}: {e}", outbound.error_prefix()));
                }
            }
        }))
    }

    /// Accepts the pending receive request. Returns `false` if none is
    /// waiting.
    pub fn approve_transfer(&self) -> bool {
        self.decide(Decision::Approve)
    }

    /// Rejects the pending receive request. Returns `false` if none is
    /// waiting.
    pub fn reject_transfer(&self) -> bool {
        self.decide(Decision::Reject)
    }

    fn decide(&self, decision: Decision) -> bool {
        match self.inner.pending.lock().take() {
            Some(slot) => slot.send(decision).is_ok(),
            None => {
                debug!(?decision, "No transfer awaiting a decision");
                false
            }
        }
    }

    /// Says goodbye, stops both loops and closes the sockets.
    ///
    /// A pending receive request is rejected. Sessions already transferring
    /// run to completion on their own connection.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let running = {
            let mut lifecycle = self.inner.lifecycle.write();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Shutdown) {
                Lifecycle::Running(running) => running,
                Lifecycle::Configured => return,
                Lifecycle::Shutdown => {
                    warn!("Attempted to shut down already shutdown engine");
                    return;
                }
            }
        };

        info!("Shutting down engine");
        running.discovery.announce_goodbye().await;
        self.inner.cancel.cancel();
        self.inner.pending.lock().take();

        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.inner.peers.clear();
    }

    /// Returns the known peers, ordered by address.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.snapshot()
    }

    /// Returns the bound `(udp_port, tcp_port)` once initialized.
    pub fn local_ports(&self) -> Option<(u16, u16)> {
        match &*self.inner.lifecycle.read() {
            Lifecycle::Running(running) => Some((running.udp_port, running.tcp_port)),
            _ => None,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }
}

/// Runs one outbound session. Returns the payload size sent.
async fn deliver(
    inner: &Inner,
    address: &str,
    port: u16,
    outbound: &Outbound,
) -> Result<u64, TransferError> {
    let chunk_size = inner.config.read().chunk_size;

    let elements = match outbound {
        Outbound::Files(paths) => {
            let paths = paths.clone();
            tokio::task::spawn_blocking(move || expand_tree(&paths))
                .await
                .map_err(io::Error::other)??
        }
        Outbound::Text(_) => Vec::new(),
    };

    let stream = TcpStream::connect((address, port)).await?;
    debug!(address, port, "Connected");
    let mut writer = BufWriter::new(stream);
    let mut session = Session::new(
        TransferDirection::Send,
        address,
        chunk_size,
        inner.progress_reporter(),
    );

    let sent = match outbound {
        Outbound::Files(_) => session.send_files(&mut writer, &elements).await,
        Outbound::Text(text) => session.send_text(&mut writer, text).await,
    }
    .map_err(|e| match e {
        TransferError::Io(e) => refused_or_io(e),
        other => other,
    })?;
    writer.shutdown().await.map_err(refused_or_io)?;

    // Complete only once the receiver has consumed the stream and closed it
    debug!(address, port, sent, "Payload written, waiting for receiver to close");
    await_peer_close(writer.get_mut()).await?;
    Ok(sent)
}

/// Closes `stream` with a reset so the remote sender observes the refusal.
fn abort(stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!(error = %e, "Failed to set zero linger");
    }
    drop(stream);
}

/// Accepts inbound connections until `cancel` fires.
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    info!("Accept loop started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Accept loop shutting down");
                break;
            }

            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let sender = addr.ip().to_string();
                    let Some(guard) = SessionGuard::try_begin(&inner, SessionState::AwaitingApproval) else {
                        info!(sender = %sender, "Busy, closing inbound connection");
                        abort(stream);
                        continue;
                    };
                    tokio::spawn(handle_inbound(
                        Arc::clone(&inner),
                        guard,
                        stream,
                        sender,
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Gates one inbound connection on approval, then receives it.
async fn handle_inbound(
    inner: Arc<Inner>,
    guard: SessionGuard,
    mut stream: TcpStream,
    sender: String,
    cancel: CancellationToken,
) {
    let (slot, decision) = oneshot::channel();
    *inner.pending.lock() = Some(slot);

    if inner.callbacks.handles_receive_requests() {
        info!(sender = %sender, "Receive request pending approval");
        inner.callbacks.receive_request(&sender);
    } else if let Some(slot) = inner.pending.lock().take() {
        debug!(sender = %sender, "No approval handler, rejecting");
        let _ = slot.send(Decision::Reject);
    }

    let decision = tokio::select! {
        _ = cancel.cancelled() => Decision::Reject,
        decision = decision => decision.unwrap_or(Decision::Reject),
    };
    if decision == Decision::Reject {
        info!(sender = %sender, "Transfer rejected");
        inner.pending.lock().take();
        abort(stream);
        return;
    }

    guard.set(SessionState::Receiving);
    inner.callbacks.receive_start(&sender);
    let result = receive(&inner, &mut stream, &sender).await;
    drop(guard);
    if result.is_err() {
        abort(stream);
    } else {
        drop(stream);
    }

    match result {
        Ok(ReceiveOutcome::Files {
            created,
            total_bytes,
        }) => {
            info!(sender = %sender, entries = created.len(), total_bytes, "Receive complete");
            inner.callbacks.receive_complete(&created, total_bytes);
        }
        Ok(ReceiveOutcome::Text { text, total_bytes }) => {
            info!(sender = %sender, total_bytes, "Text received");
            inner.callbacks.receive_text(&text, total_bytes);
        }
        Err(e) => {
            error!(sender = %sender, error = %e, "Receive failed");
            inner.callbacks.error(&format!("Receive error: {e}"));
        }
    }
}

async fn receive(
    inner: &Inner,
    stream: &mut TcpStream,
    sender: &str,
) -> Result<ReceiveOutcome, TransferError> {
    let (chunk_size, receive_dir, header_timeout) = {
        let config = inner.config.read();
        (
            config.chunk_size,
            config.receive_dir.clone(),
            config.header_timeout,
        )
    };

    let mut reader = BufReader::new(stream);
    let mut session = Session::new(
        TransferDirection::Receive,
        sender,
        chunk_size,
        inner.progress_reporter(),
    );
    session
        .receive(&mut reader, &receive_dir, header_timeout)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);
    const LOCALHOST: &str = "127.0.0.1";

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        PeerAdded(String),
        PeerRemoved(String),
        Request(String),
        ReceiveStart,
        SendStart,
        Progress(u64, u64),
        ReceiveComplete(Vec<PathBuf>, u64),
        ReceiveText(String, u64),
        SendComplete(SentPayload),
        Error(String),
    }

    fn recorder() -> (EngineCallbacks, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let send = move |event: Event| {
            let _ = tx.send(event);
        };
        let s = send.clone();
        let callbacks = EngineCallbacks::new()
            .on_peer_added({
                let s = s.clone();
                move |p| s(Event::PeerAdded(p.signature.to_string()))
            })
            .on_peer_removed({
                let s = s.clone();
                move |p| s(Event::PeerRemoved(p.signature.to_string()))
            })
            .on_receive_request({
                let s = s.clone();
                move |addr| s(Event::Request(addr.to_string()))
            })
            .on_receive_start({
                let s = s.clone();
                move |_| s(Event::ReceiveStart)
            })
            .on_send_start({
                let s = s.clone();
                move |_| s(Event::SendStart)
            })
            .on_transfer_progress({
                let s = s.clone();
                move |total, done| s(Event::Progress(total, done))
            })
            .on_receive_complete({
                let s = s.clone();
                move |created, total| s(Event::ReceiveComplete(created.to_vec(), total))
            })
            .on_receive_text({
                let s = s.clone();
                move |text, total| s(Event::ReceiveText(text.to_string(), total))
            })
            .on_send_complete({
                let s = s.clone();
                move |payload| s(Event::SendComplete(payload.clone()))
            })
            .on_error(move |message| send(Event::Error(message.to_string())));
        (callbacks, rx)
    }

    fn test_config(signature: &str, receive_dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            udp_port: 0,
            tcp_port: 0,
            receive_dir: receive_dir.to_path_buf(),
            broadcast_addr: Ipv4Addr::LOCALHOST,
            chunk_size: DEFAULT_CHUNK_SIZE,
            header_timeout: Duration::from_secs(5),
            signature: signature.to_string(),
        }
    }

    struct Node {
        engine: Engine,
        events: mpsc::UnboundedReceiver<Event>,
        dir: TempDir,
    }

    impl Node {
        async fn start(signature: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let (callbacks, events) = recorder();
            let engine = Engine::with_config(test_config(signature, dir.path()), callbacks);
            engine.initialize().await.unwrap();
            Self { engine, events, dir }
        }

        fn udp_port(&self) -> u16 {
            self.engine.local_ports().unwrap().0
        }

        fn tcp_port(&self) -> u16 {
            self.engine.local_ports().unwrap().1
        }

        /// Collects events up to and including the first one matching `pred`.
        async fn until(&mut self, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
            let mut seen = Vec::new();
            let result = tokio::time::timeout(WAIT, async {
                while let Some(event) = self.events.recv().await {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
            })
            .await;
            assert!(result.is_ok(), "timed out; events so far: {seen:?}");
            seen
        }

        async fn wait_idle(&self) {
            let deadline = tokio::time::Instant::now() + WAIT;
            while self.engine.state() != SessionState::Idle {
                assert!(tokio::time::Instant::now() < deadline, "engine never went idle");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn progress_of(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Progress(_, done) => Some(*done),
                _ => None,
            })
            .collect()
    }

    // ==== Configuration Tests ====

    mod config_tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = EngineConfig::default();
            assert_eq!(config.udp_port, DEFAULT_PORT);
            assert_eq!(config.tcp_port, DEFAULT_PORT);
            assert_eq!(config.broadcast_addr, Ipv4Addr::BROADCAST);
            assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
            assert_eq!(config.header_timeout, Duration::from_secs(10));
            assert_eq!(config.signature, system_signature());
        }

        #[test]
        fn test_from_env_overrides() {
            let dir = TempDir::new().unwrap();
            std::env::set_var("DUKTO_UDP_PORT", "5001");
            std::env::set_var("DUKTO_TCP_PORT", "not-a-port");
            std::env::set_var("DUKTO_BROADCAST_ADDR", "10.0.0.255");
            std::env::set_var("DUKTO_RECEIVE_DIR", dir.path());

            let config = EngineConfig::from_env();
            assert_eq!(config.udp_port, 5001);
            assert_eq!(config.tcp_port, DEFAULT_PORT);
            assert_eq!(config.broadcast_addr, Ipv4Addr::new(10, 0, 0, 255));
            assert_eq!(config.receive_dir, dir.path());

            // Clean up
            for key in [
                "DUKTO_UDP_PORT",
                "DUKTO_TCP_PORT",
                "DUKTO_BROADCAST_ADDR",
                "DUKTO_RECEIVE_DIR",
            ] {
                std::env::remove_var(key);
            }
        }

        #[tokio::test]
        async fn test_set_ports_only_before_initialize() {
            let dir = TempDir::new().unwrap();
            let engine = Engine::with_config(test_config("me", dir.path()), EngineCallbacks::new());

            engine.set_ports(0, 0).unwrap();
            engine.initialize().await.unwrap();
            assert_eq!(engine.set_ports(5000, 5000), Err(EngineError::AlreadyInitialized));

            let err = engine.initialize().await.unwrap_err();
            assert_eq!(
                err.downcast_ref::<EngineError>(),
                Some(&EngineError::AlreadyInitialized)
            );
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_commands_before_initialize() {
            let engine = Engine::new(EngineCallbacks::new());
            assert!(engine.local_ports().is_none());
            assert_eq!(
                engine.send_text(LOCALHOST, "hi", 0).unwrap_err(),
                EngineError::NotInitialized
            );
            assert!(engine.say_hello(HelloTarget::Broadcast, None).await.is_err());
            assert!(!engine.approve_transfer());
        }

        #[tokio::test]
        async fn test_bind_failure_propagates() {
            let dir = TempDir::new().unwrap();
            let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
            let port = taken.local_addr().unwrap().port();

            let mut config = test_config("me", dir.path());
            config.tcp_port = port;
            let engine = Engine::with_config(config, EngineCallbacks::new());

            let err = engine.initialize().await.unwrap_err();
            assert!(format!("{err:#}").contains("failed to bind transfer port"));
            assert!(engine.local_ports().is_none());
        }
    }

    // ==== Transfer Tests ====

    mod transfer_tests {
        use super::*;

        #[tokio::test]
        async fn test_docs_directory_scenario() {
            let mut receiver = Node::start("receiver").await;
            let mut sender = Node::start("sender").await;

            let src = TempDir::new().unwrap();
            fs::create_dir_all(src.path().join("docs/sub")).unwrap();
            fs::write(src.path().join("docs/a.txt"), b"hello").unwrap();
            fs::write(src.path().join("docs/sub/b.txt"), b"abc").unwrap();
            let docs = src.path().join("docs");

            let handle = sender
                .engine
                .send_file(LOCALHOST, vec![docs.clone()], receiver.tcp_port())
                .unwrap();

            receiver.until(|e| matches!(e, Event::Request(_))).await;
            assert_eq!(receiver.engine.state(), SessionState::AwaitingApproval);
            assert!(receiver.engine.approve_transfer());

            let events = receiver
                .until(|e| matches!(e, Event::ReceiveComplete(..)))
                .await;
            assert_eq!(events[0], Event::ReceiveStart);
            assert_eq!(progress_of(&events), [5, 8]);
            assert_eq!(
                events.last(),
                Some(&Event::ReceiveComplete(vec![PathBuf::from("docs")], 8))
            );
            assert_eq!(
                fs::read(receiver.dir.path().join("docs/sub/b.txt")).unwrap(),
                b"abc"
            );

            handle.await.unwrap();
            let events = sender.until(|e| matches!(e, Event::SendComplete(_))).await;
            assert_eq!(events[0], Event::SendStart);
            assert_eq!(
                events.last(),
                Some(&Event::SendComplete(SentPayload::Files(vec![docs])))
            );
            assert_eq!(sender.engine.state(), SessionState::Idle);
            assert_eq!(receiver.engine.state(), SessionState::Idle);

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_text_round_trip() {
            let mut receiver = Node::start("receiver").await;
            let mut sender = Node::start("sender").await;
            let text = "Grüße aus dem LAN ✓\nzweite Zeile";

            sender
                .engine
                .send_text(LOCALHOST, text, receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;

            tokio::time::sleep(Duration::from_millis(50)).await;
            let early: Vec<Event> = std::iter::from_fn(|| sender.events.try_recv().ok()).collect();
            assert!(
                !early.iter().any(|e| matches!(e, Event::SendComplete(_))),
                "send completed before approval: {early:?}"
            );
            assert_eq!(sender.engine.state(), SessionState::Sending);
            receiver.engine.approve_transfer();

            let events = receiver.until(|e| matches!(e, Event::ReceiveText(..))).await;
            assert_eq!(
                events.last(),
                Some(&Event::ReceiveText(text.to_string(), text.len() as u64))
            );

            let events = sender.until(|e| matches!(e, Event::SendComplete(_))).await;
            assert_eq!(events.last(), Some(&Event::SendComplete(SentPayload::Text)));
            assert_eq!(fs::read_dir(receiver.dir.path()).unwrap().count(), 0);

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_existing_file_is_not_overwritten() {
            let mut receiver = Node::start("receiver").await;
            let sender = Node::start("sender").await;
            fs::write(receiver.dir.path().join("a.txt"), b"old").unwrap();

            let src = TempDir::new().unwrap();
            let input = src.path().join("a.txt");
            fs::write(&input, b"new").unwrap();

            sender
                .engine
                .send_file(LOCALHOST, vec![input], receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;
            receiver.engine.approve_transfer();

            let events = receiver
                .until(|e| matches!(e, Event::ReceiveComplete(..)))
                .await;
            assert_eq!(
                events.last(),
                Some(&Event::ReceiveComplete(vec![PathBuf::from("a (2).txt")], 3))
            );
            assert_eq!(fs::read(receiver.dir.path().join("a.txt")).unwrap(), b"old");
            assert_eq!(
                fs::read(receiver.dir.path().join("a (2).txt")).unwrap(),
                b"new"
            );

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_second_send_while_busy_is_rejected() {
            let mut receiver = Node::start("receiver").await;
            let mut sender = Node::start("sender").await;
            let port = receiver.tcp_port();

            let first = sender.engine.send_text(LOCALHOST, "one", port).unwrap();
            let second = sender.engine.send_text(LOCALHOST, "two", port);
            assert_eq!(second.unwrap_err(), EngineError::Busy);

            receiver.until(|e| matches!(e, Event::Request(_))).await;
            receiver.engine.approve_transfer();
            first.await.unwrap();

            let events = sender.until(|e| matches!(e, Event::SendComplete(_))).await;
            let starts = events.iter().filter(|e| **e == Event::SendStart).count();
            assert_eq!(starts, 1);
            assert!(events.contains(&Event::Error("Already busy with another transfer".into())));

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_send_while_awaiting_approval_is_rejected() {
            let mut receiver = Node::start("receiver").await;
            let sender = Node::start("sender").await;

            sender
                .engine
                .send_text(LOCALHOST, "hello", receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;

            let result = receiver
                .engine
                .send_text(LOCALHOST, "back", sender.tcp_port());
            assert_eq!(result.unwrap_err(), EngineError::Busy);

            assert!(receiver.engine.reject_transfer());
            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_inbound_while_awaiting_approval_is_closed() {
            let mut receiver = Node::start("receiver").await;
            let sender = Node::start("sender").await;

            sender
                .engine
                .send_text(LOCALHOST, "first", receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;

            let mut intruder = TcpStream::connect((LOCALHOST, receiver.tcp_port()))
                .await
                .unwrap();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(WAIT, intruder.read(&mut buf))
                .await
                .expect("busy connection was not closed");
            assert!(matches!(read, Ok(0) | Err(_)));
            assert_eq!(receiver.engine.state(), SessionState::AwaitingApproval);

            receiver.engine.reject_transfer();
            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        fn assert_send_failed(events: &[Event]) {
            assert!(
                !events.iter().any(|e| matches!(e, Event::SendComplete(_))),
                "send reported success: {events:?}"
            );
            match events.last() {
                Some(Event::Error(message)) => assert!(
                    message.starts_with("Send text error: "),
                    "unexpected message: {message}"
                ),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_sender_into_busy_receiver_reports_error() {
            let mut receiver = Node::start("receiver").await;
            let first = Node::start("first").await;
            let mut second = Node::start("second").await;

            first
                .engine
                .send_text(LOCALHOST, "first", receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;

            second
                .engine
                .send_text(LOCALHOST, "second", receiver.tcp_port())
                .unwrap();
            let events = second.until(|e| matches!(e, Event::Error(_))).await;
            assert_send_failed(&events);
            second.wait_idle().await;
            assert_eq!(receiver.engine.state(), SessionState::AwaitingApproval);

            receiver.engine.reject_transfer();
            first.engine.shutdown().await;
            second.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_rejected_sender_reports_error() {
            let mut receiver = Node::start("receiver").await;
            let mut sender = Node::start("sender").await;

            sender
                .engine
                .send_text(LOCALHOST, "unwanted", receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;
            assert!(receiver.engine.reject_transfer());

            let events = sender.until(|e| matches!(e, Event::Error(_))).await;
            assert_send_failed(&events);
            sender.wait_idle().await;

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_reject_returns_to_idle() {
            let mut receiver = Node::start("receiver").await;
            let sender = Node::start("sender").await;

            sender
                .engine
                .send_text(LOCALHOST, "nope", receiver.tcp_port())
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;
            assert!(receiver.engine.reject_transfer());
            assert!(!receiver.engine.reject_transfer());

            receiver.wait_idle().await;
            assert!(receiver.events.try_recv().is_err());

            sender.engine.shutdown().await;
            receiver.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_without_request_handler_transfers_are_rejected() {
            let dir = TempDir::new().unwrap();
            let engine = Engine::with_config(test_config("silent", dir.path()), EngineCallbacks::new());
            engine.initialize().await.unwrap();
            let (_, tcp_port) = engine.local_ports().unwrap();

            let mut stream = TcpStream::connect((LOCALHOST, tcp_port)).await.unwrap();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));

            let deadline = tokio::time::Instant::now() + WAIT;
            while engine.state() != SessionState::Idle {
                assert!(tokio::time::Instant::now() < deadline);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_connection_refused_reports_error() {
            let mut sender = Node::start("sender").await;
            let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let port = closed.local_addr().unwrap().port();
            drop(closed);

            sender.engine.send_text(LOCALHOST, "hi", port).unwrap();
            let events = sender.until(|e| matches!(e, Event::Error(_))).await;
            match events.last() {
                Some(Event::Error(message)) => assert!(message.starts_with("Send text error: ")),
                other => panic!("unexpected event: {other:?}"),
            }
            assert_eq!(sender.engine.state(), SessionState::Idle);
            sender.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_truncated_stream_reports_receive_error() {
            let mut receiver = Node::start("receiver").await;

            let mut stream = TcpStream::connect((LOCALHOST, receiver.tcp_port()))
                .await
                .unwrap();
            receiver.until(|e| matches!(e, Event::Request(_))).await;
            receiver.engine.approve_transfer();

            stream.write_all(&[1, 0, 0, 0]).await.unwrap();
            drop(stream);

            let events = receiver.until(|e| matches!(e, Event::Error(_))).await;
            match events.last() {
                Some(Event::Error(message)) => assert!(message.starts_with("Receive error: ")),
                other => panic!("unexpected event: {other:?}"),
            }
            receiver.wait_idle().await;
            receiver.engine.shutdown().await;
        }
    }

    // ==== Discovery Tests ====

    mod discovery_tests {
        use super::*;

        #[tokio::test]
        async fn test_hello_and_goodbye_between_engines() {
            let mut alice = Node::start("alice").await;
            let mut bob = Node::start("bob").await;

            alice
                .engine
                .say_hello(HelloTarget::Broadcast, Some(bob.udp_port()))
                .await
                .unwrap();

            let events = bob.until(|e| matches!(e, Event::PeerAdded(_))).await;
            assert_eq!(events.last(), Some(&Event::PeerAdded("alice".into())));
            let peers = bob.engine.peers();
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].port, alice.udp_port());

            // Bob answers the broadcast directly
            let events = alice.until(|e| matches!(e, Event::PeerAdded(_))).await;
            assert_eq!(events.last(), Some(&Event::PeerAdded("bob".into())));
            assert_eq!(alice.engine.peers()[0].port, bob.udp_port());

            alice.engine.say_goodbye().await.unwrap();
            let events = bob.until(|e| matches!(e, Event::PeerRemoved(_))).await;
            assert_eq!(events.last(), Some(&Event::PeerRemoved("alice".into())));
            assert!(bob.engine.peers().is_empty());

            alice.engine.shutdown().await;
            bob.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_unicast_hello_is_not_answered() {
            let alice = Node::start("alice").await;
            let mut bob = Node::start("bob").await;

            alice
                .engine
                .say_hello(HelloTarget::Unicast(LOCALHOST.into()), Some(bob.udp_port()))
                .await
                .unwrap();
            bob.until(|e| matches!(e, Event::PeerAdded(_))).await;

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(alice.engine.peers().is_empty());

            alice.engine.shutdown().await;
            bob.engine.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_twice_is_harmless() {
            let node = Node::start("solo").await;
            node.engine.shutdown().await;
            node.engine.shutdown().await;
            assert!(node.engine.local_ports().is_none());
            assert_eq!(
                node.engine.send_text(LOCALHOST, "x", 1).unwrap_err(),
                EngineError::Shutdown
            );
        }
    }
}
