//! Callback surface the engine uses to report to its collaborator.
//!
//! Handlers are plain closures stored in optional slots. They are supplied
//! when the [`Engine`](super::Engine) is constructed and cannot be swapped
//! afterwards, so no event can race with a handler being installed.
//!
//! Handlers run on the engine's background tasks. They must not block for
//! long; a UI should forward the event to its own thread.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::peers::Peer;
use super::wire::TEXT_MARKER;

/// Called with a peer that was added, updated or removed.
pub type PeerHandler = Arc<dyn Fn(&Peer) + Send + Sync + 'static>;
/// Called with the remote address of a transfer.
pub type AddressHandler = Arc<dyn Fn(&str) + Send + Sync + 'static>;
/// Called with `(total_bytes, transferred_bytes)`.
pub type ProgressHandler = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;
/// Called with the top-level entries created by a receive and the total size.
pub type ReceiveCompleteHandler = Arc<dyn Fn(&[PathBuf], u64) + Send + Sync + 'static>;
/// Called with a received text and its size in bytes.
pub type ReceiveTextHandler = Arc<dyn Fn(&str, u64) + Send + Sync + 'static>;
/// Called once an outbound transfer finished.
pub type SendCompleteHandler = Arc<dyn Fn(&SentPayload) + Send + Sync + 'static>;
/// Called with a human-readable error message.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// What a finished outbound transfer carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentPayload {
    /// The paths originally passed to `send_file`.
    Files(Vec<PathBuf>),
    /// An inline text payload.
    Text,
}

impl SentPayload {
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }

    /// Returns the sent paths, or the text marker for text payloads.
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Self::Files(paths) => paths.clone(),
            Self::Text => vec![PathBuf::from(TEXT_MARKER)],
        }
    }
}

/// Optional handler slots for every engine event.
#[derive(Clone, Default)]
pub struct EngineCallbacks {
    on_peer_added: Option<PeerHandler>,
    on_peer_removed: Option<PeerHandler>,
    on_receive_request: Option<AddressHandler>,
    on_receive_start: Option<AddressHandler>,
    on_send_start: Option<AddressHandler>,
    on_transfer_progress: Option<ProgressHandler>,
    on_receive_complete: Option<ReceiveCompleteHandler>,
    on_receive_text: Option<ReceiveTextHandler>,
    on_send_complete: Option<SendCompleteHandler>,
    on_error: Option<ErrorHandler>,
}

impl EngineCallbacks {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_peer_added(mut self, f: impl Fn(&Peer) + Send + Sync + 'static) -> Self {
        self.on_peer_added = Some(Arc::new(f));
        self
    }

    pub fn on_peer_removed(mut self, f: impl Fn(&Peer) + Send + Sync + 'static) -> Self {
        self.on_peer_removed = Some(Arc::new(f));
        self
    }

    /// Installs the approval gate handler.
    ///
    /// The collaborator must eventually answer with
    /// [`Engine::approve_transfer`](super::Engine::approve_transfer) or
    /// [`Engine::reject_transfer`](super::Engine::reject_transfer). Without
    /// this handler every inbound transfer is rejected.
    pub fn on_receive_request(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive_request = Some(Arc::new(f));
        self
    }

    pub fn on_receive_start(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive_start = Some(Arc::new(f));
        self
    }

    pub fn on_send_start(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send_start = Some(Arc::new(f));
        self
    }

    pub fn on_transfer_progress(mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_transfer_progress = Some(Arc::new(f));
        self
    }

    pub fn on_receive_complete(
        mut self,
        f: impl Fn(&[PathBuf], u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_receive_complete = Some(Arc::new(f));
        self
    }

    pub fn on_receive_text(mut self, f: impl Fn(&str, u64) + Send + Sync + 'static) -> Self {
        self.on_receive_text = Some(Arc::new(f));
        self
    }

    pub fn on_send_complete(mut self, f: impl Fn(&SentPayload) + Send + Sync + 'static) -> Self {
        self.on_send_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[inline]
    pub(crate) fn handles_receive_requests(&self) -> bool {
        self.on_receive_request.is_some()
    }

    pub(crate) fn peer_added(&self, peer: &Peer) {
        if let Some(f) = &self.on_peer_added {
            f(peer);
        }
    }

    pub(crate) fn peer_removed(&self, peer: &Peer) {
        if let Some(f) = &self.on_peer_removed {
            f(peer);
        }
    }

    pub(crate) fn receive_request(&self, sender: &str) {
        if let Some(f) = &self.on_receive_request {
            f(sender);
        }
    }

    pub(crate) fn receive_start(&self, sender: &str) {
        if let Some(f) = &self.on_receive_start {
            f(sender);
        }
    }

    pub(crate) fn send_start(&self, dest: &str) {
        if let Some(f) = &self.on_send_start {
            f(dest);
        }
    }

    pub(crate) fn transfer_progress(&self, total: u64, transferred: u64) {
        if let Some(f) = &self.on_transfer_progress {
            f(total, transferred);
        }
    }

    pub(crate) fn receive_complete(&self, created: &[PathBuf], total: u64) {
        if let Some(f) = &self.on_receive_complete {
            f(created, total);
        }
    }

    pub(crate) fn receive_text(&self, text: &str, total: u64) {
        if let Some(f) = &self.on_receive_text {
            f(text, total);
        }
    }

    pub(crate) fn send_complete(&self, payload: &SentPayload) {
        if let Some(f) = &self.on_send_complete {
            f(payload);
        }
    }

    pub(crate) fn error(&self, message: &str) {
        if let Some(f) = &self.on_error {
            f(message);
        }
    }
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("on_peer_added", &self.on_peer_added.is_some())
            .field("on_peer_removed", &self.on_peer_removed.is_some())
            .field("on_receive_request", &self.on_receive_request.is_some())
            .field("on_transfer_progress", &self.on_transfer_progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}
