//! Local network discovery over UDP broadcast.
//!
//! Every instance binds one datagram socket and:
//! - Broadcasts a HELLO carrying its signature when asked to announce itself
//! - Answers each broadcast HELLO it hears with a unicast HELLO, so both sides
//!   learn about each other without a second broadcast round
//! - Records announcing peers in the shared [`PeerDirectory`]
//! - Drops peers that send a GOODBYE
//!
//! A HELLO carrying our own signature is our broadcast looping back and is
//! ignored.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::events::EngineCallbacks;
use super::peers::{Peer, PeerDirectory, Upsert, INLINE_PORTS};
use super::wire::{DiscoveryMessage, HelloKind, DEFAULT_PORT};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 4096;

/// Cached signature of the local system.
static SYSTEM_SIGNATURE: OnceCell<String> = OnceCell::new();

/// Returns this machine's signature, `"<user> at <host> (<OS>)"`.
pub fn system_signature() -> &'static str {
    SYSTEM_SIGNATURE.get_or_init(|| {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = hostname::get().map_or_else(
            |_| "unknown".to_string(),
            |h| h.to_string_lossy().into_owned(),
        );
        format!("{user} at {host} ({})", os_name())
    })
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "windows" => "Windows",
        "macos" => "macOS",
        "android" => "Android",
        "ios" => "iOS",
        "freebsd" => "FreeBSD",
        other => other,
    }
}

/// Binds the discovery socket with address reuse and broadcast enabled.
pub fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Where a HELLO is sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HelloTarget {
    /// The configured broadcast address.
    #[default]
    Broadcast,
    /// A single host, by address or hostname.
    Unicast(String),
}

impl From<IpAddr> for HelloTarget {
    fn from(addr: IpAddr) -> Self {
        Self::Unicast(addr.to_string())
    }
}

/// Discovery service owning the datagram socket.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    /// Port the socket is actually bound to.
    local_port: u16,
    signature: Arc<str>,
    broadcast_addr: Ipv4Addr,
    peers: Arc<PeerDirectory>,
    callbacks: Arc<EngineCallbacks>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("local_port", &self.local_port)
            .field("signature", &self.signature)
            .field("broadcast_addr", &self.broadcast_addr)
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Wraps a bound socket. The local port is read back from the socket so
    /// that port 0 (ephemeral) works.
    pub fn new(
        socket: UdpSocket,
        signature: impl Into<Arc<str>>,
        broadcast_addr: Ipv4Addr,
        peers: Arc<PeerDirectory>,
        callbacks: Arc<EngineCallbacks>,
    ) -> io::Result<Self> {
        let local_port = socket.local_addr()?.port();
        let signature = signature.into();
        info!(port = local_port, signature = %signature, "Discovery service initialized");

        Ok(Self {
            socket: Arc::new(socket),
            local_port,
            signature,
            broadcast_addr,
            peers,
            callbacks,
        })
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[inline]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[inline]
    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    /// Builds our HELLO. The port is embedded only when we are not listening
    /// on the well-known port.
    pub fn hello_message(&self, kind: HelloKind) -> DiscoveryMessage {
        let port = (self.local_port != DEFAULT_PORT).then_some(self.local_port);
        DiscoveryMessage::hello(kind, port, self.signature.as_ref())
    }

    /// Announces our presence.
    ///
    /// `port` defaults to our own discovery port. A broadcast on a
    /// non-default port is repeated on the well-known port so that instances
    /// still listening there hear it too. Broadcast failures are logged;
    /// unicast failures are returned.
    #[instrument(skip(self), fields(local_port = self.local_port))]
    pub async fn announce(&self, target: &HelloTarget, port: Option<u16>) -> io::Result<()> {
        let port = port.unwrap_or(self.local_port);

        match target {
            HelloTarget::Broadcast => {
                let packet = self.hello_message(HelloKind::Broadcast).encode();
                self.broadcast(&packet, port).await;
                if port != DEFAULT_PORT {
                    self.broadcast(&packet, DEFAULT_PORT).await;
                }
            }
            HelloTarget::Unicast(host) => {
                let packet = self.hello_message(HelloKind::Unicast).encode();
                self.socket.send_to(&packet, (host.as_str(), port)).await?;
                debug!(host = %host, port, "Sent unicast hello");
            }
        }

        Ok(())
    }

    /// Broadcasts a GOODBYE on every port a peer might be listening on.
    #[instrument(skip(self))]
    pub async fn announce_goodbye(&self) {
        let packet = DiscoveryMessage::Goodbye.encode();
        let ports = self.goodbye_ports();
        debug!(ports = ?ports.as_slice(), "Broadcasting goodbye");

        for port in ports {
            self.broadcast(&packet, port).await;
        }
    }

    /// Own port, the well-known port and every known peer port, deduplicated.
    pub fn goodbye_ports(&self) -> SmallVec<[u16; INLINE_PORTS]> {
        let mut ports: SmallVec<[u16; INLINE_PORTS]> = SmallVec::new();
        ports.push(self.local_port);
        ports.push(DEFAULT_PORT);
        ports.extend(self.peers.known_ports());
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    async fn broadcast(&self, packet: &[u8], port: u16) {
        let dest = SocketAddr::from((self.broadcast_addr, port));
        if let Err(e) = self.socket.send_to(packet, dest).await {
            warn!(dest = %dest, error = %e, "Broadcast failed");
        }
    }

    /// Processes one received datagram. Malformed datagrams are dropped.
    pub async fn handle_datagram(&self, datagram: &[u8], sender: IpAddr) {
        let message = match DiscoveryMessage::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(sender = %sender, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        match message {
            DiscoveryMessage::Hello {
                kind,
                port,
                signature,
            } => {
                if signature == *self.signature {
                    return;
                }

                let peer = Peer::new(sender.to_string(), &signature, port.unwrap_or(DEFAULT_PORT));
                match self.peers.upsert(peer.clone()) {
                    Upsert::Added => info!(peer = %peer, "Peer discovered"),
                    Upsert::Updated => debug!(peer = %peer, "Peer re-announced"),
                }

                if kind == HelloKind::Broadcast {
                    if let Err(e) = self.announce(&HelloTarget::from(sender), Some(peer.port)).await {
                        warn!(peer = %peer, error = %e, "Failed to answer hello");
                    }
                }

                self.callbacks.peer_added(&peer);
            }
            DiscoveryMessage::Goodbye => {
                if let Some(peer) = self.peers.remove(&sender.to_string()) {
                    info!(peer = %peer, "Peer left");
                    self.callbacks.peer_removed(&peer);
                }
            }
        }
    }

    /// Receives datagrams until `cancel` fires. Socket errors are logged and
    /// the loop keeps going.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(port = self.local_port, "Discovery receive loop started");
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Discovery receive loop shutting down");
                    break;
                }

                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from.ip()).await,
                    Err(e) => warn!(error = %e, "Discovery receive error"),
                }
            }
        }
    }
}
