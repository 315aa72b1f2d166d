//! Networking module for duktolan
//!
//! This module provides all networking functionality for LAN file sharing
//! over the Dukto protocol, including:
//!
//! - **Wire**: Binary codecs for discovery datagrams and transfer streams
//! - **Peers**: Directory of peers discovered on the local network
//! - **Discovery**: UDP broadcast announcements and the receive loop
//! - **Transfer**: One send or receive session over a stream connection
//! - **Engine**: Single-transfer coordination, approval gate and lifecycle
//!
//! # Example
//!
//! ```rust,ignore
//! use duktolan::net::{Engine, EngineCallbacks, HelloTarget};
//!
//! let callbacks = EngineCallbacks::new()
//!     .on_peer_added(|peer| println!("found {peer}"))
//!     .on_receive_request(|sender| println!("{sender} wants to send"));
//!
//! let engine = Engine::new(callbacks);
//! engine.initialize().await?;
//! engine.say_hello(HelloTarget::Broadcast, None).await?;
//!
//! engine.send_file("192.168.1.20", vec!["photo.jpg".into()], 0)?;
//! ```

pub mod discovery;
pub mod engine;
pub mod events;
pub mod peers;
pub mod transfer;
pub mod wire;

pub use discovery::{system_signature, Discovery, HelloTarget};
pub use engine::{Engine, EngineConfig, EngineError, SessionState};
pub use events::{EngineCallbacks, SentPayload};
pub use peers::{Peer, PeerDirectory};
pub use transfer::{TransferDirection, TransferError, TransferProgress};
pub use wire::{DiscoveryMessage, WireError, DEFAULT_PORT, TEXT_MARKER};
