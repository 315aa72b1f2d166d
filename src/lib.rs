//! duktolan - LAN peer discovery and file sharing
//!
//! A transfer engine that speaks the Dukto protocol: peers find each other
//! through UDP broadcast, and files, directory trees or text snippets are
//! streamed over a single TCP connection after the receiver approves.
//!
//! # Architecture
//!
//! Everything lives in [`net`]:
//!
//! - **Wire codec**: discovery datagrams and the element stream framing
//! - **Peer directory**: known peers keyed by address
//! - **Discovery**: announces this instance and keeps the directory current
//! - **Transfer sessions**: one send or receive with collision-safe naming
//! - **Engine**: serializes transfers, gates inbound ones on approval
//!
//! At most one transfer is active per engine. Callers drive the engine with
//! commands and observe it through [`net::EngineCallbacks`].
//!
//! # Example
//!
//! ```rust,ignore
//! use duktolan::net::{Engine, EngineCallbacks, EngineConfig};
//!
//! let engine = Engine::with_config(
//!     EngineConfig::from_env(),
//!     EngineCallbacks::new().on_receive_complete(|paths, total| {
//!         println!("received {} entries ({total} bytes)", paths.len());
//!     }),
//! );
//! engine.initialize().await?;
//! ```

pub mod net;

pub use net::{Engine, EngineCallbacks, EngineConfig};
