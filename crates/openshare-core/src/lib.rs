//! OpenShare Core - P2P File Transfer Library
//!
//! Peer identity, a mutually authenticating Noise-XX handshake, an
//! authenticated encrypted record layer, a typed message codec, LAN
//! discovery, a multi-peer connection manager, and a chunked resumable
//! file-transfer engine.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod message;
pub mod peer;
pub mod record;
pub mod session;
pub mod transfer;

pub use config::ClientConfig;
pub use error::OpenShareError;
pub use identity::{LocalIdentity, RemoteIdentity};
pub use peer::{PeerEvent, PeerManager};
pub use session::Session;
pub use transfer::{TransferEngine, TransferEvent};
