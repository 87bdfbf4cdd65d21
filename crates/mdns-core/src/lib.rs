//! Thin synchronous wrapper over `mdns-sd` for LAN service announcement and
//! discovery. Async callers (see `openshare-core::discovery`) drive this
//! from `tokio::task::spawn_blocking`.

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;
