//! Async adapter over `mdns-core`'s blocking `browse_blocking` (§4.F).
//!
//! `mdns-sd` is driven synchronously; this module re-browses on a fixed
//! interval from `tokio::task::spawn_blocking` and reconciles each batch
//! against a last-seen table, emitting `PeerDiscovered`/`PeerLost` on an
//! `mpsc` channel and evicting entries that go quiet for longer than the
//! TTL, so the peer manager gets a push-style stream of peer arrivals and
//! departures instead of having to drive a one-shot scan itself.

use mdns_core::discover::browse_blocking;
use mdns_core::model::{DiscoveredService, ServiceAnnouncement, TxtRecord};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Service type advertised on the LAN and browsed for during discovery.
pub const SERVICE_TYPE: &str = "_openshare._tcp.local.";
pub const PROTOCOL_VERSION: &str = "1";
const BROWSE_TIMEOUT: Duration = Duration::from_secs(4);
const RE_BROWSE_INTERVAL: Duration = Duration::from_secs(10);
/// A peer not re-observed for three browse cycles is considered gone.
const PEER_TTL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mdns error: {0}")]
    Mdns(#[from] anyhow::Error),
    #[error("discovery task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerDiscovered { peer_id: String, endpoint: Endpoint },
    PeerLost { peer_id: String },
}

/// Registers this host's service under `SERVICE_TYPE`, carrying `peer_id`
/// and the protocol version in the TXT record. The returned `Announcer`
/// keeps the underlying `mdns-sd` daemon alive; dropping it withdraws the
/// advertisement.
pub fn announce(
    peer_id: &str,
    host_name: &str,
    ip_addr: &str,
    port: u16,
) -> Result<mdns_core::announce::Announcer, DiscoveryError> {
    let txt = TxtRecord(vec![
        ("peer_id".to_string(), peer_id.to_string()),
        ("protocol_version".to_string(), PROTOCOL_VERSION.to_string()),
    ]);
    let announcement = ServiceAnnouncement {
        service_type: SERVICE_TYPE.to_string(),
        instance_name: peer_id.to_string(),
        host_name: host_name.to_string(),
        ip_addr: ip_addr.to_string(),
        port,
        txt: Some(txt),
    };
    mdns_core::announce::Announcer::register(announcement).map_err(DiscoveryError::Mdns)
}

struct LastSeen {
    endpoint: Endpoint,
    at: Instant,
}

/// Spawns the background re-browse loop and returns a receiver of
/// discovery events plus a handle to stop it by dropping or aborting.
pub fn spawn_discovery_loop() -> (mpsc::Receiver<DiscoveryEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(discovery_loop(tx));
    (rx, handle)
}

async fn discovery_loop(tx: mpsc::Sender<DiscoveryEvent>) {
    let mut last_seen: HashMap<String, LastSeen> = HashMap::new();

    loop {
        let scan = tokio::task::spawn_blocking(|| {
            browse_blocking(SERVICE_TYPE, BROWSE_TIMEOUT, "")
        })
        .await;

        let services = match scan {
            Ok(Ok(services)) => services,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "mdns browse failed");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(error = %err, "mdns browse task panicked");
                Vec::new()
            }
        };

        let now = Instant::now();
        for service in &services {
            if let Some((peer_id, endpoint)) = peer_from_service(service) {
                let is_new = !last_seen.contains_key(&peer_id);
                last_seen.insert(
                    peer_id.clone(),
                    LastSeen {
                        endpoint: endpoint.clone(),
                        at: now,
                    },
                );
                if is_new
                    && tx
                        .send(DiscoveryEvent::PeerDiscovered { peer_id, endpoint })
                        .await
                        .is_err()
                {
                    return;
                }
            }
        }

        let stale: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(seen.at) > PEER_TTL)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in stale {
            last_seen.remove(&peer_id);
            if tx
                .send(DiscoveryEvent::PeerLost { peer_id })
                .await
                .is_err()
            {
                return;
            }
        }

        tokio::time::sleep(RE_BROWSE_INTERVAL).await;
    }
}

fn peer_from_service(service: &DiscoveredService) -> Option<(String, Endpoint)> {
    let peer_id = service
        .txt
        .iter()
        .find(|(k, _)| k == "peer_id")
        .map(|(_, v)| v.clone())?;
    Some((
        peer_id,
        Endpoint {
            addresses: service.addresses.clone(),
            port: service.port,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_txt(txt: Vec<(&str, &str)>) -> DiscoveredService {
        DiscoveredService {
            fullname: "peer._openshare._tcp.local.".into(),
            instance_name: "peer".into(),
            service_type: SERVICE_TYPE.into(),
            host_name: "peer.local.".into(),
            port: 9400,
            addresses: vec!["192.168.1.5".parse().unwrap()],
            txt: txt
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn peer_from_service_extracts_peer_id_and_endpoint() {
        let service = service_with_txt(vec![("peer_id", "abc123"), ("protocol_version", "1")]);
        let (peer_id, endpoint) = peer_from_service(&service).unwrap();
        assert_eq!(peer_id, "abc123");
        assert_eq!(endpoint.port, 9400);
    }

    #[test]
    fn peer_from_service_without_peer_id_is_ignored() {
        let service = service_with_txt(vec![("protocol_version", "1")]);
        assert!(peer_from_service(&service).is_none());
    }
}
