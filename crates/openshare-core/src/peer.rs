//! Peer connection manager (§4.G): dials and accepts peer streams, drives
//! the handshake, and keeps the set of live sessions plus advisory
//! endpoint/dial bookkeeping, so many simultaneous peer sessions can be
//! held concurrently instead of one connection per process invocation.
//!
//! Connected peers, known endpoints, and in-flight dials live behind one
//! `tokio::sync::Mutex`-guarded struct rather than a coordinator task; see
//! DESIGN.md for why this crate picks the lock.

use crate::config::ClientConfig;
use crate::discovery::{DiscoveryEvent, Endpoint};
use crate::error::{OpenShareError, TimeoutPhase};
use crate::handshake;
use crate::identity::LocalIdentity;
use crate::message::TypedMessage;
use crate::session::Session;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use transport::DynStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    PeerDiscovered { peer_id: String, endpoint: Endpoint },
    PeerConnected { peer_id: String, direction: Direction },
    PeerDisconnected { peer_id: String, reason: String },
    PeerConnectionFailed { peer_id: String, reason: String },
    MessageReceived { peer_id: String, message: TypedMessage },
}

struct PeerHandle {
    session: Arc<Session>,
    write_half: Arc<Mutex<WriteHalf<DynStream>>>,
    direction: Direction,
    reader_task: JoinHandle<()>,
}

#[derive(Default)]
struct SharedState {
    connected: HashMap<String, PeerHandle>,
    known_endpoints: HashMap<String, Endpoint>,
    in_flight_dials: HashSet<String>,
}

pub struct PeerManager {
    identity: Arc<LocalIdentity>,
    config: ClientConfig,
    state: Mutex<SharedState>,
    events_tx: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(
        identity: Arc<LocalIdentity>,
        config: ClientConfig,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            identity,
            config,
            state: Mutex::new(SharedState::default()),
            events_tx,
        });
        (manager, events_rx)
    }

    /// Binds the listener, spawns the accept loop, and spawns the
    /// discovery-driven auto-connect loop. If the configured port is
    /// already taken, falls back to an ephemeral port and returns the one
    /// actually bound, per §4.G "If bind fails on a specifically requested
    /// port, select an ephemeral port and report the chosen port."
    pub async fn start(self: &Arc<Self>) -> Result<u16, OpenShareError> {
        let requested = format!("0.0.0.0:{}", self.config.listen_port);
        let listener = match transport::listen_tcp(&requested).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(
                    port = self.config.listen_port,
                    error = %err,
                    "requested port unavailable, falling back to an ephemeral port"
                );
                transport::listen_tcp("0.0.0.0:0").await?
            }
        };
        let bound_port = listener.local_addr()?.port();

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match transport::accept_tcp(&listener).await {
                    Ok((stream, addr)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.handle_inbound(stream, addr.to_string()).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        });

        let (mut discovery_rx, _discovery_handle) = crate::discovery::spawn_discovery_loop();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = discovery_rx.recv().await {
                manager.handle_discovery_event(event).await;
            }
        });

        Ok(bound_port)
    }

    async fn handle_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerDiscovered { peer_id, endpoint } => {
                let is_known = {
                    let mut state = self.state.lock().await;
                    let was_known = state.known_endpoints.contains_key(&peer_id)
                        || state.connected.contains_key(&peer_id);
                    state
                        .known_endpoints
                        .insert(peer_id.clone(), endpoint.clone());
                    was_known
                };
                let _ = self
                    .events_tx
                    .send(PeerEvent::PeerDiscovered {
                        peer_id: peer_id.clone(),
                        endpoint: endpoint.clone(),
                    })
                    .await;

                if !is_known {
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        let delay_ms = rand::thread_rng().gen_range(100..500);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = manager.connect_to_endpoint(Some(peer_id), endpoint).await;
                    });
                }
            }
            DiscoveryEvent::PeerLost { peer_id } => {
                let mut state = self.state.lock().await;
                state.known_endpoints.remove(&peer_id);
            }
        }
    }

    /// Dials `endpoint` as initiator, completing within the configured
    /// dial and handshake deadlines (§4.G "Timeouts").
    pub async fn connect_to_endpoint(
        self: &Arc<Self>,
        peer_id_hint: Option<String>,
        endpoint: Endpoint,
    ) -> Result<(), OpenShareError> {
        if let Some(peer_id) = &peer_id_hint {
            let mut state = self.state.lock().await;
            if state.connected.contains_key(peer_id) {
                return Ok(());
            }
            if !state.in_flight_dials.insert(peer_id.clone()) {
                return Ok(());
            }
        }

        let result = self.dial_and_handshake(&endpoint).await;

        if let Some(peer_id) = &peer_id_hint {
            let mut state = self.state.lock().await;
            state.in_flight_dials.remove(peer_id);
        }

        match result {
            Ok((session, stream)) => {
                self.register_connected(Direction::Outbound, session, stream)
                    .await;
                Ok(())
            }
            Err(err) => {
                if let Some(peer_id) = peer_id_hint {
                    let _ = self
                        .events_tx
                        .send(PeerEvent::PeerConnectionFailed {
                            peer_id,
                            reason: err.to_string(),
                        })
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn dial_and_handshake(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Session, DynStream), OpenShareError> {
        let addr = endpoint
            .addresses
            .first()
            .ok_or(OpenShareError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no address for endpoint",
            )))?;
        let dial_target = format!("{}:{}", addr, endpoint.port);

        let mut stream = tokio::time::timeout(
            Duration::from_millis(self.config.dial_timeout_ms),
            transport::dial_tcp(&dial_target),
        )
        .await
        .map_err(|_| OpenShareError::Timeout {
            phase: TimeoutPhase::Dial,
        })??;

        let session = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            handshake::initiate(&self.identity, &mut stream),
        )
        .await
        .map_err(|_| OpenShareError::Timeout {
            phase: TimeoutPhase::Handshake,
        })??;

        Ok((session, stream))
    }

    async fn handle_inbound(self: &Arc<Self>, mut stream: DynStream, source: String) {
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            handshake::respond(&self.identity, &mut stream),
        )
        .await;

        match result {
            Ok(Ok(session)) => {
                self.register_connected(Direction::Inbound, session, stream)
                    .await;
            }
            Ok(Err(err)) => {
                tracing::warn!(source, error = %err, "inbound handshake failed");
            }
            Err(_) => {
                tracing::warn!(source, "inbound handshake timed out");
            }
        }
    }

    /// Inserts a newly-handshaken session into the connected map, applying
    /// duplicate suppression and the simultaneous-open tie-break (§4.G).
    async fn register_connected(self: &Arc<Self>, direction: Direction, session: Session, stream: DynStream) {
        let peer_id = session.remote.peer_id.clone();
        let local_peer_id = self.identity.peer_id();
        let session = Arc::new(session);

        let (read_half, write_half) = tokio::io::split(stream);

        let mut state = self.state.lock().await;
        let existing_direction = state.connected.get(&peer_id).map(|h| h.direction);
        if let Some(existing_direction) = existing_direction {
            // Tie-break: the side with the lexicographically smaller
            // peer_id acts as initiator of the surviving session.
            let desired_direction = if local_peer_id < peer_id {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            if existing_direction == desired_direction {
                drop(state);
                tracing::debug!(peer_id, "dropping duplicate connection, keeping existing");
                return;
            }
            if direction != desired_direction {
                drop(state);
                tracing::debug!(peer_id, "dropping duplicate connection, neither side matches tie-break");
                return;
            }
            if let Some(old) = state.connected.remove(&peer_id) {
                old.reader_task.abort();
            }
        }

        let reader_task = self.spawn_reader(Arc::clone(&session), read_half, peer_id.clone());
        state.connected.insert(
            peer_id.clone(),
            PeerHandle {
                session,
                write_half: Arc::new(Mutex::new(write_half)),
                direction,
                reader_task,
            },
        );
        drop(state);

        let _ = self
            .events_tx
            .send(PeerEvent::PeerConnected {
                peer_id,
                direction,
            })
            .await;
    }

    fn spawn_reader(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut read_half: ReadHalf<DynStream>,
        peer_id: String,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match session.recv(&mut read_half).await {
                    Ok(message) => {
                        // §4.G: the manager answers Ping with Pong itself,
                        // independent of whatever the observer does with
                        // the forwarded event.
                        if let TypedMessage::Ping(crate::message::Ping {
                            timestamp_ms,
                            sequence,
                        }) = &message
                        {
                            let pong = TypedMessage::Pong(crate::message::Pong {
                                ping_timestamp_ms: *timestamp_ms,
                                sequence: *sequence,
                            });
                            if let Err(err) = manager.send(&peer_id, &pong).await {
                                tracing::warn!(peer_id, error = %err, "failed to reply to ping");
                            }
                        }
                        let _ = manager
                            .events_tx
                            .send(PeerEvent::MessageReceived {
                                peer_id: peer_id.clone(),
                                message,
                            })
                            .await;
                    }
                    Err(err) => {
                        manager.handle_session_closed(&peer_id, err.to_string()).await;
                        break;
                    }
                }
            }
        })
    }

    async fn handle_session_closed(&self, peer_id: &str, reason: String) {
        let mut state = self.state.lock().await;
        state.connected.remove(peer_id);
        drop(state);
        let _ = self
            .events_tx
            .send(PeerEvent::PeerDisconnected {
                peer_id: peer_id.to_string(),
                reason,
            })
            .await;
    }

    /// Sends one typed message to `peer_id`. Fails with `NotConnected`-
    /// shaped io error if the peer isn't in the connected map.
    pub async fn send(&self, peer_id: &str, message: &TypedMessage) -> Result<(), OpenShareError> {
        let state = self.state.lock().await;
        let handle = state
            .connected
            .get(peer_id)
            .ok_or_else(|| OpenShareError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("not connected to {peer_id}"),
            )))?;
        let session = Arc::clone(&handle.session);
        let write_half = Arc::clone(&handle.write_half);
        drop(state);

        let mut guard = write_half.lock().await;
        let result = session.send(&mut *guard, message).await;
        drop(guard);
        result.map_err(|_| {
            OpenShareError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session write failed",
            ))
        })
    }

    pub async fn broadcast(&self, message: &TypedMessage) {
        let peer_ids: Vec<String> = {
            let state = self.state.lock().await;
            state.connected.keys().cloned().collect()
        };
        for peer_id in peer_ids {
            let _ = self.send(&peer_id, message).await;
        }
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.state.lock().await.connected.contains_key(peer_id)
    }

    pub async fn connected_peer_ids(&self) -> Vec<String> {
        self.state.lock().await.connected.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn mutual_connect_establishes_session_on_both_sides() {
        let identity_a = Arc::new(LocalIdentity::generate());
        let identity_b = Arc::new(LocalIdentity::generate());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config_a = ClientConfig::default();
        config_a.listen_port = addr.port();
        let mut config_b = ClientConfig::default();
        config_b.listen_port = 0;

        let (manager_a, mut events_a) = PeerManager::new(identity_a, config_a);
        manager_a.start().await.unwrap();

        let (manager_b, mut events_b) = PeerManager::new(identity_b.clone(), config_b);

        let endpoint = Endpoint {
            addresses: vec!["127.0.0.1".parse().unwrap()],
            port: addr.port(),
        };
        manager_b
            .connect_to_endpoint(None, endpoint)
            .await
            .unwrap();

        let event_a = events_a.recv().await.unwrap();
        assert!(matches!(event_a, PeerEvent::PeerConnected { .. }));
        let event_b = events_b.recv().await.unwrap();
        assert!(matches!(event_b, PeerEvent::PeerConnected { .. }));
    }
}
