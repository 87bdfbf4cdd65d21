//! An authenticated, encrypted duplex channel between two identities,
//! established by a successful handshake (§3 `Session`).
//!
//! Send and receive are independent: each direction has its own mutex-
//! protected [`record::DirectionalCipher`], so a reader task and a writer
//! task can drive the same session concurrently without blocking each
//! other (§5).

use crate::identity::RemoteIdentity;
use crate::message::{ProtocolError, TypedMessage};
use crate::record::{self, DirectionalCipher, TransportError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Session {
    pub remote: RemoteIdentity,
    outbound: Mutex<DirectionalCipher>,
    inbound: Mutex<DirectionalCipher>,
}

impl Session {
    pub fn new(remote: RemoteIdentity, outbound_key: [u8; 32], inbound_key: [u8; 32]) -> Self {
        Self {
            remote,
            outbound: Mutex::new(DirectionalCipher::new(outbound_key)),
            inbound: Mutex::new(DirectionalCipher::new(inbound_key)),
        }
    }

    pub async fn send<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        message: &TypedMessage,
    ) -> Result<(), SessionError> {
        let plaintext = message.encode()?;
        let mut cipher = self.outbound.lock().await;
        record::write_record(writer, &mut cipher, &plaintext).await?;
        Ok(())
    }

    pub async fn recv<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<TypedMessage, SessionError> {
        let mut cipher = self.inbound.lock().await;
        let plaintext = record::read_record(reader, &mut cipher).await?;
        drop(cipher);
        Ok(TypedMessage::decode(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Ping;

    #[tokio::test]
    async fn send_then_recv_round_trips_a_typed_message() {
        let remote = RemoteIdentity {
            public_key: [1u8; 32],
            peer_id: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
        };
        let key_a = [3u8; 32];
        let key_b = [4u8; 32];
        let sender_session = Session::new(remote.clone(), key_a, key_b);
        let receiver_session = Session::new(remote, key_b, key_a);

        let mut wire = Vec::new();
        sender_session
            .send(
                &mut wire,
                &TypedMessage::Ping(Ping {
                    timestamp_ms: 5,
                    sequence: 1,
                }),
            )
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let received = receiver_session.recv(&mut cursor).await.unwrap();
        match received {
            TypedMessage::Ping(p) => assert_eq!(p.sequence, 1),
            _ => panic!("wrong variant"),
        }
    }
}
