//! Reliable duplex byte stream abstraction used by the peer manager (§6).
//!
//! `StreamTrait`/`DynStream` let the peer manager hold dialed and accepted
//! connections behind one trait object regardless of which concrete
//! transport produced them. TCP is the only concrete implementation
//! shipped; the type was kept generic so a future transport (e.g. QUIC)
//! can be dropped in without touching callers.

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A trait object combining AsyncRead + AsyncWrite + Unpin + Send.
/// A custom trait avoids the E0225 multiple-non-auto-traits error when
/// naming the combination directly as `dyn`.
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> StreamTrait for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for a boxed, pinned duplex stream.
pub type DynStream = Pin<Box<dyn StreamTrait>>;

/// Dials `addr` over TCP and returns it boxed as a `DynStream`.
pub async fn dial_tcp(addr: &str) -> std::io::Result<DynStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Box::pin(stream))
}

/// Binds a TCP listener on `addr` for accepting incoming peer connections.
pub async fn listen_tcp(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accepts one connection from `listener`, returning the peer's socket
/// address alongside the boxed stream.
pub async fn accept_tcp(
    listener: &TcpListener,
) -> std::io::Result<(DynStream, std::net::SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((Box::pin(stream), addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_round_trip_bytes() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = accept_tcp(&listener).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = dial_tcp(&addr.to_string()).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(&received, b"hello");
    }
}
