//! Byte streams the transport runs over.

use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

/// A connected socket of any kind.
pub type BoxedSocket = Box<dyn Socket>;

/// Opens sockets to an endpoint.
#[async_trait]
pub trait SocketFactory: Send + Sync + fmt::Debug {
    /// Connects to `endpoint`.
    async fn connect(&self, endpoint: &str) -> io::Result<BoxedSocket>;
}

/// Plain TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, endpoint: &str) -> io::Result<BoxedSocket> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_factory_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut socket = TcpSocketFactory.connect(&addr).await.unwrap();
        socket.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn tcp_factory_reports_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(TcpSocketFactory.connect(&addr).await.is_err());
    }
}
