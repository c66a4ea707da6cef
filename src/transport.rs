// Copyright 2026 Highway RPC Developers

//! Dialing and accepting the byte streams frames travel over.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;

#[cfg(feature = "tls")]
use std::sync::Arc;

#[cfg(feature = "tls")]
use crate::error::HighwayError;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::pki_types::ServerName;
#[cfg(feature = "tls")]
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};

/// Anything a connection can run over: plain TCP or TLS on top of it.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn Stream>;

/// Client side: how to reach a destination.
#[derive(Clone, Default)]
pub enum Connector {
    #[default]
    Tcp,
    #[cfg(feature = "tls")]
    Tls(TlsConnector),
}

impl Connector {
    #[cfg(feature = "tls")]
    pub fn tls(config: Arc<rustls::ClientConfig>) -> Connector {
        Connector::Tls(TlsConnector::from(config))
    }

    /// Dials `addr` ("host:port"). `timeout` bounds the TCP connect and, for
    /// TLS, the TLS handshake.
    pub async fn connect(&self, addr: &str, timeout: Duration) -> Result<BoxedStream> {
        tokio::time::timeout(timeout, self.dial(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, timeout),
                )
            })?
    }

    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        match self {
            Connector::Tcp => Ok(Box::new(tcp)),
            #[cfg(feature = "tls")]
            Connector::Tls(connector) => {
                let tls = connector.connect(server_name(addr)?, tcp).await?;
                Ok(Box::new(tls))
            }
        }
    }
}

#[cfg(feature = "tls")]
fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| HighwayError::Config(format!("bad TLS server name {:?}: {}", host, e)))
}

/// Server side: what to do with a freshly accepted socket.
#[derive(Clone, Default)]
pub enum Acceptor {
    #[default]
    Plain,
    #[cfg(feature = "tls")]
    Tls(TlsAcceptor),
}

impl Acceptor {
    #[cfg(feature = "tls")]
    pub fn tls(config: Arc<rustls::ServerConfig>) -> Acceptor {
        Acceptor::Tls(TlsAcceptor::from(config))
    }

    pub async fn accept(&self, tcp: TcpStream) -> Result<BoxedStream> {
        tcp.set_nodelay(true)?;
        match self {
            Acceptor::Plain => Ok(Box::new(tcp)),
            #[cfg(feature = "tls")]
            Acceptor::Tls(acceptor) => Ok(Box::new(acceptor.accept(tcp).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::error::HighwayError;

    #[tokio::test]
    async fn tcp_connect_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = Acceptor::default().accept(tcp).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = Connector::default()
            .connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn refused_connect_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let res = Connector::Tcp.connect(&addr, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(HighwayError::Io(_))));
    }
}
