//! The byte stream under a connection: plain TCP or TLS over TCP.

use super::tls::{Encryption, TlsConfig};
use crate::error::ConnectError;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// An established connection to a directory server.
#[pin_project(project = TransportProj)]
#[derive(Debug)]
pub enum Transport {
    /// Unencrypted TCP.
    Plain(#[pin] TcpStream),
    /// TLS over TCP.
    Tls(#[pin] Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Connect to `host:port`, performing the TLS handshake when requested.
    ///
    /// The TLS settings are validated before any socket is opened. On a
    /// handshake failure the socket is dropped before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS settings are invalid, the socket cannot
    /// be opened, or the handshake fails.
    pub async fn connect(
        host: &str,
        port: u16,
        encryption: Encryption,
        tls: &TlsConfig,
    ) -> Result<Self, ConnectError> {
        let addr = format!("{host}:{port}");

        let tls = match encryption {
            Encryption::Disabled => None,
            Encryption::Tls => {
                let server_name = ServerName::try_from(host.to_owned())
                    .map_err(|_| ConnectError::InvalidServerName(host.to_owned()))?;
                Some((tls.connector()?, server_name))
            }
        };

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ConnectError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ConnectError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;

        let Some((connector, server_name)) = tls else {
            debug!(%addr, "connected");
            return Ok(Self::Plain(stream));
        };

        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|source| ConnectError::Handshake {
                addr: addr.clone(),
                source,
            })?;

        debug!(%addr, "TLS handshake complete");
        Ok(Self::Tls(Box::new(stream)))
    }

    /// Whether the stream is encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain(stream) => stream.poll_read(cx, buf),
            TransportProj::Tls(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Plain(stream) => stream.poll_write(cx, buf),
            TransportProj::Tls(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain(stream) => stream.poll_flush(cx),
            TransportProj::Tls(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain(stream) => stream.poll_shutdown(cx),
            TransportProj::Tls(stream) => stream.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::CertificateValidation;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut transport =
            Transport::connect("127.0.0.1", port, Encryption::Disabled, &TlsConfig::default())
                .await
                .unwrap();
        assert!(!transport.is_encrypted());

        transport.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result =
            Transport::connect("127.0.0.1", port, Encryption::Disabled, &TlsConfig::default())
                .await;
        assert!(matches!(result, Err(ConnectError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_trust_anchor_fails_before_connecting() {
        let tls = TlsConfig {
            certificate_validation: CertificateValidation::TrustedRoots(vec![
                vec![0x01].into(),
            ]),
            client_identity: None,
        };
        // Nothing listens on port 1; the TLS settings are checked first.
        let result = Transport::connect("127.0.0.1", 1, Encryption::Tls, &tls).await;
        assert!(matches!(result, Err(ConnectError::Tls(_))));
    }
}
