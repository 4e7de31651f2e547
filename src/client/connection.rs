//! A single frontend/backend connection.
//!
//! [`Connection`] owns the duplex byte stream (plain TCP or TLS), the
//! backend parameters collected during startup, and the backend key. All
//! request/response exchanges on a connection must be serialized by the
//! owner; see [`SqlClient`](super::sql::SqlClient) for the mutex that
//! enforces this.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use crate::protocol::backend::BackendMessage;
use crate::protocol::framing::{self, Frame};
use crate::protocol::frontend;

#[cfg(not(feature = "tls-rustls"))]
use crate::config::SslMode;

/// The underlying byte stream, optionally TLS-wrapped.
pub enum PgStream {
    Plain(TcpStream),
    #[cfg(feature = "tls-rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls-rustls")]
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls-rustls")]
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls-rustls")]
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls-rustls")]
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// PID + secret of the server backend, used for query cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// An open connection, before or after the startup handshake.
pub struct Connection {
    stream: PgStream,
    peer_cert_sha256: Option<[u8; 32]>,
    /// ParameterStatus values collected during startup and afterwards.
    pub parameters: HashMap<String, String>,
    pub backend_key: Option<BackendKey>,
    closed: bool,
}

impl Connection {
    /// Open a TCP connection and negotiate TLS per the config.
    ///
    /// TCP keepalive is enabled; Nagle is left at the OS default. A refused
    /// or unreachable peer surfaces as `Unavailable`.
    pub async fn open(host: &str, port: u16, tls: &TlsConfig) -> Result<Connection> {
        let tcp = TcpStream::connect((host, port)).await?;
        socket2::SockRef::from(&tcp).set_keepalive(true)?;

        #[cfg(feature = "tls-rustls")]
        let (stream, peer_cert_sha256) = {
            use crate::tls::Upgraded;
            match crate::tls::maybe_upgrade(tcp, tls, host).await? {
                Upgraded::Plain(s) => (PgStream::Plain(s), None),
                Upgraded::Tls {
                    stream,
                    cert_sha256,
                } => (PgStream::Tls(stream), Some(cert_sha256)),
            }
        };

        #[cfg(not(feature = "tls-rustls"))]
        let (stream, peer_cert_sha256) = {
            if !matches!(tls.mode, SslMode::Disable) {
                return Err(Error::Unsupported(
                    "TLS requested but the tls-rustls feature is disabled".into(),
                ));
            }
            (PgStream::Plain(tcp), None)
        };

        Ok(Connection {
            stream,
            peer_cert_sha256,
            parameters: HashMap::new(),
            backend_key: None,
            closed: false,
        })
    }

    /// SHA-256 of the server's end-entity certificate, when on TLS.
    pub fn certificate_hash(&self) -> Option<[u8; 32]> {
        self.peer_cert_sha256
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the connection unusable without touching the socket. Used by
    /// the desynchronization path where the stream state is unknown.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Incorrect("Disconnected from server".into()));
        }
        Ok(())
    }

    /// Read one frame. Reads MUST NOT be interleaved by multiple callers.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.check_open()?;
        framing::read_frame(&mut self.stream).await
    }

    /// Read and decode one backend message.
    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        let frame = self.read_frame().await?;
        BackendMessage::decode(&frame)
    }

    /// Write pre-encoded frame bytes and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        framing::write_all_flush(&mut self.stream, bytes).await
    }

    /// Best-effort Terminate, then close the stream.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut buf = BytesMut::with_capacity(5);
        frontend::put_terminate(&mut buf);
        let _ = framing::write_all_flush(&mut self.stream, &buf).await;
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }

    /// Split into read and write halves for the replication reader/flusher
    /// pair. The connection bookkeeping stays with the caller.
    pub fn into_split(
        self,
    ) -> (
        tokio::io::ReadHalf<PgStream>,
        tokio::io::WriteHalf<PgStream>,
    ) {
        tokio::io::split(self.stream)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tls", &self.peer_cert_sha256.is_some())
            .field("closed", &self.closed)
            .field("backend_key", &self.backend_key)
            .finish_non_exhaustive()
    }
}
