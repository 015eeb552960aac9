use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::protocol::error::{RebuilderError, Result};
use crate::protocol::messages::{Request, Response};

use super::codec;

/// Returns true when `addr` names a UNIX socket path rather than a
/// network endpoint.
fn is_socket_path(addr: &str) -> bool {
    Path::new(addr).is_absolute()
}

/// One connection to a rebuilder endpoint, over TCP or a UNIX socket.
///
/// Every RPC call uses its own connection, which avoids serializing
/// unrelated calls through a shared stream and gives the held-open
/// `Acquire` call a connection of its own to watch.
#[derive(Debug)]
pub enum BuildStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BuildStream {
    /// Connects to `addr`, choosing the transport from its form: paths
    /// starting with `/` are dialed as UNIX sockets, everything else as
    /// TCP.
    pub async fn dial(addr: &str) -> Result<Self> {
        if is_socket_path(addr) {
            tracing::trace!(%addr, "dialing unix socket");
            let stream = UnixStream::connect(addr).await.map_err(|e| {
                RebuilderError::Connection(format!("failed to connect to {}: {}", addr, e))
            })?;
            Ok(BuildStream::Unix(stream))
        } else {
            tracing::trace!(%addr, "dialing tcp");
            let stream = TcpStream::connect(addr).await.map_err(|e| {
                RebuilderError::Connection(format!("failed to connect to {}: {}", addr, e))
            })?;
            Ok(BuildStream::Tcp(stream))
        }
    }

    /// Dials `addr` and sends the opening request frame of a call.
    pub async fn open(addr: &str, request: &Request) -> Result<Self> {
        let mut stream = Self::dial(addr).await?;
        stream.send(request).await?;
        Ok(stream)
    }

    /// Performs a complete unary call: dial, send, receive one response,
    /// unwrap error frames.
    pub async fn roundtrip(addr: &str, request: &Request) -> Result<Response> {
        let mut stream = Self::open(addr, request).await?;
        let response: Response = stream.recv().await?;
        response.into_result()
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        codec::send_frame(self, msg).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        codec::recv_frame(self).await
    }

    pub async fn try_recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        codec::try_recv_frame(self).await
    }
}

impl AsyncRead for BuildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BuildStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BuildStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BuildStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BuildStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BuildStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BuildStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BuildStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BuildStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BuildStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Listening side of [`BuildStream`]: TCP for network addresses, UNIX
/// for socket paths.
pub enum BuildListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BuildListener {
    /// Binds to `addr`. A stale socket file at a UNIX path is removed
    /// first so a restarted worker can rebind.
    pub async fn bind(addr: &str) -> Result<Self> {
        if is_socket_path(addr) {
            if Path::new(addr).exists() {
                tracing::debug!(path = %addr, "removing stale socket file");
                std::fs::remove_file(addr)?;
            }
            let listener = UnixListener::bind(addr).map_err(|e| {
                RebuilderError::Connection(format!("failed to bind to {}: {}", addr, e))
            })?;
            Ok(BuildListener::Unix(listener))
        } else {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                RebuilderError::Connection(format!("failed to bind to {}: {}", addr, e))
            })?;
            Ok(BuildListener::Tcp(listener))
        }
    }

    pub async fn accept(&self) -> Result<BuildStream> {
        match self {
            BuildListener::Tcp(l) => {
                let (stream, _) = l
                    .accept()
                    .await
                    .map_err(|e| RebuilderError::Connection(format!("accept failed: {}", e)))?;
                Ok(BuildStream::Tcp(stream))
            }
            BuildListener::Unix(l) => {
                let (stream, _) = l
                    .accept()
                    .await
                    .map_err(|e| RebuilderError::Connection(format!("accept failed: {}", e)))?;
                Ok(BuildStream::Unix(stream))
            }
        }
    }

    /// The bound address in the same form [`BuildStream::dial`] accepts.
    pub fn local_addr(&self) -> Result<String> {
        match self {
            BuildListener::Tcp(l) => {
                let addr = l.local_addr().map_err(RebuilderError::Io)?;
                Ok(addr.to_string())
            }
            BuildListener::Unix(l) => {
                let addr = l.local_addr().map_err(RebuilderError::Io)?;
                let path = addr.as_pathname().ok_or_else(|| {
                    RebuilderError::Connection("unix listener has no pathname".to_string())
                })?;
                Ok(path.to_string_lossy().into_owned())
            }
        }
    }
}
