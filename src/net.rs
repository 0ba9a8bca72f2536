//! Stream transport abstraction
//!
//! The session layer only needs ordered, reliable byte streams with
//! accept/dial semantics. NAT traversal and the reliable-over-UDP
//! machinery live behind these traits; [`TcpTransport`] is the default
//! implementation.

use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{MeshError, NetworkError};

/// Pending connections queued by the kernel
const LISTEN_BACKLOG: i32 = 1024;

/// One established byte-stream connection
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Remote transport address, if the transport has one
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Type-erased connection handed between layers
pub type BoxConnection = Box<dyn Connection>;

impl Connection for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Connection for DuplexStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A listening socket
///
/// `accept` must be cancel-safe: the listener races it against its stop
/// signal.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<BoxConnection, MeshError>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Factory for listeners and outbound connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Acceptor>, MeshError>;

    async fn dial(&self, addr: SocketAddr) -> Result<BoxConnection, MeshError>;
}

/// TCP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

/// Listening TCP socket
pub struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<BoxConnection, MeshError> {
        let (stream, _) = self.listener.accept().await.map_err(|e| {
            NetworkError::AcceptFailed {
                reason: e.to_string(),
            }
        })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Acceptor>, MeshError> {
        let listener = bind_listener(addr).map_err(|e| NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(TcpAcceptor { listener }))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<BoxConnection, MeshError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::DialFailed {
                endpoint: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        Ok(Box::new(stream))
    }
}

/// Bind with SO_REUSEADDR so a restarted node gets its port back at once
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}
