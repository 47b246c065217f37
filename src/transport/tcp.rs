//! TCP listener and connection streams.
//!
//! # Example
//!
//! ```ignore
//! use meshwire::transport::{WireListener, WireStream};
//!
//! let listener = WireListener::bind("127.0.0.1:0").await?;
//! let client = WireStream::connect(listener.local_addr()).await?;
//! let server_side = listener.accept().await?;
//! ```

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{Result, WireError};

/// Accepting side of the server.
pub struct WireListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WireListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept one connection, with Nagle disabled.
    pub async fn accept(&self) -> Result<WireStream> {
        let (stream, peer) = self.listener.accept().await?;
        WireStream::from_tcp(stream, peer)
    }

    /// Bound address. Resolves port 0 to the port actually assigned.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A connected socket plus its peer address.
#[derive(Debug)]
pub struct WireStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl WireStream {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        Self::from_tcp(stream, peer)
    }

    fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true).map_err(WireError::Io)?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
