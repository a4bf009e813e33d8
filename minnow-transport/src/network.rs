//! Network provider abstraction.
//!
//! The transport client only needs outbound connections. [`TokioNetworkProvider`]
//! opens real TCP sockets; [`MemoryNetworkProvider`] hands out in-process
//! duplex pipes so a scripted proxy can sit on the other end in tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

/// Provider trait for opening the physical connection to a proxy.
///
/// Single-threaded design, no Send bounds needed.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The stream type for this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Connect to `addr` (`host:port`).
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Buffer size of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// In-process network made of duplex pipes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetworkProvider {
    listeners: Rc<RefCell<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>,
}

impl MemoryNetworkProvider {
    /// Create an empty network; every address refuses connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections for `addr`, replacing any previous listener.
    pub fn listen(&self, addr: &str) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.borrow_mut().insert(addr.to_string(), tx);
        MemoryListener { incoming: rx }
    }

    /// Stop accepting connections for `addr`.
    pub fn close(&self, addr: &str) {
        self.listeners.borrow_mut().remove(addr);
    }
}

#[async_trait(?Send)]
impl NetworkProvider for MemoryNetworkProvider {
    type TcpStream = DuplexStream;

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let listeners = self.listeners.borrow();
        let tx = listeners.get(addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {}", addr))
        })?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;
        Ok(client)
    }
}

/// Server side of a [`MemoryNetworkProvider`] address.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }

    /// Next connection if one is already waiting.
    pub fn try_accept(&mut self) -> Option<DuplexStream> {
        self.incoming.try_recv().ok()
    }
}
