//! Client connection: the accepted socket behind a swappable transport.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::http::{BoxedIo, BufferedConn};

/// The client side of a proxied connection.
///
/// Downstream code only sees the buffered handle; the inner transport is
/// replaced exactly once when TLS interception succeeds.
pub struct ClientConnection {
    io: BufferedConn<BoxedIo>,
    peer: SocketAddr,
    tls_intercepted: bool,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            io: BufferedConn::new(Box::new(stream), buffer_size),
            peer,
            tls_intercepted: false,
        }
    }

    /// Rebuilds the connection around the TLS-wrapped transport after a
    /// successful interception handshake.
    pub(crate) fn resume_tls(io: BufferedConn<BoxedIo>, peer: SocketAddr) -> Self {
        Self {
            io,
            peer,
            tls_intercepted: true,
        }
    }

    pub fn io(&mut self) -> &mut BufferedConn<BoxedIo> {
        &mut self.io
    }

    pub(crate) fn into_io(self) -> BufferedConn<BoxedIo> {
        self.io
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls_intercepted(&self) -> bool {
        self.tls_intercepted
    }
}
