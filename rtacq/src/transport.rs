//! Datagram transport seam.
//!
//! The pipeline only needs "receive one datagram, with a bounded wait" and
//! "send one datagram". [`DatagramSource`] and [`DatagramSink`] capture that,
//! with UDP implementations over [`std::net::UdpSocket`]. Tests and
//! simulations plug in their own.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::{ConfigError, Result, SetupError};

/// Receiving half of a datagram transport.
pub trait DatagramSource: Send {
    /// Receives one datagram into `buf`.
    ///
    /// Returns `Ok(None)` if nothing arrived within the source's timeout so
    /// the caller can re-check its liveness flag.
    ///
    /// # Errors
    ///
    /// Returns transport failures other than a timeout.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// Sending half of a datagram transport.
pub trait DatagramSink: Send {
    /// Sends `datagram` as one unit, returning the number of bytes sent.
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    fn send(&mut self, datagram: &[u8]) -> io::Result<usize>;
}

/// UDP receiver bound to a local port.
#[derive(Debug)]
pub struct UdpSource {
    socket: UdpSocket,
}

impl UdpSource {
    /// Binds `0.0.0.0:port` with a read timeout of `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Transport`] if the socket cannot be bound or
    /// configured.
    pub fn bind(port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = format!("0.0.0.0:{port}");
        let transport = |source| SetupError::Transport {
            endpoint: endpoint.clone(),
            source,
        };

        let socket = UdpSocket::bind(&endpoint).map_err(transport)?;
        socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(transport)?;

        tracing::debug!(%endpoint, ?timeout, "bound udp source");
        Ok(Self { socket })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSource for UdpSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// UDP sender connected to one destination.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSink {
    /// Resolves `destination` (`host:port`) and connects an ephemeral socket
    /// to it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the destination does not
    /// resolve, or [`SetupError::Transport`] if the socket cannot be opened.
    pub fn connect(destination: &str) -> Result<Self> {
        let addr = destination
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidAddress {
                address: destination.to_string(),
            })?;

        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = |source| SetupError::Transport {
            endpoint: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind(local).map_err(transport)?;
        socket.connect(addr).map_err(transport)?;

        tracing::debug!(destination = %addr, "connected udp sink");
        Ok(Self {
            socket,
            destination: addr,
        })
    }

    /// The resolved destination.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl DatagramSink for UdpSink {
    fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send(datagram)
    }
}
