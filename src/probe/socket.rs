use crate::probe::error::{ProbeError, Result};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Datagram transport used by the send and receive paths.
///
/// Both paths hold the same transport concurrently, so every method takes
/// `&self`.
pub trait Transport: Send + Sync {
    /// Send one datagram to the connected peer
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram, honouring the read timeout
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Set the read timeout for the receive path
    fn set_timeout(&self, timeout: Duration) -> io::Result<()>;

    /// Local address, if the transport is bound
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Whether a send failure is worth one immediate retry
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    ) || err.raw_os_error() == Some(ENOBUFS)
}

/// Whether a receive error just means "nothing arrived yet"
pub fn is_idle_receive(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Connected UDP implementation of `Transport`
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to a local address
    pub fn bind(addr: &str) -> Result<Self> {
        debug!(addr = addr, "Binding UDP socket");
        let socket = UdpSocket::bind(addr).map_err(|e| {
            warn!(error = %e, "Failed to bind socket");
            ProbeError::Socket(format!("Failed to bind to {}: {}", addr, e))
        })?;
        debug!("Socket bound successfully");
        Ok(Self { socket })
    }

    /// Bind an ephemeral port of the matching address family and connect to `target`
    pub fn connect_to(target: SocketAddr) -> Result<Self> {
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = Self::bind(local)?;
        transport.connect(target)?;
        Ok(transport)
    }

    /// A socket connected to itself: every probe comes straight back to the
    /// sender, which measures the local stack only.
    pub fn loopback() -> Result<Self> {
        let transport = Self::bind("127.0.0.1:0")?;
        let addr = transport
            .socket
            .local_addr()
            .map_err(|e| ProbeError::Socket(format!("Failed to read local address: {}", e)))?;
        transport.connect(addr)?;
        Ok(transport)
    }

    /// Connect to a remote address
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        debug!(addr = %addr, "Connecting UDP socket");
        self.socket.connect(addr).map_err(|e| {
            warn!(error = %e, "Failed to connect socket");
            ProbeError::Socket(format!("Failed to connect to {}: {}", addr, e))
        })?;
        debug!("Socket connected successfully");
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        debug!(timeout_ms = timeout.as_millis() as u64, "Setting socket timeout");
        self.socket.set_read_timeout(Some(timeout))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Transport {}

        impl Transport for Transport {
            fn send_datagram(&self, buf: &[u8]) -> io::Result<usize>;
            fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;
            fn set_timeout(&self, timeout: Duration) -> io::Result<()>;
            fn local_addr(&self) -> io::Result<SocketAddr>;
        }
    }

    #[test]
    fn test_udp_socket_bind() {
        let socket = UdpTransport::bind("127.0.0.1:0");
        assert!(socket.is_ok());
    }

    #[test]
    fn test_bind_invalid_address() {
        let err = UdpTransport::bind("not-an-address").unwrap_err();
        assert!(matches!(err, ProbeError::Socket(_)));
    }

    #[test]
    fn test_loopback_round_trip() -> Result<()> {
        let transport = UdpTransport::loopback()?;
        transport
            .set_timeout(Duration::from_millis(500))
            .map_err(|e| ProbeError::Socket(e.to_string()))?;

        transport.send_datagram(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let len = transport.recv_datagram(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        Ok(())
    }

    #[test]
    fn test_error_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from_raw_os_error(ENOBUFS)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_idle_receive(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_idle_receive(&io::Error::from(io::ErrorKind::NotConnected)));
    }
}

#[cfg(test)]
pub use tests::MockTransport;
