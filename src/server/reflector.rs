//! UDP reflector: echoes probe packets and keeps per-peer statistics
//!
//! Each datagram that decodes as a probe packet is sent back to its source
//! unchanged. The same packet feeds a one-way `StatsEngine` for that peer,
//! so the reflector can log what it sees without any help from the client.
//! Undecodable datagrams are counted and dropped, never echoed.

use crate::probe::error::{ProbeError, Result};
use crate::probe::sink::{LogSink, ResultsSink};
use crate::probe::socket::is_idle_receive;
use crate::probe::statistics::{DelayMode, MetricSnapshot, StatsConfig, StatsEngine};
use crate::protocol::{Clock, CodecProfile, ProbePacket, Timestamp, MAX_PACKET_SIZE};
use crate::server::monitor::ServerCounters;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Peers tracked at once; traffic from further peers is echoed but not measured
pub const MAX_TRACKED_PEERS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectorOptions {
    pub echo: bool,
    pub report_interval: Duration,
    pub idle_timeout: Duration,
    pub recv_timeout: Duration,
}

struct PeerState {
    engine: StatsEngine,
    last_seen: Instant,
}

/// Stops a running reflector from another thread
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub struct Reflector {
    socket: UdpSocket,
    options: ReflectorOptions,
    counters: ServerCounters,
    clock: Clock,
    peers: HashMap<SocketAddr, PeerState>,
    shutdown: ShutdownHandle,
}

impl Reflector {
    pub fn bind(addr: &str, options: ReflectorOptions, counters: ServerCounters) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ProbeError::Socket(format!(
                    "Failed to bind to {}: Address already in use. Try a different port or ensure no other process is using it.",
                    addr
                ))
            } else {
                ProbeError::Socket(format!("Failed to bind to {}: {}", addr, e))
            }
        })?;
        socket
            .set_read_timeout(Some(options.recv_timeout))
            .map_err(|e| ProbeError::Socket(format!("Failed to set read timeout: {}", e)))?;

        Ok(Self {
            socket,
            options,
            counters,
            clock: Clock::new(),
            peers: HashMap::new(),
            shutdown: ShutdownHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| ProbeError::Socket(format!("Failed to read local address: {}", e)))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Current statistics for one peer
    pub fn peer_snapshot(&self, peer: &SocketAddr) -> Option<MetricSnapshot> {
        self.peers.get(peer).map(|p| p.engine.snapshot())
    }

    /// Serve until the shutdown handle is triggered
    pub fn run(&mut self) -> Result<()> {
        info!(
            address = %self.local_addr()?,
            echo = self.options.echo,
            "Reflector listening"
        );
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut next_report = Instant::now() + self.options.report_interval;

        while !self.shutdown.is_shutdown() {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => self.handle_datagram(&buf[..len], peer),
                Err(e) if is_idle_receive(&e) => {}
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    self.counters.increment_error();
                    debug!(error = %e, "Receive error");
                }
            }

            let now = Instant::now();
            if now >= next_report {
                self.report_peers(&mut LogSink);
                self.evict_idle(now);
                next_report = now + self.options.report_interval;
            }
        }

        info!(peers = self.peers.len(), "Reflector shutting down");
        self.report_peers(&mut LogSink);
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let arrival = self.clock.now();
        self.counters.increment_received();

        let packet = match ProbePacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters.increment_malformed();
                debug!(peer = %peer, bytes = datagram.len(), error = %e, "Dropping malformed datagram");
                return;
            }
        };

        if self.options.echo {
            match self.socket.send_to(datagram, peer) {
                Ok(_) => self.counters.increment_echoed(),
                Err(e) => {
                    self.counters.increment_error();
                    warn!(peer = %peer, error = %e, "Failed to echo packet");
                }
            }
        }

        self.track(peer, &packet, arrival);
    }

    fn track(&mut self, peer: SocketAddr, packet: &ProbePacket, arrival: Timestamp) {
        if !self.peers.contains_key(&peer) {
            if self.peers.len() >= MAX_TRACKED_PEERS {
                debug!(peer = %peer, "Peer table full, not tracking");
                return;
            }
            let config = StatsConfig::new(CodecProfile::from_id(packet.codec), DelayMode::OneWay);
            let engine = match StatsEngine::new(config) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to create peer statistics");
                    return;
                }
            };
            info!(peer = %peer, codec = CodecProfile::from_id(packet.codec).name, "New peer");
            self.peers.insert(
                peer,
                PeerState {
                    engine,
                    last_seen: Instant::now(),
                },
            );
            self.counters.set_peers(self.peers.len());
        }

        if let Some(state) = self.peers.get_mut(&peer) {
            state.engine.on_packet_arrival(packet, arrival);
            state.last_seen = Instant::now();
        }
    }

    fn report_peers(&self, sink: &mut dyn ResultsSink) {
        for (peer, state) in &self.peers {
            let _span = info_span!("peer", addr = %peer).entered();
            if let Err(e) = sink.write(&state.engine.snapshot()) {
                self.counters.increment_error();
                warn!(peer = %peer, error = %e, "Failed to report peer statistics");
            }
        }
    }

    fn evict_idle(&mut self, now: Instant) {
        let idle_timeout = self.options.idle_timeout;
        self.peers.retain(|peer, state| {
            let keep = now.duration_since(state.last_seen) < idle_timeout;
            if !keep {
                let snapshot = state.engine.snapshot();
                info!(
                    peer = %peer,
                    received = snapshot.packets_received,
                    loss_pct = snapshot.loss_percent(),
                    "Peer idle, statistics discarded"
                );
            }
            keep
        });
        self.counters.set_peers(self.peers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::error::SinkError;
    use crate::protocol::{CodecId, SequenceNumber};
    use std::thread;

    struct FailingSink;

    impl ResultsSink for FailingSink {
        fn write(&mut self, _: &MetricSnapshot) -> std::result::Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        }
    }

    fn options() -> ReflectorOptions {
        ReflectorOptions {
            echo: true,
            report_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(100),
            recv_timeout: Duration::from_millis(20),
        }
    }

    fn client_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        socket
    }

    #[test]
    fn test_echo_and_tracking() {
        let counters = ServerCounters::default();
        let mut reflector = Reflector::bind("127.0.0.1:0", options(), counters.clone()).unwrap();
        let addr = reflector.local_addr().unwrap();
        let client = client_socket();
        let peer = client.local_addr().unwrap();

        for seq in [0u32, 1, 3] {
            let bytes = ProbePacket::new(SequenceNumber(seq), Timestamp(0), CodecId::G729).encode();
            reflector.handle_datagram(&bytes, peer);

            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (len, from) = client.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], &bytes[..]);
            assert_eq!(from.port(), addr.port());
        }

        let snapshot = reflector.peer_snapshot(&peer).unwrap();
        assert_eq!(snapshot.codec, "g729");
        assert_eq!(snapshot.delay_mode, DelayMode::OneWay);
        assert_eq!(snapshot.packets_received, 3);
        assert_eq!(snapshot.packets_expected, 4);
        assert_eq!(counters.snapshot().packets_echoed, 3);
        assert_eq!(counters.snapshot().peers, 1);
    }

    #[test]
    fn test_malformed_not_echoed() {
        let counters = ServerCounters::default();
        let mut reflector = Reflector::bind("127.0.0.1:0", options(), counters.clone()).unwrap();
        let client = client_socket();
        client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let peer = client.local_addr().unwrap();

        reflector.handle_datagram(b"garbage", peer);

        let mut buf = [0u8; 64];
        assert!(client.recv_from(&mut buf).is_err());
        let stats = counters.snapshot();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.packets_echoed, 0);
        assert_eq!(reflector.peer_count(), 0);
    }

    #[test]
    fn test_no_echo_still_measures() {
        let counters = ServerCounters::default();
        let options = ReflectorOptions {
            echo: false,
            ..options()
        };
        let mut reflector = Reflector::bind("127.0.0.1:0", options, counters.clone()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let bytes = ProbePacket::new(SequenceNumber(0), Timestamp(0), CodecId::G711).encode();
        reflector.handle_datagram(&bytes, peer);
        assert_eq!(counters.snapshot().packets_echoed, 0);
        assert_eq!(reflector.peer_snapshot(&peer).unwrap().packets_received, 1);
    }

    #[test]
    fn test_peer_report_failure_is_counted() {
        let counters = ServerCounters::default();
        let options = ReflectorOptions {
            echo: false,
            ..options()
        };
        let mut reflector = Reflector::bind("127.0.0.1:0", options, counters.clone()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let bytes = ProbePacket::new(SequenceNumber(0), Timestamp(0), CodecId::G711).encode();
        reflector.handle_datagram(&bytes, peer);

        reflector.report_peers(&mut LogSink);
        assert_eq!(counters.snapshot().errors, 0);
        reflector.report_peers(&mut FailingSink);
        assert_eq!(counters.snapshot().errors, 1);
        assert_eq!(reflector.peer_count(), 1);
    }

    #[test]
    fn test_idle_peers_evicted() {
        let counters = ServerCounters::default();
        let options = ReflectorOptions {
            echo: false,
            ..options()
        };
        let mut reflector = Reflector::bind("127.0.0.1:0", options, counters.clone()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let bytes = ProbePacket::new(SequenceNumber(0), Timestamp(0), CodecId::Opus).encode();
        reflector.handle_datagram(&bytes, peer);

        reflector.evict_idle(Instant::now());
        assert_eq!(reflector.peer_count(), 1);
        reflector.evict_idle(Instant::now() + Duration::from_secs(1));
        assert_eq!(reflector.peer_count(), 0);
        assert_eq!(counters.snapshot().peers, 0);
    }

    #[test]
    fn test_run_until_shutdown() {
        let mut reflector = Reflector::bind("127.0.0.1:0", options(), ServerCounters::default()).unwrap();
        let shutdown = reflector.shutdown_handle();
        let server = thread::spawn(move || reflector.run());

        thread::sleep(Duration::from_millis(100));
        shutdown.shutdown();
        assert!(server.join().unwrap().is_ok());
    }
}
