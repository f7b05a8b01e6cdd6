use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voip_probe::probe::{
    CsvSink, HealthStatus, MemorySink, ProbeError, Result, Session, SessionConfig, SessionState,
    Transport, UdpTransport,
};
use voip_probe::protocol::{CodecId, CodecProfile, ProbePacket, SequenceNumber, Timestamp};
use voip_probe::server::{Reflector, ReflectorOptions, ServerCounters, ShutdownHandle};

/// Drops every `nth` outgoing datagram without telling the sender
struct DroppingTransport {
    inner: UdpTransport,
    nth: u64,
    sends: AtomicU64,
}

impl Transport for DroppingTransport {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        let count = self.sends.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.nth == 0 {
            return Ok(buf.len());
        }
        self.inner.send_datagram(buf)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv_datagram(buf)
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn loopback() -> (Arc<UdpTransport>, SessionConfig) {
    let transport = UdpTransport::loopback().unwrap();
    let target = transport.local_addr().unwrap();
    let config = SessionConfig::new(target, CodecProfile::default()).with_warmup(Duration::ZERO);
    (Arc::new(transport), config)
}

fn start_reflector() -> (SocketAddr, ServerCounters, ShutdownHandle, thread::JoinHandle<Result<()>>) {
    let counters = ServerCounters::default();
    let options = ReflectorOptions {
        echo: true,
        report_interval: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(5),
        recv_timeout: Duration::from_millis(20),
    };
    let mut reflector = Reflector::bind("127.0.0.1:0", options, counters.clone()).unwrap();
    let addr = reflector.local_addr().unwrap();
    let shutdown = reflector.shutdown_handle();
    let handle = thread::spawn(move || reflector.run());
    (addr, counters, shutdown, handle)
}

#[test]
fn test_loopback_session_completes_within_duration_and_grace() -> Result<()> {
    let (transport, config) = loopback();
    let config = config.with_duration(Duration::from_secs(5));
    let sink = MemorySink::new();
    let session = Session::new(config, transport, Box::new(sink.clone()))?;

    let start = Instant::now();
    session.start()?;
    let snapshot = session.wait_timeout(Duration::from_secs(10))?;
    let elapsed = start.elapsed();

    assert_eq!(session.state(), SessionState::Stopped);
    // duration + default 500 ms grace, plus scheduling slack
    assert!(elapsed < Duration::from_millis(5500 + 400), "took {:?}", elapsed);
    assert!(elapsed >= Duration::from_secs(5));

    assert!(
        (245..=251).contains(&snapshot.packets_sent),
        "sent {}",
        snapshot.packets_sent
    );
    assert_eq!(snapshot.packets_received, snapshot.packets_sent);
    assert_eq!(snapshot.loss_ratio, 0.0);
    assert!(snapshot.delay.is_some());
    let mos = snapshot.mos().unwrap();
    assert!(mos > 4.0, "mos {}", mos);
    assert_eq!(sink.snapshots().last(), Some(&snapshot));
    Ok(())
}

#[test]
fn test_unlimited_session_runs_until_stopped() -> Result<()> {
    let (transport, config) = loopback();
    let session = Session::new(config.with_duration(Duration::ZERO), transport, Box::new(MemorySink::new()))?;
    session.start()?;

    assert!(matches!(
        session.wait_timeout(Duration::from_millis(300)),
        Err(ProbeError::Timeout(_))
    ));
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.health().status(), HealthStatus::Healthy);

    let snapshot = session.stop()?;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(snapshot.packets_sent >= 10);
    Ok(())
}

#[test]
fn test_dropped_packets_degrade_health() -> Result<()> {
    let inner = UdpTransport::loopback()?;
    let target = inner.local_addr().unwrap();
    let transport = Arc::new(DroppingTransport {
        inner,
        nth: 4,
        sends: AtomicU64::new(0),
    });
    let config = SessionConfig::new(target, CodecProfile::default());
    let session = Session::new(config, transport, Box::new(MemorySink::new()))?;
    session.start()?;

    thread::sleep(Duration::from_millis(600));
    assert_eq!(session.health().status(), HealthStatus::Degraded);

    let snapshot = session.stop()?;
    assert!(
        (0.15..=0.35).contains(&snapshot.loss_ratio),
        "loss {}",
        snapshot.loss_ratio
    );
    assert_eq!(snapshot.send_failures, 0);
    Ok(())
}

#[test]
fn test_session_against_reflector() -> Result<()> {
    let (addr, counters, shutdown, server) = start_reflector();

    let transport = Arc::new(UdpTransport::connect_to(addr)?);
    let profile = CodecProfile::resolve("g729")?;
    let config = SessionConfig::new(addr, profile).with_duration(Duration::from_millis(500));
    let session = Session::new(config, transport, Box::new(MemorySink::new()))?;
    session.start()?;
    let snapshot = session.wait_timeout(Duration::from_secs(5))?;

    assert_eq!(snapshot.codec, "g729");
    assert!(snapshot.packets_sent > 0);
    assert_eq!(snapshot.packets_received, snapshot.packets_sent);
    assert_eq!(counters.snapshot().packets_echoed, snapshot.packets_sent);
    assert_eq!(counters.snapshot().peers, 1);

    shutdown.shutdown();
    server.join().unwrap()?;
    Ok(())
}

#[test]
fn test_reflector_echoes_valid_and_drops_malformed() {
    let (addr, counters, shutdown, server) = start_reflector();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

    let valid = ProbePacket::new(SequenceNumber(7), Timestamp(1), CodecId::Opus).encode();
    client.send_to(b"not a probe", addr).unwrap();
    client.send_to(&valid, addr).unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], &valid[..]);
    assert!(client.recv_from(&mut buf).is_err());

    let stats = counters.snapshot();
    assert_eq!(stats.packets_received, 2);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.packets_echoed, 1);

    shutdown.shutdown();
    assert!(server.join().unwrap().is_ok());
}

#[test]
fn test_csv_sink_records_time_series() -> Result<()> {
    let path = std::env::temp_dir().join(format!("voip-probe-{}.csv", std::process::id()));
    let (transport, config) = loopback();
    let config = config
        .with_duration(Duration::from_millis(600))
        .with_report_interval(Duration::from_millis(200));
    let sink = CsvSink::create(&path).unwrap();
    let session = Session::new(config, transport, Box::new(sink))?;
    session.start()?;
    session.wait_timeout(Duration::from_secs(5))?;

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("ts_utc,elapsed_s,codec"));
    // interim rows plus the final row
    assert!(lines.len() >= 3, "{} lines", lines.len());
    assert!(lines[1..].iter().all(|row| row.contains(",g711,")));
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn test_unreachable_port_fails_session() -> Result<()> {
    let closed = {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let transport = Arc::new(UdpTransport::connect_to(closed)?);
    let config = SessionConfig::new(closed, CodecProfile::default());
    let session = Session::new(config, transport, Box::new(MemorySink::new()))?;
    session.start()?;

    let err = session.wait_timeout(Duration::from_secs(5)).unwrap_err();
    assert!(err.is_fatal_transport(), "{:?}", err);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.health().status(), HealthStatus::Unhealthy);
    Ok(())
}
