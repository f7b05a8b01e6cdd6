use crate::probe::error::{ProbeError, Result};
use crate::probe::socket::{is_transient, Transport};
use crate::protocol::{Clock, CodecProfile, ProbePacket, SequenceNumber};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// What happened to the packet built for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { sequence: SequenceNumber, bytes: usize },
    /// Transient failure survived the retry; the sequence number is spent
    Dropped { sequence: SequenceNumber },
}

/// Builds and transmits one probe packet per pacer tick
pub struct Sender<T: Transport + ?Sized> {
    transport: Arc<T>,
    profile: CodecProfile,
    clock: Clock,
    next_sequence: SequenceNumber,
    last_sequence: Option<u32>,
    started: Instant,
    sent: u64,
    failures: u64,
}

impl<T: Transport + ?Sized> Sender<T> {
    pub fn new(transport: Arc<T>, profile: CodecProfile, clock: Clock) -> Self {
        Self {
            transport,
            profile,
            clock,
            next_sequence: SequenceNumber(0),
            last_sequence: None,
            started: Instant::now(),
            sent: 0,
            failures: 0,
        }
    }

    /// Transmit exactly one packet
    pub fn on_tick(&mut self) -> Result<SendOutcome> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        self.last_sequence = Some(sequence.0);

        let packet = ProbePacket::new(sequence, self.clock.now(), self.profile.id);
        let buf = packet.encode();

        match self.transmit(&buf) {
            Ok(bytes) => {
                self.sent += 1;
                debug!(sequence = sequence.0, bytes_sent = bytes, "Packet sent");
                Ok(SendOutcome::Sent { sequence, bytes })
            }
            Err(e) if is_transient(&e) => {
                self.failures += 1;
                warn!(sequence = sequence.0, error = %e, "Send failed twice, packet dropped");
                Ok(SendOutcome::Dropped { sequence })
            }
            Err(e) => {
                warn!(sequence = sequence.0, error = %e, "Fatal send error");
                Err(ProbeError::FatalTransport {
                    source: e,
                    last_sequence: self.last_sequence,
                    elapsed: self.started.elapsed(),
                })
            }
        }
    }

    fn transmit(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self.transport.send_datagram(buf) {
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Transient send error, retrying once");
                self.transport.send_datagram(buf)
            }
            other => other,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.sent
    }

    pub fn send_failures(&self) -> u64 {
        self.failures
    }

    /// Sequence number of the most recently built packet
    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }
}
