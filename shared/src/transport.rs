//! Outbound packet channels and an in-process link with simulated latency and loss

use crate::sync::lock;
use crate::Packet;
use log::{trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Ordered and never dropped.
    Reliable,
    /// May be dropped.
    Unreliable,
}

/// Where drivers hand their outgoing packets.
pub trait PacketSink: Send {
    fn send(&mut self, packet: Packet, reliability: Reliability);
}

/// Sink that discards everything, for peers with nobody to talk to.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn send(&mut self, _packet: Packet, _reliability: Reliability) {}
}

/// Sink that keeps every packet, for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<(Packet, Reliability)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Packet, Reliability)> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn len(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sent).is_empty()
    }
}

impl PacketSink for RecordingSink {
    fn send(&mut self, packet: Packet, reliability: Reliability) {
        lock(&self.sent).push((packet, reliability));
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
}

struct LinkState {
    latency_frames: u64,
    loss: f64,
    rng: StdRng,
    frame: u64,
    in_flight: VecDeque<(u64, Vec<u8>)>,
    stats: LinkStats,
}

/// One-directional in-process link. Packets are serialized on send and
/// delivered `latency_frames` frames later; unreliable ones may be lost.
#[derive(Clone)]
pub struct LoopbackLink {
    state: Arc<Mutex<LinkState>>,
}

impl LoopbackLink {
    pub fn new(latency_frames: u64, loss: f64, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                latency_frames,
                loss: loss.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
                frame: 0,
                in_flight: VecDeque::new(),
                stats: LinkStats::default(),
            })),
        }
    }

    /// A link that delivers on the next `receive` and never drops.
    pub fn perfect() -> Self {
        Self::new(0, 0.0, 0)
    }

    /// Moves the link's clock forward by one frame.
    pub fn advance_frame(&self) {
        lock(&self.state).frame += 1;
    }

    /// Packets whose delivery frame has arrived, in send order.
    pub fn receive(&self) -> Vec<Packet> {
        let mut state = lock(&self.state);
        let frame = state.frame;
        let mut delivered = Vec::new();

        while state.in_flight.front().is_some_and(|(due, _)| *due <= frame) {
            let Some((_, bytes)) = state.in_flight.pop_front() else {
                break;
            };
            match Packet::from_bytes(&bytes) {
                Ok(packet) => delivered.push(packet),
                Err(e) => warn!("Failed to deserialize packet: {}", e),
            }
        }

        state.stats.delivered += delivered.len() as u64;
        delivered
    }

    pub fn stats(&self) -> LinkStats {
        lock(&self.state).stats
    }
}

impl PacketSink for LoopbackLink {
    fn send(&mut self, packet: Packet, reliability: Reliability) {
        let mut state = lock(&self.state);
        state.stats.sent += 1;

        let loss = state.loss;
        if reliability == Reliability::Unreliable && loss > 0.0 && state.rng.gen_bool(loss) {
            trace!("Link dropped {:?}", packet);
            state.stats.dropped += 1;
            return;
        }

        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize packet: {}", e);
                return;
            }
        };

        let due = state.frame + state.latency_frames;
        state.in_flight.push_back((due, bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_packet(tick: i32) -> Packet {
        Packet::ServerTick { tick }
    }

    #[test]
    fn test_perfect_link_delivers_immediately() {
        let mut link = LoopbackLink::perfect();
        link.send(tick_packet(1), Reliability::Unreliable);
        link.send(tick_packet(2), Reliability::Reliable);

        assert_eq!(link.receive(), vec![tick_packet(1), tick_packet(2)]);
        assert!(link.receive().is_empty());
    }

    #[test]
    fn test_latency_in_frames() {
        let mut link = LoopbackLink::new(2, 0.0, 0);
        link.send(tick_packet(1), Reliability::Unreliable);

        assert!(link.receive().is_empty());
        link.advance_frame();
        assert!(link.receive().is_empty());
        link.advance_frame();
        assert_eq!(link.receive(), vec![tick_packet(1)]);
    }

    #[test]
    fn test_loss_spares_reliable_packets() {
        let mut link = LoopbackLink::new(0, 1.0, 7);
        link.send(tick_packet(1), Reliability::Unreliable);
        link.send(tick_packet(2), Reliability::Reliable);

        assert_eq!(link.receive(), vec![tick_packet(2)]);
        let stats = link.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_recording_sink() {
        let mut sink = RecordingSink::new();
        sink.send(tick_packet(3), Reliability::Reliable);

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.take(), vec![(tick_packet(3), Reliability::Reliable)]);
        assert!(sink.is_empty());
    }
}
