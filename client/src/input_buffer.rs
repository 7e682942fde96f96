//! Input ring kept by the autonomous proxy
//!
//! The proxy is the only producer of inputs for the model it controls, so
//! inputs arrive here one tick at a time in order. They stay buffered until
//! the authority acknowledges them, because a correction replays every
//! unacknowledged tick with the exact input that was originally predicted.

use log::warn;
use shared::input::{InputPacket, InputPayload};
use shared::tick::Tick;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct AutoProxyInputBuffer<I> {
    packets: VecDeque<InputPacket<I>>,
    capacity: usize,
}

impl<I: InputPayload> AutoProxyInputBuffer<I> {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends the input produced for the next tick, evicting the oldest
    /// when full.
    ///
    /// Inputs must be produced in tick order. A repeated tick is ignored and a
    /// skipped tick restarts the ring, since replay could never cross the gap.
    pub fn enqueue(&mut self, packet: InputPacket<I>) {
        if let Some(latest) = self.latest_tick() {
            if packet.tick <= latest {
                warn!("Ignoring out of order input for tick {} (latest {})", packet.tick, latest);
                return;
            }
            if packet.tick != latest + 1 {
                warn!("Input ticks jumped from {} to {}, dropping buffered inputs", latest, packet.tick);
                self.packets.clear();
            }
        }

        self.packets.push_back(packet);
        while self.packets.len() > self.capacity {
            self.packets.pop_front();
        }
    }

    pub fn input_for_tick(&self, tick: Tick) -> Option<&InputPacket<I>> {
        self.packets.iter().find(|packet| packet.tick == tick)
    }

    /// Discards every input the authority has consumed.
    pub fn ack(&mut self, tick: Tick) {
        while self.packets.front().is_some_and(|packet| packet.tick <= tick) {
            self.packets.pop_front();
        }
    }

    /// The newest `size` inputs, oldest first.
    pub fn window(&self, size: usize) -> Vec<InputPacket<I>> {
        let skip = self.packets.len().saturating_sub(size);
        self.packets.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<&InputPacket<I>> {
        self.packets.back()
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.latest().map(|packet| packet.tick)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, ticks: std::ops::Range<Tick>) -> AutoProxyInputBuffer<u32> {
        let mut buffer = AutoProxyInputBuffer::new(capacity);
        for tick in ticks {
            buffer.enqueue(InputPacket::new(tick, tick as u32));
        }
        buffer
    }

    #[test]
    fn test_lookup_by_tick() {
        let buffer = filled(8, 0..5);
        assert_eq!(buffer.input_for_tick(3).map(|p| p.body), Some(3));
        assert!(buffer.input_for_tick(9).is_none());
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let buffer = filled(3, 0..5);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.input_for_tick(1).is_none());
        assert_eq!(buffer.input_for_tick(2).map(|p| p.tick), Some(2));
    }

    #[test]
    fn test_ack_removes_through_tick() {
        let mut buffer = filled(8, 0..5);
        buffer.ack(2);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.input_for_tick(2).is_none());

        buffer.ack(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_window_is_newest_inputs() {
        let buffer = filled(8, 0..5);
        let ticks: Vec<Tick> = buffer.window(3).iter().map(|p| p.tick).collect();
        assert_eq!(ticks, vec![2, 3, 4]);

        let short = filled(8, 0..2);
        assert_eq!(short.window(3).len(), 2);
    }

    #[test]
    fn test_non_sequential_enqueue() {
        let mut buffer = filled(8, 0..3);
        buffer.enqueue(InputPacket::new(1, 99));
        assert_eq!(buffer.input_for_tick(1).map(|p| p.body), Some(1));

        buffer.enqueue(InputPacket::new(7, 7));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.latest_tick(), Some(7));
    }
}
