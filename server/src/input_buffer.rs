//! Authority-side input buffering
//!
//! Inputs arrive from the autonomous proxy in redundant sliding windows, so the
//! same tick is usually received several times and packets may arrive out of
//! order or not at all. This buffer:
//! - Deduplicates by tick and rejects anything already consumed
//! - Keeps pending inputs sorted ascending by tick
//! - Never stalls: a missing tick is filled by repeating the last input
//! - Remembers recently filled ticks so pacing can react to packet loss

use log::{debug, trace};
use shared::input::{InputPacket, InputPayload};
use shared::tick::Tick;
use std::collections::VecDeque;

/// Ordered queue of inputs waiting to be consumed by the authority
#[derive(Debug)]
pub struct AuthorityInputBuffer<I> {
    /// Pending inputs sorted by tick
    pending: VecDeque<InputPacket<I>>,
    /// Input consumed by the most recent call to `next_input`
    last_consumed: Option<InputPacket<I>>,
    /// Ticks that were synthesized rather than received
    dropped: VecDeque<Tick>,
    /// How many ticks a synthesized tick is remembered for
    dropped_memory: i32,
}

impl<I: InputPayload> AuthorityInputBuffer<I> {
    pub fn new(dropped_memory: i32) -> Self {
        Self {
            pending: VecDeque::new(),
            last_consumed: None,
            dropped: VecDeque::new(),
            dropped_memory,
        }
    }

    /// Adds received inputs to the buffer
    ///
    /// Packets for ticks already consumed or already buffered are ignored. The
    /// buffer stays sorted by tick regardless of arrival order.
    pub fn enqueue(&mut self, packets: impl IntoIterator<Item = InputPacket<I>>) {
        for packet in packets {
            if let Some(last) = &self.last_consumed {
                if packet.tick <= last.tick {
                    trace!("Ignoring stale input for tick {}", packet.tick);
                    continue;
                }
            }

            match self.pending.binary_search_by_key(&packet.tick, |p| p.tick) {
                Ok(_) => {}
                Err(index) => self.pending.insert(index, packet),
            }
        }
    }

    /// Takes the input for the next tick
    ///
    /// The first call takes the earliest buffered packet. Every later call
    /// returns the packet for the tick after the last consumed one, or a
    /// repeat of the last consumed input stamped with that tick if it never
    /// arrived. Returns `None` only while nothing has ever been received.
    pub fn next_input(&mut self) -> Option<InputPacket<I>> {
        let next = match &self.last_consumed {
            None => self.pending.pop_front()?,
            Some(last) => {
                let expected = last.tick + 1;
                match self.pending.front() {
                    Some(front) if front.tick == expected => self.pending.pop_front()?,
                    _ => {
                        debug!("Input for tick {} missing, repeating tick {}", expected, last.tick);
                        self.dropped.push_back(expected);
                        InputPacket::new(expected, last.body.clone())
                    }
                }
            }
        };

        self.age_dropped(next.tick);
        self.last_consumed = Some(next.clone());
        Some(next)
    }

    fn age_dropped(&mut self, current: Tick) {
        while let Some(&oldest) = self.dropped.front() {
            if current - oldest >= self.dropped_memory {
                self.dropped.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of received inputs not yet consumed
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of synthesized ticks inside the memory window
    pub fn recently_dropped(&self) -> usize {
        self.dropped.len()
    }

    pub fn dropped_ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.dropped.iter().copied()
    }

    pub fn last_consumed_tick(&self) -> Option<Tick> {
        self.last_consumed.as_ref().map(|p| p.tick)
    }

    pub fn has_consumed(&self) -> bool {
        self.last_consumed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(ticks: &[Tick]) -> Vec<InputPacket<u32>> {
        ticks.iter().map(|&t| InputPacket::new(t, t as u32 * 10)).collect()
    }

    #[test]
    fn test_enqueue_sorts_and_dedupes() {
        let mut buffer = AuthorityInputBuffer::new(25);
        buffer.enqueue(packets(&[3, 1, 2]));
        buffer.enqueue(packets(&[2, 3, 4]));

        assert_eq!(buffer.len(), 4);
        let ticks: Vec<Tick> = (0..4).filter_map(|_| buffer.next_input()).map(|p| p.tick).collect();
        assert_eq!(ticks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_first_consumption_takes_earliest() {
        let mut buffer = AuthorityInputBuffer::new(25);
        assert!(buffer.next_input().is_none());

        buffer.enqueue(packets(&[7, 5]));
        assert_eq!(buffer.next_input().unwrap().tick, 5);
        assert_eq!(buffer.recently_dropped(), 0);
    }

    #[test]
    fn test_gap_is_filled_with_repeat() {
        let mut buffer = AuthorityInputBuffer::new(25);
        buffer.enqueue(packets(&[0, 1, 3, 4]));

        let consumed: Vec<InputPacket<u32>> = (0..5).filter_map(|_| buffer.next_input()).collect();
        let ticks: Vec<Tick> = consumed.iter().map(|p| p.tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4]);
        assert_eq!(consumed[2].body, 10);
        assert_eq!(buffer.dropped_ticks().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_stale_inputs_ignored() {
        let mut buffer = AuthorityInputBuffer::new(25);
        buffer.enqueue(packets(&[0, 1, 2]));
        buffer.next_input();
        buffer.next_input();

        buffer.enqueue(packets(&[0, 1]));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.last_consumed_tick(), Some(1));
    }

    #[test]
    fn test_never_stalls_when_empty() {
        let mut buffer = AuthorityInputBuffer::new(25);
        buffer.enqueue(packets(&[0]));
        buffer.next_input();

        for expected in 1..5 {
            let packet = buffer.next_input().unwrap();
            assert_eq!(packet.tick, expected);
            assert_eq!(packet.body, 0);
        }
        assert_eq!(buffer.recently_dropped(), 4);
    }

    #[test]
    fn test_dropped_ticks_age_out() {
        let mut buffer = AuthorityInputBuffer::new(3);
        buffer.enqueue(packets(&[0, 2, 3, 4, 5]));

        for _ in 0..3 {
            buffer.next_input();
        }
        assert_eq!(buffer.recently_dropped(), 1);

        buffer.next_input();
        buffer.next_input();
        assert_eq!(buffer.last_consumed_tick(), Some(4));
        assert_eq!(buffer.recently_dropped(), 0);
    }
}
