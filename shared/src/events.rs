//! Tick-tagged gameplay events and their rewind-aware queue

use crate::error::{Result, SimError};
use crate::tick::{Tick, TickInfo};
use bincode::{deserialize, serialize};
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;

/// A discrete gameplay event. `id` selects the bit in a snapshot's event mask.
pub trait SimEvent: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + 'static {
    fn id(&self) -> u8;

    fn mask(&self) -> u8 {
        let id = self.id();
        if id < 8 {
            1 << id
        } else {
            0
        }
    }
}

/// Models without events use `NoEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoEvent {}

impl SimEvent for NoEvent {
    fn id(&self) -> u8 {
        match *self {}
    }
}

/// Offset the authority applies to its server ticks to reach the tick remote
/// observers are displaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProxyOffset {
    pub expected_applied_server_tick: Tick,
    pub server_tick_offset: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<E> {
    pub event: E,
    pub local_tick: Tick,
    pub server_tick: Option<Tick>,
    /// Local time at which the event is due.
    pub time: f64,
    /// Received from the authority rather than dispatched locally.
    pub remote: bool,
    dt: f64,
}

impl<E> EventRecord<E> {
    fn due_time(&self, local_to_server_offset: Option<i32>) -> Option<f64> {
        if !self.remote {
            return Some(self.time);
        }
        let server_tick = self.server_tick?;
        let offset = local_to_server_offset?;
        Some((server_tick + offset + 1) as f64 * self.dt)
    }
}

#[derive(Debug)]
pub struct EventQueue<E> {
    events: VecDeque<EventRecord<E>>,
    latest_emitted_tick: Option<Tick>,
    queued_remote_offsets: VecDeque<RemoteProxyOffset>,
    remote_offset: Option<i32>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            latest_emitted_tick: None,
            queued_remote_offsets: VecDeque::new(),
            remote_offset: None,
        }
    }
}

impl<E: SimEvent> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event raised while simulating the given tick.
    pub fn dispatch(&mut self, event: E, info: &TickInfo) {
        trace!("Dispatching {:?} at tick {}", event, info.local_tick);
        self.events.push_back(EventRecord {
            event,
            local_tick: info.local_tick,
            server_tick: info.server_tick,
            time: info.end_time,
            remote: false,
            dt: info.dt,
        });
    }

    /// Discards every event raised at or after `local_tick`. Replay regenerates them.
    pub fn rewind(&mut self, local_tick: Tick) {
        let before = self.events.len();
        self.events.retain(|record| record.remote || record.local_tick < local_tick);
        let dropped = before - self.events.len();
        if dropped > 0 {
            debug!("Rewind to tick {} discarded {} events", local_tick, dropped);
        }
    }

    /// Fires every event that is due at `results_time`, oldest first, and removes it.
    ///
    /// Events received from the authority are placed on the local timeline with
    /// `local_to_server_offset`, and stay queued until it is known.
    pub fn execute<F>(&mut self, results_time: f64, local_to_server_offset: Option<i32>, mut handler: F) -> usize
    where
        F: FnMut(&EventRecord<E>),
    {
        let mut executed = 0;
        let mut remaining = VecDeque::with_capacity(self.events.len());

        while let Some(record) = self.events.pop_front() {
            match record.due_time(local_to_server_offset) {
                Some(due) if due <= results_time => {
                    handler(&record);
                    executed += 1;
                }
                _ => remaining.push_back(record),
            }
        }

        self.events = remaining;
        executed
    }

    /// Serializes the events created since the last emission.
    ///
    /// Only events with a server tick past the watermark are included, and the
    /// watermark only moves forward.
    pub fn emit(&mut self) -> Result<Option<Vec<u8>>> {
        let watermark = self.latest_emitted_tick;
        let fresh: Vec<(Tick, E)> = self
            .events
            .iter()
            .filter(|record| !record.remote)
            .filter_map(|record| record.server_tick.map(|tick| (tick, record.event.clone())))
            .filter(|(tick, _)| watermark.map_or(true, |latest| *tick > latest))
            .collect();

        let Some(newest) = fresh.iter().map(|(tick, _)| *tick).max() else {
            return Ok(None);
        };

        let bytes = serialize(&fresh).map_err(|e| SimError::Encode(e.to_string()))?;
        self.latest_emitted_tick = Some(newest);
        Ok(Some(bytes))
    }

    /// Queues events received from the authority.
    pub fn consume_bundle(&mut self, bytes: &[u8], dt: f64) -> Result<usize> {
        let received: Vec<(Tick, E)> = deserialize(bytes)?;
        let count = received.len();

        for (server_tick, event) in received {
            let duplicate = self
                .events
                .iter()
                .any(|record| record.remote && record.server_tick == Some(server_tick) && record.event == event);
            if duplicate {
                continue;
            }

            self.events.push_back(EventRecord {
                event,
                local_tick: server_tick,
                server_tick: Some(server_tick),
                time: 0.0,
                remote: true,
                dt,
            });
        }

        Ok(count)
    }

    pub fn consume_remote_offset(&mut self, offset: RemoteProxyOffset) {
        self.queued_remote_offsets.push_back(offset);
    }

    /// Applies queued remote offsets whose activation tick has been reached.
    pub fn prepare_pre_physics(&mut self, info: &TickInfo) {
        let Some(server_tick) = info.server_tick else {
            return;
        };

        while let Some(offset) = self.queued_remote_offsets.front() {
            if offset.expected_applied_server_tick > server_tick {
                break;
            }
            debug!(
                "Applying remote proxy offset {} at server tick {}",
                offset.server_tick_offset, server_tick
            );
            self.remote_offset = Some(offset.server_tick_offset);
            self.queued_remote_offsets.pop_front();
        }
    }

    pub fn remote_offset(&self) -> Option<i32> {
        self.remote_offset
    }

    pub fn latest_emitted_tick(&self) -> Option<Tick> {
        self.latest_emitted_tick
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord<E>> {
        self.events.iter()
    }
}
