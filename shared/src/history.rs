//! Bounded, tick-ordered record of past snapshots

use crate::snapshot::{PayloadState, StateSnapshot};
use crate::tick::Tick;
use log::trace;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct StateHistory<S> {
    entries: VecDeque<StateSnapshot<S>>,
    capacity: usize,
}

impl<S: PayloadState> StateHistory<S> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Inserts or replaces the entry for the snapshot's local tick.
    ///
    /// A final snapshot drops every later entry, those ticks never happened on
    /// the authority. The oldest entries are evicted beyond capacity.
    pub fn update(&mut self, snapshot: StateSnapshot<S>) {
        let Some(tick) = snapshot.local_tick else {
            trace!("Ignoring snapshot without a tick");
            return;
        };

        let index = self
            .entries
            .partition_point(|entry| entry.local_tick.map_or(true, |existing| existing < tick));
        let is_final = snapshot.is_final;

        if self
            .entries
            .get(index)
            .is_some_and(|entry| entry.local_tick == Some(tick))
        {
            self.entries[index] = snapshot;
        } else {
            self.entries.insert(index, snapshot);
        }

        if is_final {
            self.entries.truncate(index + 1);
        }

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn lookup(&self, tick: Tick) -> Option<&StateSnapshot<S>> {
        self.entries.iter().find(|entry| entry.local_tick == Some(tick))
    }

    pub fn latest(&self) -> Option<&StateSnapshot<S>> {
        self.entries.back()
    }

    pub fn earliest(&self) -> Option<&StateSnapshot<S>> {
        self.entries.front()
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.latest().and_then(|entry| entry.local_tick)
    }

    /// State at `time`, found by the end times of the bracketing entries.
    ///
    /// Clamps to the first entry before the history starts. Past the last entry
    /// the motion is extrapolated, unless the last entry is final. A lone entry
    /// is projected along its own velocities.
    pub fn interpolate(&self, time: f64) -> Option<StateSnapshot<S>> {
        let first = self.entries.front()?;
        if time <= first.end_time {
            return Some(first.clone());
        }

        if let Some(index) = self.entries.iter().position(|entry| entry.end_time >= time) {
            let prev = &self.entries[index - 1];
            let next = &self.entries[index];

            let span = next.end_time - prev.end_time;
            let alpha = if span > 0.0 {
                ((time - prev.end_time) / span).clamp(0.0, 1.0)
            } else {
                1.0
            };

            return Some(StateSnapshot::interpolated(prev, next, alpha));
        }

        let last = self.entries.back()?;
        if last.is_final {
            return Some(last.clone());
        }
        if self.entries.len() < 2 {
            let mut extrapolated = last.clone();
            extrapolated.physics = last.physics.project(time - last.end_time);
            return Some(extrapolated);
        }

        let prev = &self.entries[self.entries.len() - 2];
        let mut extrapolated = last.clone();
        extrapolated.physics =
            last.physics
                .extrapolate(&prev.physics, last.end_time - prev.end_time, time - last.end_time);
        Some(extrapolated)
    }

    /// Drops every entry with a tick at or before `tick`.
    pub fn remove_through(&mut self, tick: Tick) {
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.local_tick.map_or(true, |existing| existing <= tick))
        {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateSnapshot<S>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
