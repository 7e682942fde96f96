//! Per-world registry connecting state producers to replication, and
//! replicated state to consumers.

use crate::error::{Result, SimError};
use crate::tick::Tick;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// Identifies one replicated model across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub u32);

/// Encodings of one model's state for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedState {
    /// Reduced encoding for observers.
    pub short: Vec<u8>,
    /// Full encoding for the owning peer.
    pub full: Vec<u8>,
    /// Carries events or a final state and must not be dropped.
    pub reliable: bool,
}

/// Bytes received for a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundState {
    pub bytes: Vec<u8>,
    pub full: bool,
}

/// Handle a driver publishes its per-tick state through.
#[derive(Debug, Clone)]
pub struct StateProducer {
    model: ModelId,
    tx: mpsc::UnboundedSender<(Tick, ProducedState)>,
}

impl StateProducer {
    pub fn model(&self) -> ModelId {
        self.model
    }

    /// Returns false once the registry is gone.
    pub fn publish(&self, tick: Tick, state: ProducedState) -> bool {
        self.tx.send((tick, state)).is_ok()
    }
}

#[derive(Default)]
pub struct StateManager {
    producers: BTreeMap<ModelId, mpsc::UnboundedReceiver<(Tick, ProducedState)>>,
    pending: BTreeMap<Tick, BTreeMap<ModelId, ProducedState>>,
    produced: BTreeMap<Tick, BTreeMap<ModelId, ProducedState>>,
    consumers: HashMap<ModelId, mpsc::UnboundedSender<InboundState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_producer(&mut self, model: ModelId) -> StateProducer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.producers.insert(model, rx);
        StateProducer { model, tx }
    }

    pub fn unregister_producer(&mut self, model: ModelId) {
        self.producers.remove(&model);
    }

    pub fn register_consumer(&mut self, model: ModelId, tx: mpsc::UnboundedSender<InboundState>) {
        self.consumers.insert(model, tx);
    }

    pub fn unregister_consumer(&mut self, model: ModelId) {
        self.consumers.remove(&model);
    }

    /// Collects everything producers published for ticks up to `tick`.
    pub fn produce_data(&mut self, tick: Tick) {
        for (model, rx) in &mut self.producers {
            while let Ok((produced_tick, state)) = rx.try_recv() {
                self.pending.entry(produced_tick).or_default().insert(*model, state);
            }
        }

        let later = self.pending.split_off(&(tick + 1));
        let ready = std::mem::replace(&mut self.pending, later);
        for (ready_tick, states) in ready {
            self.produced.entry(ready_tick).or_default().extend(states);
        }
    }

    pub fn produced_ticks(&self) -> Vec<Tick> {
        self.produced.keys().copied().collect()
    }

    /// `(model, bytes, reliable)` for every model that produced state at `tick`.
    pub fn produced_data_for_tick(&self, tick: Tick, full: bool) -> Vec<(ModelId, Vec<u8>, bool)> {
        self.produced
            .get(&tick)
            .map(|states| {
                states
                    .iter()
                    .map(|(model, state)| {
                        let bytes = if full { state.full.clone() } else { state.short.clone() };
                        (*model, bytes, state.reliable)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops produced data for every tick at or before `tick`.
    pub fn release_produced_data(&mut self, tick: Tick) {
        self.produced = self.produced.split_off(&(tick + 1));
    }

    /// Routes received state bytes to the consumer registered for `model`.
    pub fn push_state_to_consumer(&mut self, model: ModelId, bytes: Vec<u8>, full: bool) -> Result<()> {
        let Some(tx) = self.consumers.get(&model) else {
            debug!("Dropping state for unregistered model {:?}", model);
            return Err(SimError::ModelNotRegistered(model));
        };

        if tx.send(InboundState { bytes, full }).is_err() {
            self.consumers.remove(&model);
            return Err(SimError::ModelNotRegistered(model));
        }
        Ok(())
    }
}
