//! # Shared Prediction Library
//!
//! Core types and algorithms used by both the authority (server) and the
//! proxies (clients) of a physically simulated, networked object. Everything
//! here is deterministic and free of I/O so that every peer steps an
//! identical simulation from identical inputs.
//!
//! ## Core Concepts
//!
//! ### Fixed Ticks
//! Physics advances in fixed steps of `dt` seconds. Every peer numbers its own
//! ticks; the authority's tick numbers travel with each replicated snapshot
//! so the proxies can line them up with their own.
//!
//! ### Snapshots and History
//! After every tick a model captures a [`snapshot::StateSnapshot`]: the body's
//! physical state plus the model's payload state and event bits. Snapshots
//! are kept in a bounded [`history::StateHistory`] so they can be compared
//! with late authority data and interpolated for display.
//!
//! ### Rewind and Resimulate
//! The [`world::WorldManager`] records the scene at the start of every tick.
//! When a driver finds its prediction diverged it asks the world to rewind;
//! the world restores the recorded scene and replays the intervening ticks
//! before running the new one.
//!
//! ## Module Organization
//!
//! ### Simulation (`world`, `model`, `physics`, `scene`)
//! - Fixed-step orchestration with rewind and forced ticks
//! - The [`model::SimModel`] capability interface and its runner
//! - The physics scene abstraction and a headless rigid body integrator
//!
//! ### State (`snapshot`, `history`, `events`, `control`, `input`)
//! - Per-tick snapshots and their tolerance comparison
//! - Ordered snapshot history with interpolation
//! - Event recording, replication and scheduled execution
//! - Time dilation control packets and input packets
//!
//! ### Replication (`wire`, `state_manager`, `transport`, `sync`)
//! - Full and reduced snapshot encodings
//! - Per-world producer and consumer registry
//! - Packet sinks and an in-process loopback link
//! - Handoff primitives between game and physics threads
//!
//! ### Ambient (`config`, `error`, `tick`, `demo`)
//! - Tunable settings with their defaults
//! - The crate-wide error type
//! - Tick bookkeeping
//! - A platform-runner model used by the session binary and tests

pub mod config;
pub mod control;
pub mod demo;
pub mod error;
pub mod events;
pub mod history;
pub mod input;
pub mod model;
pub mod physics;
pub mod scene;
pub mod snapshot;
pub mod state_manager;
pub mod sync;
pub mod tick;
pub mod transport;
pub mod wire;
pub mod world;

pub use config::{PredictionConfig, Tolerances};
pub use control::ControlPacket;
pub use error::{Result, SimError};
pub use events::{EventQueue, NoEvent, RemoteProxyOffset, SimEvent};
pub use history::StateHistory;
pub use input::{InputPacket, InputPayload};
pub use model::{ModelRunner, SimModel, SimOutput};
pub use physics::{BodyHandle, MotionMode, PhysicsContext, PhysicsScene, PhysicsState};
pub use scene::RigidBodyScene;
pub use snapshot::{PayloadState, StateSnapshot};
pub use state_manager::{ModelId, StateManager};
pub use tick::{Tick, TickInfo};
pub use world::{FrameContext, TickCallback, WorldManager};

use serde::{Deserialize, Serialize};

/// Every message exchanged between the authority and its proxies.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    /// Sliding window of the newest inputs from the autonomous proxy.
    InputBundle { model: ModelId, bytes: Vec<u8> },
    /// One encoded authority snapshot.
    AuthorityState {
        model: ModelId,
        full: bool,
        bytes: Vec<u8>,
    },
    /// Packed [`ControlPacket`] for the autonomous proxy.
    Control { model: ModelId, byte: u8 },
    /// Bundle of events emitted by the authority.
    Events { model: ModelId, bytes: Vec<u8> },
    /// Periodic broadcast of the authority's latest tick.
    ServerTick { tick: Tick },
    /// Offset observers apply when scheduling remote events.
    RemoteOffset {
        model: ModelId,
        offset: RemoteProxyOffset,
    },
}

impl Packet {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SimError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Packet> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Model the packet is addressed to, if any.
    pub fn model(&self) -> Option<ModelId> {
        match self {
            Packet::InputBundle { model, .. }
            | Packet::AuthorityState { model, .. }
            | Packet::Control { model, .. }
            | Packet::Events { model, .. }
            | Packet::RemoteOffset { model, .. } => Some(*model),
            Packet::ServerTick { .. } => None,
        }
    }
}
