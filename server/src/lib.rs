//! # Authority Library
//!
//! The authoritative side of client prediction with server reconciliation.
//! The authority runs the definitive simulation of every model it owns and
//! replicates the results to the peers that predict or display them.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Each model is driven by an [`authority::AuthorityDriver`] registered with
//! the world's tick loop. The driver consumes one input per tick, runs the
//! model against its body and captures the end-of-tick snapshot. When the
//! model reports that its simulation is over, the body is frozen and the
//! snapshot is marked final.
//!
//! ### Input Buffering
//! Inputs arrive from the owning client in redundant sliding windows. The
//! [`input_buffer::AuthorityInputBuffer`] deduplicates and orders them, and
//! fills any tick that never arrived by repeating the last known input. The
//! authority therefore never stalls on packet loss.
//!
//! ### Pacing Feedback
//! The [`dilation::TimeDilationEstimator`] watches the input buffer. A buffer
//! that runs long asks the client to slow down; one that runs short, or that
//! had to synthesize inputs recently, asks it to speed up. Suggestions are
//! packed into one-byte control packets and only sent when they change.
//!
//! ### Replication
//! Snapshots are published into the world's state registry. The
//! [`replication::ReplicationManager`] polls it after every frame and sends
//! full encodings to the owning peer and reduced ones to observers. Routine
//! snapshots travel unreliably at a fixed cadence; snapshots carrying events
//! or a final state go out immediately over the reliable channel.
//!
//! ## Module Organization
//!
//! ### Authority Module (`authority`)
//! - Per-model tick driver and its waiting/ticking state machine
//! - Snapshot publication and event emission
//!
//! ### Input Buffer Module (`input_buffer`)
//! - Ordered, deduplicated input queue with gap synthesis
//! - Recently dropped tick tracking
//!
//! ### Dilation Module (`dilation`)
//! - Smoothed time dilation suggestions for the owning client
//!
//! ### Replication Module (`replication`)
//! - Per-connection snapshot fan-out and server tick broadcasts
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::authority::AuthorityDriver;
//! use server::replication::ReplicationManager;
//! use shared::demo::RunnerModel;
//! use shared::transport::NullSink;
//! use shared::{ModelId, PhysicsScene, PhysicsState, PredictionConfig, RigidBodyScene, StateManager, WorldManager};
//! use std::sync::{Arc, Mutex};
//!
//! let config = PredictionConfig::default();
//! let mut world = WorldManager::new(RigidBodyScene::default(), config.clone());
//! world.set_server_tick_offset(0);
//!
//! let mut states = StateManager::new();
//! let body = world.scene_mut().add_body(PhysicsState::default());
//! let driver = AuthorityDriver::new(
//!     ModelId(1),
//!     RunnerModel::running_right(),
//!     body,
//!     PhysicsState::default(),
//!     config.clone(),
//!     Box::new(NullSink),
//! )
//! .with_local_input()
//! .with_producer(states.register_producer(ModelId(1)));
//! world.register(Arc::new(Mutex::new(driver)));
//!
//! let mut replication = ReplicationManager::new(&config);
//! loop {
//!     world.advance(1.0 / 60.0);
//!     replication.replicate(&mut states, world.latest_tick());
//! }
//! ```

pub mod authority;
pub mod dilation;
pub mod input_buffer;
pub mod replication;
