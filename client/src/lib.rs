//! # Prediction Client Library
//!
//! The client side of client prediction with server reconciliation. A client
//! runs two kinds of proxies for the models the authority simulates:
//!
//! ### Autonomous Proxies
//! The model this peer controls is predicted locally. Inputs are applied the
//! moment they are produced, so control feels immediate regardless of latency.
//! Every predicted tick is remembered. When the authority's result for a tick
//! disagrees with the prediction, the proxy takes the authority state and the
//! world rewinds and replays the unacknowledged inputs on top of it.
//!
//! ### Simulated Proxies
//! Models controlled elsewhere are displayed, not predicted. Their snapshots
//! are buffered and played back a short, steady delay behind the newest data,
//! interpolating between snapshots so motion stays smooth over jittery links.
//! Events they raised are fired on the local timeline through the tick offset.
//!
//! ### Timeline Alignment
//! Both proxies lean on the offset between local and authority ticks. The
//! offset estimator follows periodic server tick broadcasts and only moves when
//! drift exceeds a threshold; the display clock trims its rate to keep a
//! simulated proxy's playback on target.
//!
//! ## Module Organization
//!
//! ### Autonomous Module (`autonomous`)
//! - Local prediction, input sending and reconciliation
//! - Forced simulation after corrections and time dilation from control packets
//!
//! ### Input Buffer Module (`input_buffer`)
//! - Ring of unacknowledged inputs replayed on correction
//!
//! ### Simulated Module (`simulated`)
//! - Delayed, interpolated display of remotely controlled models
//!
//! ### Offset Module (`offset`)
//! - Local to authority tick offset estimation
//! - Display clock rate control
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::autonomous::AutonomousProxyDriver;
//! use shared::demo::RunnerModel;
//! use shared::transport::NullSink;
//! use shared::{ModelId, PhysicsScene, PhysicsState, PredictionConfig, RigidBodyScene, WorldManager};
//! use std::sync::{Arc, Mutex};
//!
//! let config = PredictionConfig::default();
//! let mut world = WorldManager::new(RigidBodyScene::default(), config.clone());
//! let body = world.scene_mut().add_body(PhysicsState::default());
//! let proxy = Arc::new(Mutex::new(AutonomousProxyDriver::new(
//!     ModelId(1),
//!     RunnerModel::running_right(),
//!     body,
//!     PhysicsState::default(),
//!     config,
//!     Box::new(NullSink),
//! )));
//! world.register(proxy.clone());
//!
//! // Prediction starts once the tick offset is known.
//! world.set_server_tick_offset(0);
//! loop {
//!     world.advance(1.0 / 60.0);
//!     // Authority states arriving from the network:
//!     // proxy.lock().unwrap().receive_authority_state(&bytes)?;
//! }
//! ```

pub mod autonomous;
pub mod input_buffer;
pub mod offset;
pub mod simulated;
