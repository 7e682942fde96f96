//! Fixed-timestep orchestration of one simulated world.
//!
//! The world owns the physics scene and steps it in whole ticks. Registered
//! callbacks are driven in a fixed order every tick:
//!
//! 1. `prepare_tick` (game thread) samples input for the tick about to run
//! 2. `rewind_tick` is asked whether earlier ticks must be replayed; the
//!    earliest answer wins and the scene is restored and resimulated up to
//!    the latest completed tick
//! 3. `pre_tick`, the solver step, then `post_tick` (physics thread)
//!
//! After the ticks of a frame, `post_physics` runs once on the game thread with
//! the results time. That is where drivers talk to the network and request
//! forced ticks or a time dilation.

use crate::config::PredictionConfig;
use crate::error::Result;
use crate::physics::{BodyHandle, PhysicsScene, PhysicsState};
use crate::sync::lock;
use crate::tick::{Tick, TickInfo};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub trait TickCallback: Send {
    fn prepare_tick(&mut self, _info: &TickInfo) {}

    fn pre_tick(&mut self, _info: &TickInfo, _scene: &mut dyn PhysicsScene) -> Result<()> {
        Ok(())
    }

    fn post_tick(&mut self, _info: &TickInfo, _scene: &mut dyn PhysicsScene) -> Result<()> {
        Ok(())
    }

    fn post_physics(&mut self, _frame: &mut FrameContext) {}

    /// Earliest tick that must be replayed, given the latest completed tick.
    fn rewind_tick(&mut self, _latest_tick: Tick) -> Option<Tick> {
        None
    }
}

pub type SharedCallback = Arc<Mutex<dyn TickCallback>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// What the game thread sees after a frame, and what it can ask of the world.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// End time of the latest completed tick.
    pub results_time: f64,
    /// Real time that elapsed this frame.
    pub frame_dt: f64,
    pub dt: f64,
    pub latest_tick: Option<Tick>,
    pub ticks_run: u32,
    pub server_tick_offset: Option<i32>,
    forced_ticks: u32,
    time_dilation: f64,
}

impl FrameContext {
    fn new(results_time: f64, frame_dt: f64, dt: f64, latest_tick: Option<Tick>, ticks_run: u32, offset: Option<i32>) -> Self {
        Self {
            results_time,
            frame_dt,
            dt,
            latest_tick,
            ticks_run,
            server_tick_offset: offset,
            forced_ticks: 0,
            time_dilation: 1.0,
        }
    }

    /// Queues extra ticks to run at the start of the next frame.
    pub fn force_simulate(&mut self, ticks: u32) {
        self.forced_ticks = self.forced_ticks.max(ticks);
    }

    /// Requests a simulation rate scale for the next frame.
    pub fn set_time_dilation(&mut self, dilation: f64) {
        self.time_dilation *= dilation;
    }

    pub fn forced_ticks(&self) -> u32 {
        self.forced_ticks
    }

    pub fn time_dilation(&self) -> f64 {
        self.time_dilation
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorldStats {
    pub ticks: u64,
    pub forced_ticks: u64,
    pub rewinds: u64,
    pub resimulated_ticks: u64,
    pub dropped_rewinds: u64,
}

struct SceneRecord {
    tick: Tick,
    bodies: Vec<(BodyHandle, PhysicsState)>,
}

pub struct WorldManager<P: PhysicsScene> {
    scene: P,
    config: PredictionConfig,
    callbacks: Vec<(CallbackId, SharedCallback)>,
    next_callback_id: u64,
    next_tick: Tick,
    accumulator: f64,
    time_dilation: f64,
    server_tick_offset: Option<i32>,
    pending_forced_ticks: u32,
    rewind_buffer: VecDeque<SceneRecord>,
    rewind_capacity: usize,
    stats: WorldStats,
}

impl<P: PhysicsScene> WorldManager<P> {
    pub fn new(scene: P, config: PredictionConfig) -> Self {
        let rewind_capacity = config.rewind_buffer_ticks().max(1) as usize + 1;
        Self {
            scene,
            config,
            callbacks: Vec::new(),
            next_callback_id: 0,
            next_tick: 0,
            accumulator: 0.0,
            time_dilation: 1.0,
            server_tick_offset: None,
            pending_forced_ticks: 0,
            rewind_buffer: VecDeque::with_capacity(rewind_capacity),
            rewind_capacity,
            stats: WorldStats::default(),
        }
    }

    pub fn register(&mut self, callback: SharedCallback) -> CallbackId {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.push((id, callback));
        debug!("Registered tick callback {:?}", id);
        id
    }

    pub fn unregister(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        before != self.callbacks.len()
    }

    pub fn scene(&self) -> &P {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut P {
        &mut self.scene
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    pub fn stats(&self) -> WorldStats {
        self.stats
    }

    pub fn dt(&self) -> f64 {
        self.config.fixed_dt
    }

    /// Latest completed tick.
    pub fn latest_tick(&self) -> Option<Tick> {
        (self.next_tick > 0).then(|| self.next_tick - 1)
    }

    pub fn next_tick(&self) -> Tick {
        self.next_tick
    }

    pub fn results_time(&self) -> f64 {
        self.next_tick as f64 * self.config.fixed_dt
    }

    pub fn time_dilation(&self) -> f64 {
        self.time_dilation
    }

    pub fn server_tick_offset(&self) -> Option<i32> {
        self.server_tick_offset
    }

    /// Offset added to a local tick to get the server tick. Zero on the authority.
    pub fn set_server_tick_offset(&mut self, offset: i32) {
        if self.server_tick_offset != Some(offset) {
            debug!("World server tick offset set to {}", offset);
        }
        self.server_tick_offset = Some(offset);
    }

    /// Queues ticks to run at the start of the next `advance`, without waiting
    /// for real time to accumulate.
    pub fn force_simulate(&mut self, ticks: u32) {
        self.pending_forced_ticks = (self.pending_forced_ticks + ticks).min(self.config.max_forced_simulation_ticks);
    }

    pub fn pending_forced_ticks(&self) -> u32 {
        self.pending_forced_ticks
    }

    /// Runs every tick that `frame_dt` of real time (scaled by the current time
    /// dilation) pays for, plus any forced ticks, then the game-thread callbacks.
    /// Returns the number of ticks run.
    pub fn advance(&mut self, frame_dt: f64) -> u32 {
        let dt = self.config.fixed_dt;
        self.accumulator += (frame_dt * self.time_dilation).clamp(0.0, self.config.max_physics_time);

        let forced = std::mem::take(&mut self.pending_forced_ticks);
        let mut ticks_run = 0;
        for _ in 0..forced {
            self.step_tick();
            self.stats.forced_ticks += 1;
            ticks_run += 1;
        }

        while self.accumulator >= dt {
            self.accumulator -= dt;
            self.step_tick();
            ticks_run += 1;
        }

        let mut frame = FrameContext::new(
            self.results_time(),
            frame_dt,
            dt,
            self.latest_tick(),
            ticks_run,
            self.server_tick_offset,
        );
        for (_, callback) in &self.callbacks {
            lock(callback).post_physics(&mut frame);
        }

        if frame.forced_ticks > 0 {
            self.force_simulate(frame.forced_ticks);
        }
        self.time_dilation = frame.time_dilation;

        ticks_run
    }

    /// Runs exactly one tick, including any rewind it triggers.
    pub fn step_tick(&mut self) {
        let tick = self.next_tick;
        let info = TickInfo::new(tick, self.config.fixed_dt, self.server_tick_offset, false);

        for (_, callback) in &self.callbacks {
            lock(callback).prepare_tick(&info);
        }

        if let Some(latest) = self.latest_tick() {
            let target = self
                .callbacks
                .iter()
                .filter_map(|(_, callback)| lock(callback).rewind_tick(latest))
                .min();
            if let Some(target) = target {
                self.resimulate(target, latest);
            }
        }

        self.record_scene(tick);
        self.run_tick(&info);
        self.next_tick += 1;
        self.stats.ticks += 1;
    }

    fn resimulate(&mut self, from: Tick, latest: Tick) {
        if from > latest {
            // The correction lands on the upcoming tick, nothing to replay.
            return;
        }

        let Some(index) = self.rewind_buffer.iter().position(|record| record.tick == from) else {
            warn!(
                "Dropping rewind to tick {}, rewind window starts at {:?}",
                from,
                self.rewind_buffer.front().map(|record| record.tick)
            );
            self.stats.dropped_rewinds += 1;
            return;
        };

        debug!("Rewinding to tick {} and resimulating through {}", from, latest);
        for (body, state) in &self.rewind_buffer[index].bodies {
            if let Err(e) = self.scene.set_body_state(*body, state) {
                warn!("Failed to restore body {:?}: {}", body, e);
            }
        }

        self.stats.rewinds += 1;
        for tick in from..=latest {
            let info = TickInfo::new(tick, self.config.fixed_dt, self.server_tick_offset, true);
            self.record_scene(tick);
            self.run_tick(&info);
            self.stats.resimulated_ticks += 1;
        }
    }

    fn run_tick(&mut self, info: &TickInfo) {
        trace!("Tick {} (resim: {})", info.local_tick, info.is_resim);

        for (_, callback) in &self.callbacks {
            if let Err(e) = lock(callback).pre_tick(info, &mut self.scene) {
                warn!("Pre-tick callback failed at tick {}: {}", info.local_tick, e);
            }
        }

        self.scene.step(info.dt);

        for (_, callback) in &self.callbacks {
            if let Err(e) = lock(callback).post_tick(info, &mut self.scene) {
                warn!("Post-tick callback failed at tick {}: {}", info.local_tick, e);
            }
        }
    }

    /// Saves the scene as it is at the start of `tick`.
    fn record_scene(&mut self, tick: Tick) {
        let bodies = self
            .scene
            .bodies()
            .into_iter()
            .filter_map(|body| self.scene.body_state(body).ok().map(|state| (body, state)))
            .collect();

        if let Some(existing) = self.rewind_buffer.iter_mut().find(|record| record.tick == tick) {
            existing.bodies = bodies;
            return;
        }

        self.rewind_buffer.push_back(SceneRecord { tick, bodies });
        while self.rewind_buffer.len() > self.rewind_capacity {
            self.rewind_buffer.pop_front();
        }
    }
}
