//! Display of models this peer does not control
//!
//! A simulated proxy never runs the model. It buffers authority snapshots
//! and plays them back on a virtual clock that trails the newest data by a
//! fixed delay, interpolating between snapshots and extrapolating briefly
//! when data runs out. The body is kept kinematic so the solver leaves it
//! alone, and is handed back to the solver once the final state is shown.

use crate::offset::{ClockAdjustment, ServerClock};
use log::{debug, info, trace, warn};
use nalgebra::Vector3;
use shared::config::PredictionConfig;
use shared::error::Result;
use shared::events::{EventQueue, EventRecord};
use shared::history::StateHistory;
use shared::model::SimModel;
use shared::physics::{BodyHandle, MotionMode, PhysicsScene, PhysicsState};
use shared::snapshot::StateSnapshot;
use shared::state_manager::ModelId;
use shared::sync::LatestSlot;
use shared::tick::{Tick, TickInfo};
use shared::wire::{decode_snapshot, Completeness};
use shared::world::{FrameContext, TickCallback};

type EventHandler<E> = Box<dyn FnMut(&EventRecord<E>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    starting_tick: Tick,
}

/// Body placement computed on the game thread for the physics thread.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DisplayTarget {
    physics: PhysicsState,
    is_final: bool,
}

pub struct SimulatedProxyDriver<M: SimModel> {
    model_id: ModelId,
    body: BodyHandle,
    dt: f64,
    delay: f64,
    buffer: StateHistory<M::State>,
    anchor: Option<Anchor>,
    virtual_time: f64,
    clock: ServerClock,
    /// Ticks at or before this were already played back and trimmed
    trimmed_through: Option<Tick>,
    display: Option<StateSnapshot<M::State>>,
    target: LatestSlot<DisplayTarget>,
    /// Pose last written onto the body, restored again on replayed ticks
    applied: Option<PhysicsState>,
    finished: bool,
    made_kinematic: bool,
    tick_offset: Option<i32>,
    events: EventQueue<M::Event>,
    on_event: Option<EventHandler<M::Event>>,
    events_executed: u64,
}

impl<M: SimModel> SimulatedProxyDriver<M> {
    pub fn new(model_id: ModelId, body: BodyHandle, config: &PredictionConfig) -> Self {
        info!("Simulated proxy for {:?} bound to body {:?}", model_id, body);
        Self {
            model_id,
            body,
            dt: config.fixed_dt,
            delay: config.sim_proxy_delay,
            buffer: StateHistory::with_capacity(config.history_capacity()),
            anchor: None,
            virtual_time: 0.0,
            clock: ServerClock::new(config),
            trimmed_through: None,
            display: None,
            target: LatestSlot::new(),
            applied: None,
            finished: false,
            made_kinematic: false,
            tick_offset: None,
            events: EventQueue::new(),
            on_event: None,
            events_executed: 0,
        }
    }

    pub fn with_event_handler(mut self, handler: impl FnMut(&EventRecord<M::Event>) + Send + 'static) -> Self {
        self.on_event = Some(Box::new(handler));
        self
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    /// The state most recently chosen for display.
    pub fn display_state(&self) -> Option<&StateSnapshot<M::State>> {
        self.display.as_ref()
    }

    pub fn virtual_time(&self) -> f64 {
        self.virtual_time
    }

    pub fn timescale(&self) -> f64 {
        self.clock.timescale()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn events_executed(&self) -> u64 {
        self.events_executed
    }

    /// Maps authority ticks onto the local timeline for event playback.
    pub fn set_tick_offset(&mut self, offset: i32) {
        self.tick_offset = Some(offset);
    }

    /// Buffers one authority snapshot. Duplicates replace the buffered copy;
    /// snapshots older than what was already played back are ignored.
    pub fn receive_authority_state(&mut self, bytes: &[u8], full: bool) -> Result<()> {
        let completeness = if full { Completeness::Full } else { Completeness::Reduced };
        let mut snapshot: StateSnapshot<M::State> = decode_snapshot(bytes, completeness)?;

        let Some(tick) = snapshot.server_tick.or(snapshot.local_tick) else {
            warn!("{:?} received a snapshot without a tick", self.model_id);
            return Ok(());
        };

        if self.trimmed_through.is_some_and(|trimmed| tick <= trimmed) || self.finished {
            trace!("{:?} ignoring stale snapshot for tick {}", self.model_id, tick);
            return Ok(());
        }

        let anchor = *self.anchor.get_or_insert_with(|| {
            debug!("{:?} anchored playback at tick {}", self.model_id, tick);
            Anchor { starting_tick: tick }
        });
        if self.buffer.is_empty() && self.display.is_none() {
            self.virtual_time = (tick - anchor.starting_tick + 1) as f64 * self.dt;
        }

        snapshot.local_tick = Some(tick);
        snapshot.start_time = (tick - anchor.starting_tick) as f64 * self.dt;
        snapshot.end_time = snapshot.start_time + self.dt;
        self.buffer.update(snapshot);
        Ok(())
    }

    /// Queues an event bundle for playback.
    pub fn receive_events(&mut self, bytes: &[u8]) -> Result<()> {
        let count = self.events.consume_bundle(bytes, self.dt)?;
        trace!("{:?} received {} events", self.model_id, count);
        Ok(())
    }

    fn advance_clock(&mut self, frame_dt: f64) {
        self.virtual_time += frame_dt * self.clock.timescale();

        // The newest data should sit exactly one delay ahead of playback.
        let Some(latest_end) = self.buffer.latest().map(|latest| latest.end_time) else {
            return;
        };
        if let ClockAdjustment::Snap(time) = self.clock.adjust(self.virtual_time, latest_end) {
            self.virtual_time = time;
        }
    }

    fn trim(&mut self, playback_time: f64) {
        // Keep the entry before the bracket so interpolation stays possible.
        let before: Vec<Tick> = self
            .buffer
            .iter()
            .filter(|entry| entry.end_time < playback_time)
            .filter_map(|entry| entry.local_tick)
            .collect();
        if before.len() > 1 {
            let through = before[before.len() - 2];
            self.buffer.remove_through(through);
            self.trimmed_through = Some(through);
        }
    }
}

impl<M: SimModel> TickCallback for SimulatedProxyDriver<M> {
    fn pre_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        if !self.made_kinematic {
            scene.set_motion_mode(self.body, MotionMode::Kinematic)?;
            self.made_kinematic = true;
        }

        let Some(target) = self.target.take() else {
            // A rewind restored the body to an older recorded pose.
            if let Some(applied) = self.applied.filter(|_| info.is_resim) {
                return scene.set_body_state(self.body, &applied);
            }
            return Ok(());
        };

        let mut physics = target.physics;
        physics.v = Vector3::zeros();
        physics.w = Vector3::zeros();
        if target.is_final {
            info!("{:?} reached its final state, returning body to the solver", self.model_id);
            physics.motion = MotionMode::Dynamic;
            self.finished = true;
        } else {
            physics.motion = MotionMode::Kinematic;
        }
        self.applied = Some(physics);
        scene.set_body_state(self.body, &physics)
    }

    fn post_physics(&mut self, frame: &mut FrameContext) {
        if !self.finished && !self.buffer.is_empty() {
            self.advance_clock(frame.frame_dt);
            let playback_time = self.virtual_time - self.delay;

            if let Some(display) = self.buffer.interpolate(playback_time) {
                self.target.publish(DisplayTarget {
                    physics: display.physics,
                    is_final: display.is_final,
                });
                self.display = Some(display);
            }
            self.trim(playback_time);
        }

        let on_event = &mut self.on_event;
        let executed = self.events.execute(frame.results_time, self.tick_offset, |record| {
            trace!("Remote event {:?} from server tick {:?}", record.event, record.server_tick);
            if let Some(handler) = on_event.as_mut() {
                handler(record);
            }
        });
        self.events_executed += executed as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::demo::{RunnerEvent, RunnerModel, RunnerState};
    use shared::scene::RigidBodyScene;
    use shared::wire::encode_snapshot;
    use shared::world::WorldManager;
    use std::sync::{Arc, Mutex};

    const DT: f64 = 1.0 / 60.0;

    type Driver = SimulatedProxyDriver<RunnerModel>;

    fn snapshot_bytes(tick: Tick, x: f64, is_final: bool) -> Vec<u8> {
        let mut snapshot = StateSnapshot::new(tick, PhysicsState::at_position(Vector3::new(x, 0.0, 0.0)), RunnerState::default());
        snapshot.server_tick = Some(tick);
        snapshot.is_final = is_final;
        encode_snapshot(&snapshot, Completeness::Reduced).unwrap()
    }

    fn setup_with(configure: impl FnOnce(Driver) -> Driver) -> (WorldManager<RigidBodyScene>, Arc<Mutex<Driver>>, BodyHandle) {
        let config = PredictionConfig::default();
        let mut world = WorldManager::new(RigidBodyScene::default(), config.clone());
        let body = world.scene_mut().add_body(PhysicsState::default());
        let driver = Arc::new(Mutex::new(configure(SimulatedProxyDriver::new(ModelId(2), body, &config))));
        world.register(driver.clone());
        (world, driver, body)
    }

    fn setup() -> (WorldManager<RigidBodyScene>, Arc<Mutex<Driver>>, BodyHandle) {
        setup_with(|driver| driver)
    }

    #[test]
    fn test_body_made_kinematic() {
        let (mut world, _driver, body) = setup();
        world.step_tick();
        let state = world.scene().body_state(body).unwrap();
        assert_eq!(state.motion, MotionMode::Kinematic);
    }

    #[test]
    fn test_holds_first_snapshot_during_delay() {
        let (mut world, driver, body) = setup();
        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(100, 1.0, false), false).unwrap();

        world.advance(DT + 1e-9);
        world.advance(DT + 1e-9);

        let display = driver.lock().unwrap().display_state().cloned().unwrap();
        assert_approx_eq!(display.physics.x.x, 1.0);
        assert_approx_eq!(world.scene().body_state(body).unwrap().x.x, 1.0);
    }

    #[test]
    fn test_interpolates_between_snapshots() {
        let (mut world, driver, _body) = setup();
        {
            let mut driver = driver.lock().unwrap();
            for tick in 0..20 {
                driver
                    .receive_authority_state(&snapshot_bytes(tick, tick as f64 * 0.1, false), false)
                    .unwrap();
            }
        }

        // Playback trails the virtual clock by the delay.
        world.advance(0.2);
        let driver = driver.lock().unwrap();
        let display = driver.display_state().unwrap();
        let expected = (driver.virtual_time() - 0.05) / DT - 1.0;
        assert_approx_eq!(display.physics.x.x, expected * 0.1, 1e-2);
        assert!(driver.buffered() < 20);
    }

    #[test]
    fn test_virtual_time_snaps_when_far_behind() {
        let (mut world, driver, _body) = setup();
        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(0, 0.0, false), false).unwrap();
        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(60, 6.0, false), false).unwrap();

        world.advance(0.0);

        let driver = driver.lock().unwrap();
        assert_approx_eq!(driver.virtual_time(), 61.0 * DT);
        assert_approx_eq!(driver.timescale(), 1.0);
    }

    #[test]
    fn test_stale_and_duplicate_snapshots() {
        let (mut world, driver, _body) = setup();
        {
            let mut driver = driver.lock().unwrap();
            for tick in 0..30 {
                driver.receive_authority_state(&snapshot_bytes(tick, 0.0, false), false).unwrap();
            }
            driver.receive_authority_state(&snapshot_bytes(29, 0.0, false), false).unwrap();
        }

        world.advance(DT);
        let mut driver = driver.lock().unwrap();
        let buffered = driver.buffered();
        driver.receive_authority_state(&snapshot_bytes(0, 9.0, false), false).unwrap();
        assert_eq!(driver.buffered(), buffered);
    }

    #[test]
    fn test_final_state_returns_body_to_solver() {
        let (mut world, driver, body) = setup();
        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(0, 2.0, true), false).unwrap();

        world.advance(DT + 1e-9);
        world.advance(DT + 1e-9);

        assert!(driver.lock().unwrap().is_finished());
        let state = world.scene().body_state(body).unwrap();
        assert_eq!(state.motion, MotionMode::Dynamic);
        assert_approx_eq!(state.x.x, 2.0);

        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(1, 5.0, false), false).unwrap();
        assert_eq!(driver.lock().unwrap().buffered(), 1);
    }

    /// Asks for one replay of the latest tick once `at` is reached.
    struct RewindOnce {
        at: Tick,
        done: bool,
    }

    impl TickCallback for RewindOnce {
        fn rewind_tick(&mut self, latest_tick: Tick) -> Option<Tick> {
            if self.done || latest_tick < self.at {
                return None;
            }
            self.done = true;
            Some(self.at - 2)
        }
    }

    #[test]
    fn test_replay_keeps_displayed_pose() {
        let (mut world, driver, body) = setup();
        world.register(Arc::new(Mutex::new(RewindOnce { at: 6, done: false })));
        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(0, 0.0, false), false).unwrap();
        for _ in 0..5 {
            world.advance(DT + 1e-9);
        }

        driver.lock().unwrap().receive_authority_state(&snapshot_bytes(10, 3.0, false), false).unwrap();
        world.advance(DT + 1e-9);
        let expected = driver.lock().unwrap().display_state().unwrap().physics.x.x;
        assert!(expected > 0.0);

        // Tick 6 shows the new pose, tick 7 rewinds to tick 4 where the body
        // was recorded at its old pose.
        world.advance(DT * 2.0 + 1e-9);
        assert_eq!(world.stats().rewinds, 1);
        assert_approx_eq!(world.scene().body_state(body).unwrap().x.x, expected);
    }

    #[test]
    fn test_remote_events_wait_for_offset() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let (mut world, driver, _body) =
            setup_with(move |driver| driver.with_event_handler(move |record| sink.lock().unwrap().push(record.event)));

        let mut authority: EventQueue<RunnerEvent> = EventQueue::new();
        authority.dispatch(RunnerEvent::Jumped, &TickInfo::new(3, DT, Some(0), false));
        let bundle = authority.emit().unwrap().unwrap();
        driver.lock().unwrap().receive_events(&bundle).unwrap();

        world.advance(0.0);
        assert!(fired.lock().unwrap().is_empty());

        // Server tick 3 plays back on local tick 5, due at the end of it.
        driver.lock().unwrap().set_tick_offset(2);
        world.advance(DT * 2.0 + 1e-9);
        assert!(fired.lock().unwrap().is_empty());

        world.advance(DT * 4.0 + 1e-9);
        assert_eq!(*fired.lock().unwrap(), vec![RunnerEvent::Jumped]);
        assert_eq!(driver.lock().unwrap().events_executed(), 1);
    }
}
