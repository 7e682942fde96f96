//! The capability interface a simulated object implements, and the per-tick
//! plumbing every simulating driver shares.

use crate::error::Result;
use crate::events::SimEvent;
use crate::input::{InputPacket, InputPayload};
use crate::physics::{BodyHandle, MotionMode, PhysicsContext, PhysicsScene, PhysicsState};
use crate::snapshot::{PayloadState, StateSnapshot};
use crate::tick::{Tick, TickInfo};
use log::info;
use nalgebra::Vector3;

/// Payload state and events produced by one tick of a model.
#[derive(Debug, Clone)]
pub struct SimOutput<S, E> {
    pub state: S,
    pub events: Vec<E>,
}

impl<S, E: SimEvent> SimOutput<S, E> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            events: Vec::new(),
        }
    }

    pub fn dispatch(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn event_mask(&self) -> u8 {
        self.events.iter().fold(0, |mask, event| mask | event.mask())
    }
}

pub trait SimModel: Send + 'static {
    type Input: InputPayload;
    type State: PayloadState;
    type Event: SimEvent;

    /// Samples local controls for `tick`. Called on the game thread by whichever
    /// peer produces input.
    fn produce_input(&mut self, tick: Tick, input: &mut Self::Input);

    fn initial_state(&self) -> Self::State {
        Self::State::default()
    }

    /// Applies input to the body before the solver steps.
    fn simulate_pre_physics(
        &self,
        dt: f64,
        ctx: &mut PhysicsContext,
        input: &Self::Input,
        prev: &StateSnapshot<Self::State>,
        out: &mut SimOutput<Self::State, Self::Event>,
    ) -> Result<()>;

    /// Reads the stepped body and finishes the payload state.
    fn simulate_post_physics(
        &self,
        _dt: f64,
        _ctx: &mut PhysicsContext,
        _input: &Self::Input,
        _prev: &StateSnapshot<Self::State>,
        _out: &mut SimOutput<Self::State, Self::Event>,
    ) -> Result<()> {
        Ok(())
    }

    fn is_simulation_over(&self, _state: &Self::State) -> bool {
        false
    }
}

/// Result of a finished tick: the captured snapshot and the events raised.
#[derive(Debug, Clone)]
pub struct TickResult<S, E> {
    pub snapshot: StateSnapshot<S>,
    pub events: Vec<E>,
}

struct InFlight<M: SimModel> {
    input: InputPacket<M::Input>,
    output: SimOutput<M::State, M::Event>,
}

/// Runs a model against one body, one tick at a time.
pub struct ModelRunner<M: SimModel> {
    model: M,
    body: BodyHandle,
    current: StateSnapshot<M::State>,
    in_flight: Option<InFlight<M>>,
}

impl<M: SimModel> ModelRunner<M> {
    pub fn new(model: M, body: BodyHandle, initial_physics: PhysicsState) -> Self {
        let state = model.initial_state();
        Self {
            current: StateSnapshot {
                physics: initial_physics,
                state,
                ..StateSnapshot::default()
            },
            model,
            body,
            in_flight: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn body(&self) -> BodyHandle {
        self.body
    }

    /// Latest completed state.
    pub fn current(&self) -> &StateSnapshot<M::State> {
        &self.current
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_final
    }

    /// Writes `snapshot` onto the body and adopts it as the latest state.
    pub fn apply_state(&mut self, scene: &mut dyn PhysicsScene, snapshot: StateSnapshot<M::State>) -> Result<()> {
        snapshot.physics.reconcile_to(scene, self.body)?;
        self.current = snapshot;
        self.in_flight = None;
        Ok(())
    }

    /// Holds the body at the latest state without simulating.
    pub fn hold(&mut self, scene: &mut dyn PhysicsScene) -> Result<()> {
        self.current.physics.reconcile_to(scene, self.body)
    }

    pub fn pre_tick(&mut self, info: &TickInfo, scene: &mut dyn PhysicsScene, input: InputPacket<M::Input>) -> Result<()> {
        let mut output = SimOutput::new(self.current.state.clone());

        if !self.current.is_final {
            let mut ctx = PhysicsContext::new(scene, self.body);
            self.model
                .simulate_pre_physics(info.dt, &mut ctx, &input.body, &self.current, &mut output)?;
        }

        self.in_flight = Some(InFlight { input, output });
        Ok(())
    }

    /// Captures the stepped body. Returns `None` if no tick was started.
    pub fn post_tick(
        &mut self,
        info: &TickInfo,
        scene: &mut dyn PhysicsScene,
    ) -> Result<Option<TickResult<M::State, M::Event>>> {
        let Some(InFlight { input, mut output }) = self.in_flight.take() else {
            return Ok(None);
        };

        let was_final = self.current.is_final;
        if !was_final {
            let mut ctx = PhysicsContext::new(scene, self.body);
            self.model
                .simulate_post_physics(info.dt, &mut ctx, &input.body, &self.current, &mut output)?;
        }

        let is_final = was_final || self.model.is_simulation_over(&output.state);
        if is_final && !was_final {
            info!("Simulation finished at tick {}", info.local_tick);
            freeze(scene, self.body)?;
        }

        let snapshot = StateSnapshot {
            local_tick: Some(info.local_tick),
            server_tick: info.server_tick,
            input_tick: Some(input.tick),
            physics: PhysicsState::capture_from(scene, self.body)?,
            events: output.event_mask(),
            is_final,
            start_time: info.start_time,
            end_time: info.end_time,
            state: output.state,
        };

        self.current = snapshot.clone();
        Ok(Some(TickResult {
            snapshot,
            events: output.events,
        }))
    }
}

/// Stops the solver from moving the body any further.
pub fn freeze(scene: &mut dyn PhysicsScene, body: BodyHandle) -> Result<()> {
    let mut state = scene.body_state(body)?;
    state.motion = MotionMode::Kinematic;
    state.v = Vector3::zeros();
    state.w = Vector3::zeros();
    scene.set_body_state(body, &state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoEvent;
    use crate::scene::RigidBodyScene;
    use assert_approx_eq::assert_approx_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Steps(u32);

    impl PayloadState for Steps {}

    /// Pushes the body along x at the commanded speed and stops after three ticks.
    struct Pusher;

    impl SimModel for Pusher {
        type Input = f64;
        type State = Steps;
        type Event = NoEvent;

        fn produce_input(&mut self, _tick: Tick, input: &mut f64) {
            *input = 6.0;
        }

        fn simulate_pre_physics(
            &self,
            _dt: f64,
            ctx: &mut PhysicsContext,
            input: &f64,
            _prev: &StateSnapshot<Steps>,
            out: &mut SimOutput<Steps, NoEvent>,
        ) -> Result<()> {
            ctx.set_linear_velocity(Vector3::new(*input, 0.0, 0.0))?;
            out.state.0 += 1;
            Ok(())
        }

        fn is_simulation_over(&self, state: &Steps) -> bool {
            state.0 >= 3
        }
    }

    fn run_tick(runner: &mut ModelRunner<Pusher>, scene: &mut RigidBodyScene, tick: Tick) -> TickResult<Steps, NoEvent> {
        let info = TickInfo::new(tick, 0.5, Some(0), false);
        runner.pre_tick(&info, scene, InputPacket::new(tick, 6.0)).unwrap();
        scene.step(info.dt);
        runner.post_tick(&info, scene).unwrap().unwrap()
    }

    #[test]
    fn test_runner_steps_and_captures() {
        let mut scene = RigidBodyScene::weightless();
        let body = scene.add_body(PhysicsState::default());
        let mut runner = ModelRunner::new(Pusher, body, PhysicsState::default());

        let result = run_tick(&mut runner, &mut scene, 0);
        assert_eq!(result.snapshot.local_tick, Some(0));
        assert_eq!(result.snapshot.input_tick, Some(0));
        assert_approx_eq!(result.snapshot.physics.x.x, 3.0);
        assert_eq!(result.snapshot.state, Steps(1));
        assert!(!result.snapshot.is_final);
    }

    #[test]
    fn test_runner_freezes_when_over() {
        let mut scene = RigidBodyScene::weightless();
        let body = scene.add_body(PhysicsState::default());
        let mut runner = ModelRunner::new(Pusher, body, PhysicsState::default());

        for tick in 0..3 {
            run_tick(&mut runner, &mut scene, tick);
        }

        let last = runner.current().clone();
        assert!(last.is_final);
        assert_eq!(last.physics.motion, MotionMode::Kinematic);
        assert_eq!(last.physics.v, Vector3::zeros());

        let after = run_tick(&mut runner, &mut scene, 3);
        assert!(after.snapshot.is_final);
        assert_eq!(after.snapshot.physics.x, last.physics.x);
        assert_eq!(after.snapshot.state, Steps(3));
    }

    #[test]
    fn test_post_tick_without_pre_tick() {
        let mut scene = RigidBodyScene::weightless();
        let body = scene.add_body(PhysicsState::default());
        let mut runner = ModelRunner::new(Pusher, body, PhysicsState::default());

        let info = TickInfo::new(0, 0.5, None, false);
        assert!(runner.post_tick(&info, &mut scene).unwrap().is_none());
    }
}
