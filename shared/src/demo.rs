//! A small platform-runner model used by the session binary and the tests

use crate::error::Result;
use crate::events::SimEvent;
use crate::model::{SimModel, SimOutput};
use crate::physics::PhysicsContext;
use crate::snapshot::{PayloadState, StateSnapshot};
use crate::tick::Tick;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub const PLAYER_SPEED: f64 = 3.0;
pub const JUMP_VELOCITY: f64 = 4.0;
pub const GROUND_HEIGHT: f64 = 0.0;

const GROUND_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInput {
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub jump_count: u32,
    pub distance: f64,
    pub on_ground: bool,
}

impl PayloadState for RunnerState {
    fn should_reconcile(&self, other: &Self) -> bool {
        self.jump_count != other.jump_count
            || self.on_ground != other.on_ground
            || (self.distance - other.distance).abs() > 0.1
    }

    fn interpolate(&self, other: &Self, alpha: f64) -> Self {
        Self {
            distance: self.distance + (other.distance - self.distance) * alpha,
            ..other.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerEvent {
    Jumped,
    Landed,
}

impl SimEvent for RunnerEvent {
    fn id(&self) -> u8 {
        match self {
            RunnerEvent::Jumped => 0,
            RunnerEvent::Landed => 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerModel {
    /// Controls held by whoever drives this runner.
    pub controls: RunnerInput,
    /// Press jump on every tick that is a multiple of this.
    pub jump_every: Option<Tick>,
    /// Distance along x at which the run is over.
    pub finish_line: Option<f64>,
}

impl RunnerModel {
    pub fn running_right() -> Self {
        Self {
            controls: RunnerInput {
                right: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl SimModel for RunnerModel {
    type Input = RunnerInput;
    type State = RunnerState;
    type Event = RunnerEvent;

    fn produce_input(&mut self, tick: Tick, input: &mut RunnerInput) {
        *input = self.controls;
        if let Some(every) = self.jump_every {
            if every > 0 && tick > 0 && tick % every == 0 {
                input.jump = true;
            }
        }
    }

    fn initial_state(&self) -> RunnerState {
        RunnerState {
            on_ground: true,
            ..Default::default()
        }
    }

    fn simulate_pre_physics(
        &self,
        _dt: f64,
        ctx: &mut PhysicsContext,
        input: &RunnerInput,
        prev: &StateSnapshot<RunnerState>,
        out: &mut SimOutput<RunnerState, RunnerEvent>,
    ) -> Result<()> {
        let mut velocity = ctx.linear_velocity()?;
        velocity.x = 0.0;
        if input.left {
            velocity.x -= PLAYER_SPEED;
        }
        if input.right {
            velocity.x += PLAYER_SPEED;
        }

        if input.jump && prev.state.on_ground {
            velocity.z = JUMP_VELOCITY;
            out.state.jump_count += 1;
            out.state.on_ground = false;
            out.dispatch(RunnerEvent::Jumped);
        }

        ctx.set_linear_velocity(velocity)?;
        ctx.set_angular_velocity(Vector3::zeros())
    }

    fn simulate_post_physics(
        &self,
        _dt: f64,
        ctx: &mut PhysicsContext,
        _input: &RunnerInput,
        prev: &StateSnapshot<RunnerState>,
        out: &mut SimOutput<RunnerState, RunnerEvent>,
    ) -> Result<()> {
        let state = ctx.state()?;
        out.state.distance = state.x.x;

        let grounded = state.x.z <= GROUND_HEIGHT + GROUND_EPSILON && state.v.z <= 0.0;
        if grounded && !prev.state.on_ground {
            out.dispatch(RunnerEvent::Landed);
        }
        out.state.on_ground = grounded;
        Ok(())
    }

    fn is_simulation_over(&self, state: &RunnerState) -> bool {
        self.finish_line.is_some_and(|finish| state.distance >= finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputPacket;
    use crate::model::ModelRunner;
    use crate::physics::{PhysicsScene, PhysicsState};
    use crate::scene::RigidBodyScene;
    use crate::tick::TickInfo;
    use assert_approx_eq::assert_approx_eq;

    const DT: f64 = 1.0 / 60.0;

    fn step(runner: &mut ModelRunner<RunnerModel>, scene: &mut RigidBodyScene, tick: Tick) -> Vec<RunnerEvent> {
        let info = TickInfo::new(tick, DT, Some(0), false);
        let mut input = RunnerInput::default();
        runner.model_mut().produce_input(tick, &mut input);
        runner.pre_tick(&info, scene, InputPacket::new(tick, input)).unwrap();
        scene.step(DT);
        runner.post_tick(&info, scene).unwrap().unwrap().events
    }

    #[test]
    fn test_runs_at_constant_speed() {
        let mut scene = RigidBodyScene::default();
        let body = scene.add_body(PhysicsState::default());
        let mut runner = ModelRunner::new(RunnerModel::running_right(), body, PhysicsState::default());

        for tick in 0..60 {
            step(&mut runner, &mut scene, tick);
        }

        let current = runner.current();
        assert_approx_eq!(current.physics.x.x, PLAYER_SPEED, 1e-9);
        assert_approx_eq!(current.physics.x.z, 0.0);
        assert!(current.state.on_ground);
        assert_approx_eq!(current.state.distance, current.physics.x.x);
    }

    #[test]
    fn test_jump_and_land_events() {
        let mut scene = RigidBodyScene::default();
        let body = scene.add_body(PhysicsState::default());
        let model = RunnerModel {
            jump_every: Some(5),
            ..Default::default()
        };
        let mut runner = ModelRunner::new(model, body, PhysicsState::default());

        let mut events = Vec::new();
        for tick in 0..120 {
            events.extend(step(&mut runner, &mut scene, tick));
        }

        assert_eq!(events.first(), Some(&RunnerEvent::Jumped));
        assert!(events.contains(&RunnerEvent::Landed));
        assert!(runner.current().state.jump_count >= 1);
    }

    #[test]
    fn test_finish_line_ends_simulation() {
        let mut scene = RigidBodyScene::default();
        let body = scene.add_body(PhysicsState::default());
        let model = RunnerModel {
            finish_line: Some(0.5),
            ..RunnerModel::running_right()
        };
        let mut runner = ModelRunner::new(model, body, PhysicsState::default());

        for tick in 0..30 {
            step(&mut runner, &mut scene, tick);
        }

        assert!(runner.is_finished());
        let x = runner.current().physics.x.x;
        assert!(x >= 0.5 && x < 0.6);
    }

    #[test]
    fn test_payload_tolerance() {
        let a = RunnerState {
            jump_count: 1,
            distance: 2.0,
            on_ground: true,
        };
        let mut b = a.clone();
        b.distance = 2.05;
        assert!(!a.should_reconcile(&b));

        b.jump_count = 2;
        assert!(a.should_reconcile(&b));
    }
}
