//! Minimal deterministic rigid body integrator.
//!
//! Stands in for the host physics engine so worlds can be stepped headless.
//! Bodies do not collide with each other; an optional ground plane stops
//! dynamic bodies from falling forever.

use crate::error::{Result, SimError};
use crate::physics::{BodyHandle, MotionMode, PhysicsScene, PhysicsState};
use nalgebra::{UnitQuaternion, Vector3};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct RigidBody {
    state: PhysicsState,
    mass: f64,
}

#[derive(Debug, Clone)]
pub struct RigidBodyScene {
    bodies: BTreeMap<BodyHandle, RigidBody>,
    next_handle: u32,
    pub gravity: Vector3<f64>,
    /// Height of the ground plane along z, if any.
    pub ground_height: Option<f64>,
    pub max_speed: Option<f64>,
}

impl Default for RigidBodyScene {
    fn default() -> Self {
        Self::new(Vector3::new(0.0, 0.0, -9.81), Some(0.0))
    }
}

impl RigidBodyScene {
    pub fn new(gravity: Vector3<f64>, ground_height: Option<f64>) -> Self {
        Self {
            bodies: BTreeMap::new(),
            next_handle: 0,
            gravity,
            ground_height,
            max_speed: None,
        }
    }

    /// A scene with no gravity and no ground, where bodies keep their velocity.
    pub fn weightless() -> Self {
        Self::new(Vector3::zeros(), None)
    }

    pub fn set_mass(&mut self, body: BodyHandle, mass: f64) -> Result<()> {
        let entry = self.bodies.get_mut(&body).ok_or(SimError::UnknownBody(body))?;
        entry.mass = mass;
        Ok(())
    }

    fn integrate(&self, state: &mut PhysicsState, dt: f64) {
        match state.motion {
            MotionMode::Sleeping | MotionMode::Static => return,
            MotionMode::Dynamic => state.v += self.gravity * dt,
            MotionMode::Kinematic => {}
        }

        if let Some(max_speed) = self.max_speed {
            let speed = state.v.norm();
            if speed > max_speed {
                state.v *= max_speed / speed;
            }
        }

        state.x += state.v * dt;
        state.r = UnitQuaternion::from_scaled_axis(state.w * dt) * state.r;

        if state.motion == MotionMode::Dynamic {
            if let Some(ground) = self.ground_height {
                if state.x.z <= ground {
                    state.x.z = ground;
                    if state.v.z < 0.0 {
                        state.v.z = 0.0;
                    }
                }
            }
        }
    }
}

impl PhysicsScene for RigidBodyScene {
    fn add_body(&mut self, state: PhysicsState) -> BodyHandle {
        let handle = BodyHandle(self.next_handle);
        self.next_handle += 1;
        self.bodies.insert(handle, RigidBody { state, mass: 1.0 });
        handle
    }

    fn bodies(&self) -> Vec<BodyHandle> {
        self.bodies.keys().copied().collect()
    }

    fn body_state(&self, body: BodyHandle) -> Result<PhysicsState> {
        self.bodies
            .get(&body)
            .map(|entry| entry.state)
            .ok_or(SimError::UnknownBody(body))
    }

    fn set_body_state(&mut self, body: BodyHandle, state: &PhysicsState) -> Result<()> {
        let entry = self.bodies.get_mut(&body).ok_or(SimError::UnknownBody(body))?;
        entry.state = *state;
        Ok(())
    }

    fn mass(&self, body: BodyHandle) -> Result<f64> {
        self.bodies
            .get(&body)
            .map(|entry| entry.mass)
            .ok_or(SimError::UnknownBody(body))
    }

    fn step(&mut self, dt: f64) {
        let mut states: Vec<(BodyHandle, PhysicsState)> = self
            .bodies
            .iter()
            .map(|(handle, entry)| (*handle, entry.state))
            .collect();

        for (_, state) in &mut states {
            self.integrate(state, dt);
        }

        for (handle, state) in states {
            if let Some(entry) = self.bodies.get_mut(&handle) {
                entry.state = state;
            }
        }
    }
}
