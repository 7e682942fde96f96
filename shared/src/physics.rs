//! Rigid body state and the physics stepping service the drivers run against

use crate::config::Tolerances;
use crate::error::Result;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// How the solver treats a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MotionMode {
    #[default]
    Dynamic,
    Kinematic,
    Sleeping,
    Static,
}

impl MotionMode {
    pub fn to_byte(self) -> u8 {
        match self {
            MotionMode::Dynamic => 0,
            MotionMode::Kinematic => 1,
            MotionMode::Sleeping => 2,
            MotionMode::Static => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MotionMode::Dynamic),
            1 => Some(MotionMode::Kinematic),
            2 => Some(MotionMode::Sleeping),
            3 => Some(MotionMode::Static),
            _ => None,
        }
    }
}

/// Opaque identifier of a body inside a [`PhysicsScene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle(pub u32);

/// Physical state of one body.
///
/// Captured from the body after the solver step and only ever written back
/// before the next step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsState {
    pub motion: MotionMode,
    /// Position.
    pub x: Vector3<f64>,
    /// Orientation.
    pub r: UnitQuaternion<f64>,
    /// Linear velocity.
    pub v: Vector3<f64>,
    /// Angular velocity.
    pub w: Vector3<f64>,
}

impl Default for PhysicsState {
    fn default() -> Self {
        Self {
            motion: MotionMode::Dynamic,
            x: Vector3::zeros(),
            r: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            w: Vector3::zeros(),
        }
    }
}

impl PhysicsState {
    pub fn at_position(x: Vector3<f64>) -> Self {
        Self {
            x,
            ..Default::default()
        }
    }

    pub fn capture_from(scene: &dyn PhysicsScene, body: BodyHandle) -> Result<Self> {
        scene.body_state(body)
    }

    /// Writes this state onto the body. Only valid before a step.
    pub fn reconcile_to(&self, scene: &mut dyn PhysicsScene, body: BodyHandle) -> Result<()> {
        scene.set_body_state(body, self)
    }

    /// True when the two states differ by more than the given tolerances.
    pub fn should_reconcile(&self, other: &PhysicsState, tolerances: &Tolerances) -> bool {
        if self.motion != other.motion {
            return true;
        }
        if (other.x - self.x).norm() > tolerances.position {
            return true;
        }
        if (other.v - self.v).norm() > tolerances.velocity {
            return true;
        }
        if (other.r.quaternion() - self.r.quaternion()).norm() > tolerances.rotation {
            return true;
        }
        (other.w - self.w).norm() > tolerances.angular_velocity
    }

    /// Blends from `self` towards `other`. The motion mode is taken from `other`.
    pub fn interpolate(&self, other: &PhysicsState, alpha: f64) -> PhysicsState {
        PhysicsState {
            motion: other.motion,
            x: self.x.lerp(&other.x, alpha),
            r: blend_rotation(&self.r, &other.r, alpha),
            v: self.v.lerp(&other.v, alpha),
            w: self.w.lerp(&other.w, alpha),
        }
    }

    /// Projects `self` forward by `extrapolation_time`, using the motion observed
    /// between `prev` and `self` over `state_dt`.
    pub fn extrapolate(&self, prev: &PhysicsState, state_dt: f64, extrapolation_time: f64) -> PhysicsState {
        if state_dt <= 0.0 {
            return *self;
        }

        let velocity = (self.x - prev.x) / state_dt;
        let angular_velocity = angular_velocity_between(&prev.r, &self.r, state_dt);

        PhysicsState {
            x: self.x + velocity * extrapolation_time,
            r: UnitQuaternion::from_scaled_axis(angular_velocity * extrapolation_time) * self.r,
            ..*self
        }
    }

    /// Projects `self` forward by `extrapolation_time` along its own velocities.
    pub fn project(&self, extrapolation_time: f64) -> PhysicsState {
        PhysicsState {
            x: self.x + self.v * extrapolation_time,
            r: UnitQuaternion::from_scaled_axis(self.w * extrapolation_time) * self.r,
            ..*self
        }
    }
}

fn blend_rotation(from: &UnitQuaternion<f64>, to: &UnitQuaternion<f64>, alpha: f64) -> UnitQuaternion<f64> {
    // Take the short way around.
    let to = if from.coords.dot(&to.coords) < 0.0 {
        UnitQuaternion::new_unchecked(-to.into_inner())
    } else {
        *to
    };

    from.try_slerp(&to, alpha, 1.0e-9)
        .unwrap_or_else(|| UnitQuaternion::new_normalize(from.into_inner().lerp(&to.into_inner(), alpha)))
}

fn angular_velocity_between(from: &UnitQuaternion<f64>, to: &UnitQuaternion<f64>, dt: f64) -> Vector3<f64> {
    let delta = to * from.inverse();
    delta.scaled_axis() / dt
}

/// The physics stepping service drivers run against.
///
/// Implementations own the solver. Drivers only read and write body state
/// through this trait, before and after each step.
pub trait PhysicsScene: Send {
    fn add_body(&mut self, state: PhysicsState) -> BodyHandle;

    fn bodies(&self) -> Vec<BodyHandle>;

    fn body_state(&self, body: BodyHandle) -> Result<PhysicsState>;

    fn set_body_state(&mut self, body: BodyHandle, state: &PhysicsState) -> Result<()>;

    fn set_motion_mode(&mut self, body: BodyHandle, motion: MotionMode) -> Result<()> {
        let mut state = self.body_state(body)?;
        state.motion = motion;
        self.set_body_state(body, &state)
    }

    fn set_linear_velocity(&mut self, body: BodyHandle, v: Vector3<f64>) -> Result<()> {
        let mut state = self.body_state(body)?;
        state.v = v;
        self.set_body_state(body, &state)
    }

    fn set_angular_velocity(&mut self, body: BodyHandle, w: Vector3<f64>) -> Result<()> {
        let mut state = self.body_state(body)?;
        state.w = w;
        self.set_body_state(body, &state)
    }

    fn mass(&self, body: BodyHandle) -> Result<f64>;

    /// Advances every body by one fixed step.
    fn step(&mut self, dt: f64);
}

/// A view of the scene scoped to one body, handed to model callbacks.
pub struct PhysicsContext<'a> {
    scene: &'a mut dyn PhysicsScene,
    body: BodyHandle,
}

impl<'a> PhysicsContext<'a> {
    pub fn new(scene: &'a mut dyn PhysicsScene, body: BodyHandle) -> Self {
        Self { scene, body }
    }

    pub fn body(&self) -> BodyHandle {
        self.body
    }

    pub fn state(&self) -> Result<PhysicsState> {
        self.scene.body_state(self.body)
    }

    pub fn position(&self) -> Result<Vector3<f64>> {
        Ok(self.state()?.x)
    }

    pub fn linear_velocity(&self) -> Result<Vector3<f64>> {
        Ok(self.state()?.v)
    }

    pub fn set_linear_velocity(&mut self, v: Vector3<f64>) -> Result<()> {
        self.scene.set_linear_velocity(self.body, v)
    }

    pub fn set_angular_velocity(&mut self, w: Vector3<f64>) -> Result<()> {
        self.scene.set_angular_velocity(self.body, w)
    }

    pub fn add_impulse(&mut self, impulse: Vector3<f64>) -> Result<()> {
        let mass = self.scene.mass(self.body)?;
        if mass <= 0.0 {
            return Ok(());
        }
        let v = self.linear_velocity()? + impulse / mass;
        self.set_linear_velocity(v)
    }

    pub fn set_motion_mode(&mut self, motion: MotionMode) -> Result<()> {
        self.scene.set_motion_mode(self.body, motion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn moving_state(x: f64, v: f64) -> PhysicsState {
        PhysicsState {
            x: Vector3::new(x, 0.0, 0.0),
            v: Vector3::new(v, 0.0, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_states_do_not_reconcile() {
        let state = moving_state(1.0, 2.0);
        assert!(!state.should_reconcile(&state, &Tolerances::default()));
    }

    #[test]
    fn test_each_field_triggers_reconcile() {
        let tolerances = Tolerances::default();
        let base = moving_state(1.0, 2.0);

        let mut moved = base;
        moved.x.x += 0.2;
        assert!(base.should_reconcile(&moved, &tolerances));

        let mut faster = base;
        faster.v.y += 0.2;
        assert!(base.should_reconcile(&faster, &tolerances));

        let mut turned = base;
        turned.r = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5);
        assert!(base.should_reconcile(&turned, &tolerances));

        let mut spinning = base;
        spinning.w.z = 0.5;
        assert!(base.should_reconcile(&spinning, &tolerances));

        let mut frozen = base;
        frozen.motion = MotionMode::Kinematic;
        assert!(base.should_reconcile(&frozen, &tolerances));
    }

    #[test]
    fn test_small_difference_within_tolerance() {
        let base = moving_state(1.0, 2.0);
        let mut close = base;
        close.x.x += 0.05;
        close.v.x -= 0.05;
        assert!(!base.should_reconcile(&close, &Tolerances::default()));
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = moving_state(0.0, 0.0);
        let b = moving_state(10.0, 4.0);
        let mid = a.interpolate(&b, 0.5);

        assert_approx_eq!(mid.x.x, 5.0);
        assert_approx_eq!(mid.v.x, 2.0);
    }

    #[test]
    fn test_interpolate_rotation_endpoints() {
        let mut a = PhysicsState::default();
        let mut b = PhysicsState::default();
        a.r = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.0);
        b.r = UnitQuaternion::from_euler_angles(0.0, 0.0, 1.0);

        let end = a.interpolate(&b, 1.0);
        assert_approx_eq!(end.r.angle_to(&b.r), 0.0, 1e-9);

        let half = a.interpolate(&b, 0.5);
        assert_approx_eq!(half.r.angle(), 0.5, 1e-9);
    }

    #[test]
    fn test_extrapolate_follows_velocity() {
        let prev = moving_state(0.0, 0.0);
        let last = moving_state(1.0, 0.0);

        let projected = last.extrapolate(&prev, 0.5, 0.25);
        assert_approx_eq!(projected.x.x, 1.5);
    }

    #[test]
    fn test_extrapolate_rotation() {
        let mut prev = PhysicsState::default();
        let mut last = PhysicsState::default();
        prev.r = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.0);
        last.r = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1);

        let projected = last.extrapolate(&prev, 1.0, 1.0);
        assert_approx_eq!(projected.r.euler_angles().2, 0.2, 1e-9);
    }

    #[test]
    fn test_project_uses_own_velocities() {
        let mut state = moving_state(1.0, 2.0);
        state.w = Vector3::new(0.0, 0.0, 0.4);

        let projected = state.project(0.5);
        assert_approx_eq!(projected.x.x, 2.0);
        assert_approx_eq!(projected.r.euler_angles().2, 0.2, 1e-9);
        assert_eq!(projected.v, state.v);
    }

    #[test]
    fn test_motion_mode_byte_round_trip() {
        for mode in [
            MotionMode::Dynamic,
            MotionMode::Kinematic,
            MotionMode::Sleeping,
            MotionMode::Static,
        ] {
            assert_eq!(MotionMode::from_byte(mode.to_byte()), Some(mode));
        }
        assert_eq!(MotionMode::from_byte(9), None);
    }
}
