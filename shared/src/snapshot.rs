//! Tick-tagged physics and payload state

use crate::config::Tolerances;
use crate::physics::PhysicsState;
use crate::tick::Tick;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Domain-specific state carried alongside the physics state.
pub trait PayloadState:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + 'static
{
    /// True when the two payloads disagree enough to warrant a correction.
    fn should_reconcile(&self, other: &Self) -> bool {
        self != other
    }

    /// Blend used while displaying a simulated proxy. Holds `other` by default.
    fn interpolate(&self, other: &Self, _alpha: f64) -> Self {
        other.clone()
    }
}

impl PayloadState for () {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot<S> {
    /// Tick of the peer that produced this snapshot.
    pub local_tick: Option<Tick>,
    pub server_tick: Option<Tick>,
    /// Tick of the input packet that was applied to reach this state.
    pub input_tick: Option<Tick>,
    pub physics: PhysicsState,
    pub state: S,
    /// Bit per event id dispatched during this tick.
    pub events: u8,
    pub is_final: bool,

    // Local only, never sent.
    #[serde(skip)]
    pub start_time: f64,
    #[serde(skip)]
    pub end_time: f64,
}

impl<S: Default> Default for StateSnapshot<S> {
    fn default() -> Self {
        Self {
            local_tick: None,
            server_tick: None,
            input_tick: None,
            physics: PhysicsState::default(),
            state: S::default(),
            events: 0,
            is_final: false,
            start_time: 0.0,
            end_time: 0.0,
        }
    }
}

impl<S: PayloadState> StateSnapshot<S> {
    pub fn new(local_tick: Tick, physics: PhysicsState, state: S) -> Self {
        Self {
            local_tick: Some(local_tick),
            physics,
            state,
            ..Default::default()
        }
    }

    pub fn should_reconcile(&self, other: &StateSnapshot<S>, tolerances: &Tolerances) -> bool {
        self.physics.should_reconcile(&other.physics, tolerances)
            || self.events != other.events
            || self.is_final != other.is_final
            || self.state.should_reconcile(&other.state)
    }

    /// Blends `prev` towards `next`. Tick bookkeeping and flags are taken from `next`.
    pub fn interpolated(prev: &StateSnapshot<S>, next: &StateSnapshot<S>, alpha: f64) -> StateSnapshot<S> {
        StateSnapshot {
            physics: prev.physics.interpolate(&next.physics, alpha),
            state: prev.state.interpolate(&next.state, alpha),
            ..next.clone()
        }
    }

    pub fn has_event(&self, id: u8) -> bool {
        id < 8 && self.events & (1 << id) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::MotionMode;
    use nalgebra::{UnitQuaternion, Vector3};

    impl PayloadState for u32 {}

    fn snapshot(tick: Tick, x: f64) -> StateSnapshot<()> {
        StateSnapshot::new(tick, PhysicsState::at_position(Vector3::new(x, 0.0, 0.0)), ())
    }

    #[test]
    fn test_matching_snapshots() {
        let a = snapshot(1, 1.0);
        let b = snapshot(1, 1.05);
        assert!(!a.should_reconcile(&b, &Tolerances::default()));
    }

    #[test]
    fn test_event_and_final_mismatch() {
        let tolerances = Tolerances::default();
        let a = snapshot(1, 1.0);

        let mut with_event = a.clone();
        with_event.events = 0b10;
        assert!(a.should_reconcile(&with_event, &tolerances));

        let mut finished = a.clone();
        finished.is_final = true;
        assert!(a.should_reconcile(&finished, &tolerances));
    }

    #[test]
    fn test_payload_mismatch() {
        let a = StateSnapshot::new(1, PhysicsState::default(), 3u32);
        let b = StateSnapshot::new(1, PhysicsState::default(), 4u32);
        assert!(a.should_reconcile(&b, &Tolerances::default()));
    }

    #[test]
    fn test_reconcile_is_symmetric() {
        let tolerances = Tolerances::default();
        let mut a = snapshot(1, 0.0);
        let mut b = snapshot(1, 0.0);

        let offsets = [0.0, 0.05, 0.0999, 0.1001, 0.3, -0.2];
        for dx in offsets {
            for dv in offsets {
                a.physics.x.x = 0.0;
                b.physics.x.x = dx;
                a.physics.v.y = dv;
                b.physics.w.z = dx;
                b.physics.r = UnitQuaternion::from_euler_angles(0.0, dv, 0.0);
                assert_eq!(
                    a.should_reconcile(&b, &tolerances),
                    b.should_reconcile(&a, &tolerances)
                );
            }
        }

        b.physics.motion = MotionMode::Sleeping;
        assert_eq!(a.should_reconcile(&b, &tolerances), b.should_reconcile(&a, &tolerances));
    }

    #[test]
    fn test_has_event() {
        let mut s = snapshot(0, 0.0);
        s.events = 0b0000_0100;
        assert!(s.has_event(2));
        assert!(!s.has_event(1));
        assert!(!s.has_event(9));
    }
}
