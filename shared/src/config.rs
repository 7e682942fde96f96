//! Tunables consumed by the drivers and the world manager

use crate::error::{Result, SimError};
use crate::tick::ticks_for_duration;
use log::warn;
use serde::{Deserialize, Serialize};

/// Per-field thresholds below which a state difference is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub position: f64,
    pub velocity: f64,
    pub rotation: f64,
    pub angular_velocity: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            position: 0.1,
            velocity: 0.1,
            rotation: 0.1,
            angular_velocity: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Fixed physics timestep in seconds.
    pub fixed_dt: f64,
    /// Upper bound on real time consumed by a single `advance` call.
    pub max_physics_time: f64,
    /// How much simulated time the rewind window and state history cover.
    pub history_time_ms: u32,
    pub max_forced_simulation_ticks: u32,
    pub forward_prediction_ticks: u32,

    pub desired_input_buffer_size: usize,
    pub dropped_packet_memory_tick_length: i32,
    pub time_dilation_alpha: f64,
    pub input_sliding_window_size: usize,
    /// Largest fraction the autonomous proxy may speed up or slow down by.
    pub max_time_dilation: f64,
    pub authority_catchup_timescale: f64,
    pub snapshot_send_cadence: i32,

    pub sim_proxy_delay: f64,
    pub sim_proxy_aggressive_time_difference: f64,
    pub sim_proxy_snap_time_difference: f64,
    pub sim_proxy_time_dilation: f64,
    pub sim_proxy_aggressive_time_dilation: f64,
    pub sim_proxy_time_dilation_alpha: f64,

    pub offset_buffer_ticks: i32,
    pub offset_correction_threshold: i32,
    pub offset_recalibration_period_ticks: i32,
    pub server_tick_broadcast_period: i32,

    /// Quantized levels the dilation must move before a new control packet is sent.
    pub control_packet_epsilon: i8,
    /// Consecutive corrections tolerated before divergence is logged as a warning.
    pub correction_warn_threshold: u32,

    pub tolerances: Tolerances,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_physics_time: 1.0,
            history_time_ms: 500,
            max_forced_simulation_ticks: 50,
            forward_prediction_ticks: 5,
            desired_input_buffer_size: 3,
            dropped_packet_memory_tick_length: 25,
            time_dilation_alpha: 0.1,
            input_sliding_window_size: 3,
            max_time_dilation: 0.01,
            authority_catchup_timescale: 0.1,
            snapshot_send_cadence: 2,
            sim_proxy_delay: 0.050,
            sim_proxy_aggressive_time_difference: 0.2,
            sim_proxy_snap_time_difference: 0.4,
            sim_proxy_time_dilation: 0.02,
            sim_proxy_aggressive_time_dilation: 0.2,
            sim_proxy_time_dilation_alpha: 0.02,
            offset_buffer_ticks: 6,
            offset_correction_threshold: 6,
            offset_recalibration_period_ticks: 30,
            server_tick_broadcast_period: 10,
            control_packet_epsilon: 1,
            correction_warn_threshold: 3,
            tolerances: Tolerances::default(),
        }
    }
}

impl PredictionConfig {
    /// Number of ticks the physics rewind window spans.
    pub fn rewind_buffer_ticks(&self) -> i32 {
        ticks_for_duration(self.history_time_ms as f64 / 1000.0, self.fixed_dt)
    }

    /// State history capacity. Wider than the rewind window so a reconciliation
    /// lookup never races the oldest entry being evicted.
    pub fn history_capacity(&self) -> usize {
        self.rewind_buffer_ticks().max(1) as usize
            + self.max_forced_simulation_ticks as usize
            + self.input_sliding_window_size
    }

    pub fn sim_proxy_delay_ticks(&self) -> i32 {
        ticks_for_duration(self.sim_proxy_delay, self.fixed_dt)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.fixed_dt > 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "fixed_dt must be positive, got {}",
                self.fixed_dt
            )));
        }
        if self.max_physics_time < self.fixed_dt {
            return Err(SimError::InvalidConfig(
                "max_physics_time must cover at least one tick".to_string(),
            ));
        }
        if self.history_time_ms == 0 || self.input_sliding_window_size == 0 {
            return Err(SimError::InvalidConfig(
                "history and input window sizes must be non-zero".to_string(),
            ));
        }
        if self.snapshot_send_cadence <= 0 || self.server_tick_broadcast_period <= 0 {
            return Err(SimError::InvalidConfig(
                "send cadences must be positive".to_string(),
            ));
        }
        for (name, alpha) in [
            ("time_dilation_alpha", self.time_dilation_alpha),
            ("sim_proxy_time_dilation_alpha", self.sim_proxy_time_dilation_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(SimError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {alpha}"
                )));
            }
        }

        let t = &self.tolerances;
        if t.position < 0.0 || t.velocity < 0.0 || t.rotation < 0.0 || t.angular_velocity < 0.0 {
            return Err(SimError::InvalidConfig(
                "tolerances cannot be negative".to_string(),
            ));
        }

        if self.offset_recalibration_period_ticks < self.offset_correction_threshold {
            warn!(
                "Offset recalibration period ({} ticks) is shorter than the correction threshold ({} ticks), the offset may oscillate",
                self.offset_recalibration_period_ticks, self.offset_correction_threshold
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PredictionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rewind_buffer_ticks(), 30);
        assert_eq!(config.sim_proxy_delay_ticks(), 3);
    }

    #[test]
    fn test_history_capacity_exceeds_rewind_window() {
        let config = PredictionConfig::default();
        assert!(config.history_capacity() > config.rewind_buffer_ticks() as usize);
    }

    #[test]
    fn test_invalid_dt_rejected() {
        let config = PredictionConfig {
            fixed_dt: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let config = PredictionConfig {
            time_dilation_alpha: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_tolerance_rejected() {
        let mut config = PredictionConfig::default();
        config.tolerances.rotation = -0.1;
        assert!(config.validate().is_err());
    }
}
