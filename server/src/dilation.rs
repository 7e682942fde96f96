//! Input buffer pacing feedback
//!
//! The authority wants a small, steady number of inputs waiting in its
//! buffer. When the buffer runs long the owning client should slow down;
//! when it runs short, or inputs are being lost, the client should speed up.
//! The suggestion is smoothed and only sent when its quantized value changes.

use log::debug;
use shared::config::PredictionConfig;
use shared::control::ControlPacket;

#[derive(Debug, Clone)]
pub struct TimeDilationEstimator {
    desired_size: usize,
    alpha: f64,
    /// Quantized levels the suggestion must move before it is resent
    epsilon: i8,
    /// Smoothed suggestion in [-1, 1]
    dilation: f64,
    last_sent: Option<ControlPacket>,
}

impl TimeDilationEstimator {
    pub fn new(desired_size: usize, alpha: f64, epsilon: i8) -> Self {
        Self {
            desired_size,
            alpha,
            epsilon: epsilon.max(1),
            dilation: 0.0,
            last_sent: None,
        }
    }

    pub fn from_config(config: &PredictionConfig) -> Self {
        Self::new(
            config.desired_input_buffer_size,
            config.time_dilation_alpha,
            config.control_packet_epsilon,
        )
    }

    /// Folds in the current buffer occupancy
    ///
    /// Returns a control packet when it differs materially from the last one
    /// returned.
    pub fn update(&mut self, buffer_size: usize, recently_dropped: usize) -> Option<ControlPacket> {
        let delta = buffer_size as i64 - (self.desired_size + recently_dropped) as i64;
        let target = -(delta.signum() as f64);
        self.dilation += self.alpha * (target - self.dilation);

        let unhealthy = buffer_size < self.desired_size || recently_dropped > 0;
        let packet = ControlPacket::new(self.dilation, unhealthy);

        let changed = match &self.last_sent {
            None => true,
            Some(last) => {
                (last.quantized() as i16 - packet.quantized() as i16).abs() >= self.epsilon as i16
                    || last.input_buffer_unhealthy != packet.input_buffer_unhealthy
            }
        };

        if !changed {
            return None;
        }

        debug!(
            "Time dilation suggestion {:.3} (buffer {}, dropped {}, unhealthy {})",
            self.dilation, buffer_size, recently_dropped, unhealthy
        );
        self.last_sent = Some(packet);
        Some(packet)
    }

    pub fn dilation(&self) -> f64 {
        self.dilation
    }

    pub fn last_sent(&self) -> Option<ControlPacket> {
        self.last_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_first_update_always_sends() {
        let mut estimator = TimeDilationEstimator::new(3, 0.1, 1);
        let packet = estimator.update(3, 0).unwrap();
        assert_eq!(packet.quantized(), 0);
        assert!(!packet.input_buffer_unhealthy);
    }

    #[test]
    fn test_steady_buffer_sends_nothing_more() {
        let mut estimator = TimeDilationEstimator::new(3, 0.1, 1);
        estimator.update(3, 0);
        for _ in 0..20 {
            assert!(estimator.update(3, 0).is_none());
        }
        assert_approx_eq!(estimator.dilation(), 0.0);
    }

    #[test]
    fn test_long_buffer_slows_client() {
        let mut estimator = TimeDilationEstimator::new(3, 0.1, 1);
        for _ in 0..50 {
            estimator.update(8, 0);
        }
        assert!(estimator.dilation() < -0.9);
        assert!(estimator.last_sent().unwrap().quantized() < 0);
    }

    #[test]
    fn test_drops_speed_client_up() {
        let mut estimator = TimeDilationEstimator::new(3, 0.1, 1);
        let packet = estimator.update(3, 1).unwrap();
        assert!(packet.input_buffer_unhealthy);
        assert!(estimator.dilation() > 0.0);
    }

    #[test]
    fn test_epsilon_suppresses_small_moves() {
        let mut estimator = TimeDilationEstimator::new(3, 0.02, 4);
        estimator.update(3, 0);

        // The health flag flips at level 1.
        assert!(estimator.update(2, 0).is_some());
        assert!(estimator.update(2, 0).is_none());
        assert!(estimator.update(2, 0).is_none());
        assert_eq!(estimator.update(2, 0).unwrap().quantized(), 5);
    }

    #[test]
    fn test_unhealthy_flag_change_is_material() {
        let mut estimator = TimeDilationEstimator::new(3, 0.0, 1);
        assert!(estimator.update(3, 0).is_some());
        assert!(estimator.update(3, 0).is_none());

        let packet = estimator.update(2, 0).unwrap();
        assert!(packet.input_buffer_unhealthy);
        assert_eq!(packet.quantized(), 0);
    }
}
