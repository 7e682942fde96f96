//! Timeline alignment between an observer and the authority
//!
//! Two independent mechanisms keep simulated proxies lined up with the
//! authority:
//! - [`TickOffsetEstimator`] maps authority ticks onto the local tick
//!   counter, driven by periodic server tick broadcasts. It only moves when the
//!   drift exceeds a threshold, so jitter never makes it thrash.
//! - [`ServerClock`] nudges the rate at which a proxy's virtual display time
//!   advances so it trails the newest authority data by a steady margin.

use log::{debug, info};
use shared::config::PredictionConfig;
use shared::events::RemoteProxyOffset;
use shared::tick::Tick;

/// Estimates `local = server + offset` for displaying authority data.
#[derive(Debug, Clone)]
pub struct TickOffsetEstimator {
    buffer_ticks: i32,
    threshold: i32,
    recalibration_period: i32,
    offset: Option<i32>,
    last_server_tick: Option<Tick>,
    last_recalibration: Option<Tick>,
}

impl TickOffsetEstimator {
    pub fn new(buffer_ticks: i32, threshold: i32, recalibration_period: i32) -> Self {
        Self {
            buffer_ticks,
            threshold,
            recalibration_period: recalibration_period.max(1),
            offset: None,
            last_server_tick: None,
            last_recalibration: None,
        }
    }

    pub fn from_config(config: &PredictionConfig) -> Self {
        Self::new(
            config.offset_buffer_ticks,
            config.offset_correction_threshold,
            config.offset_recalibration_period_ticks,
        )
    }

    pub fn offset(&self) -> Option<i32> {
        self.offset
    }

    pub fn last_server_tick(&self) -> Option<Tick> {
        self.last_server_tick
    }

    /// Records a broadcast authority tick. Older broadcasts are ignored.
    pub fn observe_server_tick(&mut self, server_tick: Tick) {
        if self.last_server_tick.map_or(true, |last| server_tick > last) {
            self.last_server_tick = Some(server_tick);
        }
    }

    /// Recomputes the offset if a recalibration period has passed since the
    /// last one. Returns the offset to report to the authority when it changed.
    pub fn update(&mut self, local_tick: Tick) -> Option<RemoteProxyOffset> {
        let due = self
            .last_recalibration
            .map_or(true, |last| local_tick - last >= self.recalibration_period);
        if !due || self.last_server_tick.is_none() {
            return None;
        }

        self.last_recalibration = Some(local_tick);
        self.recalibrate(local_tick)
    }

    /// Recomputes the offset now.
    ///
    /// The first estimate is always taken. Later estimates replace it only when
    /// they differ by more than the correction threshold.
    pub fn recalibrate(&mut self, local_tick: Tick) -> Option<RemoteProxyOffset> {
        let server_tick = self.last_server_tick?;
        let estimate = local_tick - server_tick + self.buffer_ticks;

        match self.offset {
            Some(current) if (estimate - current).abs() <= self.threshold => {
                debug!("Tick offset estimate {} within threshold of {}", estimate, current);
                return None;
            }
            Some(current) => info!("Tick offset moved from {} to {}", current, estimate),
            None => info!("Tick offset established at {}", estimate),
        }

        self.offset = Some(estimate);
        Some(RemoteProxyOffset {
            expected_applied_server_tick: local_tick - estimate,
            server_tick_offset: estimate,
        })
    }
}

/// How the display clock should move this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockAdjustment {
    /// Jump straight to this virtual time.
    Snap(f64),
    /// Advance at this multiple of real time.
    Scale(f64),
}

#[derive(Debug, Clone)]
pub struct ServerClock {
    snap_difference: f64,
    aggressive_difference: f64,
    aggressive_dilation: f64,
    dilation: f64,
    alpha: f64,
    /// Differences smaller than this count as on target.
    dead_band: f64,
    timescale: f64,
}

impl ServerClock {
    pub fn new(config: &PredictionConfig) -> Self {
        Self {
            snap_difference: config.sim_proxy_snap_time_difference,
            aggressive_difference: config.sim_proxy_aggressive_time_difference,
            aggressive_dilation: config.sim_proxy_aggressive_time_dilation,
            dilation: config.sim_proxy_time_dilation,
            alpha: config.sim_proxy_time_dilation_alpha,
            dead_band: config.fixed_dt * 0.5,
            timescale: 1.0,
        }
    }

    pub fn timescale(&self) -> f64 {
        self.timescale
    }

    /// Compares the current virtual time with where it should be.
    pub fn adjust(&mut self, virtual_time: f64, target_time: f64) -> ClockAdjustment {
        let difference = target_time - virtual_time;
        let magnitude = difference.abs();

        if magnitude >= self.snap_difference {
            debug!("Display clock off by {:.3}s, snapping", difference);
            self.timescale = 1.0;
            return ClockAdjustment::Snap(target_time);
        }

        if magnitude >= self.aggressive_difference {
            self.timescale = 1.0 + difference.signum() * self.aggressive_dilation;
            return ClockAdjustment::Scale(self.timescale);
        }

        let direction = if magnitude < self.dead_band { 0.0 } else { difference.signum() };
        let target = 1.0 + direction * self.dilation;
        self.timescale += self.alpha * (target - self.timescale);
        ClockAdjustment::Scale(self.timescale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_first_observation_sets_offset() {
        let mut estimator = TickOffsetEstimator::new(6, 6, 30);
        assert!(estimator.update(100).is_none());

        estimator.observe_server_tick(40);
        let offset = estimator.update(100).unwrap();
        assert_eq!(offset.server_tick_offset, 66);
        assert_eq!(offset.expected_applied_server_tick, 34);
        assert_eq!(estimator.offset(), Some(66));
    }

    #[test]
    fn test_small_drift_keeps_offset() {
        let mut estimator = TickOffsetEstimator::new(6, 6, 1);
        estimator.observe_server_tick(40);
        estimator.update(100);

        for (local, server) in [(110, 48), (120, 62), (130, 69), (140, 74)] {
            estimator.observe_server_tick(server);
            assert!(estimator.update(local).is_none());
        }
        assert_eq!(estimator.offset(), Some(66));
    }

    #[test]
    fn test_large_drift_updates_once() {
        let mut estimator = TickOffsetEstimator::new(6, 6, 1);
        estimator.observe_server_tick(40);
        estimator.update(100);

        estimator.observe_server_tick(50);
        let moved = estimator.update(117).unwrap();
        assert_eq!(moved.server_tick_offset, 73);

        estimator.observe_server_tick(51);
        assert!(estimator.update(118).is_none());
        assert_eq!(estimator.offset(), Some(73));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut estimator = TickOffsetEstimator::new(0, 6, 1);
        estimator.observe_server_tick(0);
        estimator.update(10);

        estimator.observe_server_tick(1);
        assert!(estimator.update(17).is_none());
        assert!(estimator.update(18).is_some());
    }

    #[test]
    fn test_recalibration_period() {
        let mut estimator = TickOffsetEstimator::new(6, 6, 30);
        estimator.observe_server_tick(40);
        estimator.update(100);

        estimator.observe_server_tick(40);
        assert!(estimator.update(120).is_none());
        assert_eq!(estimator.offset(), Some(66));

        assert_eq!(estimator.update(130).unwrap().server_tick_offset, 96);
    }

    #[test]
    fn test_stale_broadcast_ignored() {
        let mut estimator = TickOffsetEstimator::new(6, 6, 30);
        estimator.observe_server_tick(40);
        estimator.observe_server_tick(35);
        assert_eq!(estimator.last_server_tick(), Some(40));
    }

    #[test]
    fn test_clock_snaps_on_large_difference() {
        let mut clock = ServerClock::new(&PredictionConfig::default());
        assert_eq!(clock.adjust(1.0, 1.5), ClockAdjustment::Snap(1.5));
        assert_approx_eq!(clock.timescale(), 1.0);
    }

    #[test]
    fn test_clock_aggressive_band() {
        let mut clock = ServerClock::new(&PredictionConfig::default());
        assert_eq!(clock.adjust(1.0, 1.25), ClockAdjustment::Scale(1.2));
        assert_eq!(clock.adjust(1.25, 1.0), ClockAdjustment::Scale(0.8));
    }

    #[test]
    fn test_clock_smooths_small_difference() {
        let mut clock = ServerClock::new(&PredictionConfig::default());
        let ClockAdjustment::Scale(first) = clock.adjust(1.0, 1.1) else {
            panic!("expected a timescale");
        };
        assert!(first > 1.0 && first < 1.02);

        for _ in 0..500 {
            clock.adjust(1.0, 1.1);
        }
        assert_approx_eq!(clock.timescale(), 1.02, 1e-3);

        for _ in 0..500 {
            clock.adjust(1.0, 1.0);
        }
        assert_approx_eq!(clock.timescale(), 1.0, 1e-3);
    }
}
