//! Tick numbering and per-tick timing

use serde::{Deserialize, Serialize};

/// One fixed-timestep physics step. Unset ticks are represented as `None`.
pub type Tick = i32;

/// Timing information handed to every driver callback for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickInfo {
    pub local_tick: Tick,
    /// Authority tick matching `local_tick`, once the local-to-server offset is known.
    pub server_tick: Option<Tick>,
    pub dt: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub is_resim: bool,
}

impl TickInfo {
    pub fn new(local_tick: Tick, dt: f64, server_tick_offset: Option<i32>, is_resim: bool) -> Self {
        let start_time = local_tick as f64 * dt;
        Self {
            local_tick,
            server_tick: server_tick_offset.map(|offset| local_tick + offset),
            dt,
            start_time,
            end_time: (local_tick + 1) as f64 * dt,
            is_resim,
        }
    }
}

/// Converts a duration into a whole number of ticks, rounding up.
pub fn ticks_for_duration(seconds: f64, dt: f64) -> i32 {
    if dt <= 0.0 {
        return 0;
    }
    (seconds / dt - 1e-9).ceil() as i32
}
