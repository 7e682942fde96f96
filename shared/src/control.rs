//! One-byte authority to autonomous proxy control signal

use serde::{Deserialize, Serialize};

const LEVELS: f64 = 63.0;
const LEVEL_MASK: u8 = 0x7f;
const UNHEALTHY_BIT: u8 = 0x80;

/// Time dilation suggestion in [-1, 1] plus an input buffer health flag.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlPacket {
    pub time_dilation: f64,
    pub input_buffer_unhealthy: bool,
}

impl ControlPacket {
    pub fn new(time_dilation: f64, input_buffer_unhealthy: bool) -> Self {
        Self {
            time_dilation: time_dilation.clamp(-1.0, 1.0),
            input_buffer_unhealthy,
        }
    }

    /// Signed quantization level in -63..=63.
    pub fn quantized(&self) -> i8 {
        (self.time_dilation.clamp(-1.0, 1.0) * LEVELS).round() as i8
    }

    /// Low 7 bits hold the level biased by 63, the top bit holds the health flag.
    pub fn pack(&self) -> u8 {
        let level = (self.quantized() as i16 + LEVELS as i16) as u8 & LEVEL_MASK;
        if self.input_buffer_unhealthy {
            level | UNHEALTHY_BIT
        } else {
            level
        }
    }

    pub fn unpack(byte: u8) -> Self {
        let level = (byte & LEVEL_MASK) as i16 - LEVELS as i16;
        Self {
            time_dilation: (level as f64 / LEVELS).clamp(-1.0, 1.0),
            input_buffer_unhealthy: byte & UNHEALTHY_BIT != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_pack_extremes() {
        let fast = ControlPacket::unpack(ControlPacket::new(1.0, false).pack());
        assert_approx_eq!(fast.time_dilation, 1.0);
        assert!(!fast.input_buffer_unhealthy);

        let slow = ControlPacket::unpack(ControlPacket::new(-1.0, true).pack());
        assert_approx_eq!(slow.time_dilation, -1.0);
        assert!(slow.input_buffer_unhealthy);
    }

    #[test]
    fn test_zero_dilation() {
        let packet = ControlPacket::new(0.0, false);
        assert_eq!(packet.quantized(), 0);
        assert_approx_eq!(ControlPacket::unpack(packet.pack()).time_dilation, 0.0);
    }

    #[test]
    fn test_quantization_error_is_bounded() {
        for i in -100..=100 {
            let value = i as f64 / 100.0;
            let unpacked = ControlPacket::unpack(ControlPacket::new(value, false).pack());
            assert!((unpacked.time_dilation - value).abs() <= 0.5 / 63.0 + 1e-12);
        }
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        let packet = ControlPacket::new(4.0, false);
        assert_approx_eq!(packet.time_dilation, 1.0);
        assert_eq!(packet.quantized(), 63);
    }
}
