//! Byte layouts for snapshots and input bundles

use crate::error::{Result, SimError};
use crate::input::{InputPacket, InputPayload};
use crate::physics::{MotionMode, PhysicsState};
use crate::snapshot::{PayloadState, StateSnapshot};
use crate::tick::Tick;
use bincode::{deserialize_from, serialize_into};
use log::warn;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::de::DeserializeOwned;
use serde::Serialize;

const FINAL_BIT: u32 = 1 << 31;
const POSITION_SCALE: f64 = 100.0;
const ROTATION_SCALE: f64 = i16::MAX as f64;

/// How much of a snapshot goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Every field at full precision.
    Full,
    /// Quantized position and rotation only, for frequent sends to observers.
    Reduced,
}

/// Packs a tick as `(tick + 1) | (is_final << 31)`, so an unset tick is zero.
pub fn pack_tick_word(tick: Option<Tick>, is_final: bool) -> u32 {
    let value = match tick {
        Some(tick) if tick >= 0 => (tick as u32 + 1) & !FINAL_BIT,
        _ => 0,
    };
    if is_final {
        value | FINAL_BIT
    } else {
        value
    }
}

pub fn unpack_tick_word(word: u32) -> (Option<Tick>, bool) {
    let value = word & !FINAL_BIT;
    let tick = if value == 0 { None } else { Some(value as Tick - 1) };
    (tick, word & FINAL_BIT != 0)
}

fn write<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<()> {
    serialize_into(buf, value).map_err(|e| SimError::Encode(e.to_string()))
}

fn read<T: DeserializeOwned>(cursor: &mut &[u8]) -> Result<T> {
    Ok(deserialize_from(cursor)?)
}

fn write_vector(buf: &mut Vec<u8>, v: &Vector3<f64>) -> Result<()> {
    write(buf, &[v.x, v.y, v.z])
}

fn read_vector(cursor: &mut &[u8]) -> Result<Vector3<f64>> {
    let [x, y, z]: [f64; 3] = read(cursor)?;
    Ok(Vector3::new(x, y, z))
}

fn quantize_position(value: f64) -> i32 {
    (value * POSITION_SCALE)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

pub fn encode_snapshot<S: PayloadState>(snapshot: &StateSnapshot<S>, completeness: Completeness) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    write(&mut buf, &pack_tick_word(snapshot.local_tick, snapshot.is_final))?;
    write(&mut buf, &pack_tick_word(snapshot.server_tick, false))?;
    write(&mut buf, &snapshot.events)?;

    let physics = &snapshot.physics;
    match completeness {
        Completeness::Reduced => {
            let x = [
                quantize_position(physics.x.x),
                quantize_position(physics.x.y),
                quantize_position(physics.x.z),
            ];
            let q = physics.r.quaternion();
            let r = [q.i, q.j, q.k, q.w].map(|c| (c.clamp(-1.0, 1.0) * ROTATION_SCALE).round() as i16);
            write(&mut buf, &x)?;
            write(&mut buf, &r)?;
        }
        Completeness::Full => {
            write(&mut buf, &pack_tick_word(snapshot.input_tick, false))?;
            write(&mut buf, &physics.motion.to_byte())?;
            write_vector(&mut buf, &physics.x)?;
            write_vector(&mut buf, &physics.v)?;
            let q = physics.r.quaternion();
            write(&mut buf, &[q.i, q.j, q.k, q.w])?;
            write_vector(&mut buf, &physics.w)?;
            write(&mut buf, &snapshot.state)?;
        }
    }

    Ok(buf)
}

pub fn decode_snapshot<S: PayloadState>(bytes: &[u8], completeness: Completeness) -> Result<StateSnapshot<S>> {
    let mut cursor = bytes;
    let (local_tick, is_final) = unpack_tick_word(read(&mut cursor)?);
    let (server_tick, _) = unpack_tick_word(read(&mut cursor)?);
    let events: u8 = read(&mut cursor)?;

    let mut snapshot = StateSnapshot {
        local_tick,
        server_tick,
        events,
        is_final,
        ..StateSnapshot::default()
    };

    match completeness {
        Completeness::Reduced => {
            let x: [i32; 3] = read(&mut cursor)?;
            let r: [i16; 4] = read(&mut cursor)?;
            let [i, j, k, w] = r.map(|c| c as f64 / ROTATION_SCALE);

            snapshot.physics = PhysicsState {
                motion: MotionMode::Kinematic,
                x: Vector3::new(x[0] as f64, x[1] as f64, x[2] as f64) / POSITION_SCALE,
                r: UnitQuaternion::new_normalize(Quaternion::new(w, i, j, k)),
                ..PhysicsState::default()
            };
        }
        Completeness::Full => {
            let (input_tick, _) = unpack_tick_word(read(&mut cursor)?);
            let motion_byte: u8 = read(&mut cursor)?;
            let motion = MotionMode::from_byte(motion_byte)
                .ok_or_else(|| SimError::Decode(format!("unknown motion mode {motion_byte}")))?;
            let x = read_vector(&mut cursor)?;
            let v = read_vector(&mut cursor)?;
            let [i, j, k, w]: [f64; 4] = read(&mut cursor)?;
            let angular = read_vector(&mut cursor)?;

            snapshot.input_tick = input_tick;
            snapshot.physics = PhysicsState {
                motion,
                x,
                r: UnitQuaternion::new_normalize(Quaternion::new(w, i, j, k)),
                v,
                w: angular,
            };
            snapshot.state = read(&mut cursor)?;
        }
    }

    Ok(snapshot)
}

/// Encodes up to 255 packets as a count byte followed by the packets.
pub fn encode_input_bundle<I: InputPayload>(packets: &[InputPacket<I>]) -> Result<Vec<u8>> {
    let packets = if packets.len() > u8::MAX as usize {
        warn!("Input bundle of {} packets truncated to {}", packets.len(), u8::MAX);
        &packets[packets.len() - u8::MAX as usize..]
    } else {
        packets
    };

    let mut buf = Vec::with_capacity(1 + packets.len() * 8);
    write(&mut buf, &(packets.len() as u8))?;
    for packet in packets {
        write(&mut buf, &pack_tick_word(Some(packet.tick), false))?;
        write(&mut buf, &packet.body)?;
    }
    Ok(buf)
}

pub fn decode_input_bundle<I: InputPayload>(bytes: &[u8]) -> Result<Vec<InputPacket<I>>> {
    let mut cursor = bytes;
    let count: u8 = read(&mut cursor)?;

    let mut packets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (tick, _) = unpack_tick_word(read(&mut cursor)?);
        let body: I = read(&mut cursor)?;
        let tick = tick.ok_or_else(|| SimError::Decode("input packet without a tick".to_string()))?;
        packets.push(InputPacket::new(tick, body));
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Charge {
        level: u16,
    }

    impl PayloadState for Charge {}

    fn sample() -> StateSnapshot<Charge> {
        let mut snapshot = StateSnapshot::new(
            41,
            PhysicsState {
                motion: MotionMode::Dynamic,
                x: Vector3::new(1.234567, -20.5, 3.0),
                r: UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
                v: Vector3::new(0.5, 0.25, -1.0),
                w: Vector3::new(0.0, 1.5, 0.0),
            },
            Charge { level: 7 },
        );
        snapshot.server_tick = Some(100);
        snapshot.input_tick = Some(38);
        snapshot.events = 0b101;
        snapshot
    }

    #[test]
    fn test_tick_word_layout() {
        assert_eq!(pack_tick_word(None, false), 0);
        assert_eq!(pack_tick_word(Some(0), false), 1);
        assert_eq!(pack_tick_word(Some(9), true), 10 | (1 << 31));
        assert_eq!(unpack_tick_word(10 | (1 << 31)), (Some(9), true));
        assert_eq!(unpack_tick_word(0), (None, false));
        assert_eq!(unpack_tick_word(1 << 31), (None, true));
    }

    #[test]
    fn test_full_snapshot_is_exact() {
        let snapshot = sample();
        let bytes = encode_snapshot(&snapshot, Completeness::Full).unwrap();
        let decoded: StateSnapshot<Charge> = decode_snapshot(&bytes, Completeness::Full).unwrap();

        assert_eq!(decoded.local_tick, Some(41));
        assert_eq!(decoded.server_tick, Some(100));
        assert_eq!(decoded.input_tick, Some(38));
        assert_eq!(decoded.physics.x, snapshot.physics.x);
        assert_eq!(decoded.physics.v, snapshot.physics.v);
        assert_eq!(decoded.physics.w, snapshot.physics.w);
        assert_approx_eq!(decoded.physics.r.angle_to(&snapshot.physics.r), 0.0, 1e-12);
        assert_eq!(decoded.state, Charge { level: 7 });
        assert_eq!(decoded.events, 0b101);
        assert!(!decoded.is_final);
    }

    #[test]
    fn test_reduced_snapshot_is_quantized() {
        let mut snapshot = sample();
        snapshot.is_final = true;

        let full = encode_snapshot(&snapshot, Completeness::Full).unwrap();
        let reduced = encode_snapshot(&snapshot, Completeness::Reduced).unwrap();
        assert!(reduced.len() < full.len());

        let decoded: StateSnapshot<Charge> = decode_snapshot(&reduced, Completeness::Reduced).unwrap();
        assert!(decoded.is_final);
        assert_eq!(decoded.local_tick, Some(41));
        assert_eq!(decoded.physics.motion, MotionMode::Kinematic);
        assert_approx_eq!(decoded.physics.x.x, 1.23, 1e-9);
        assert_approx_eq!(decoded.physics.x.y, -20.5, 1e-9);
        assert!(decoded.physics.r.angle_to(&snapshot.physics.r) < 1e-3);
        assert_eq!(decoded.state, Charge::default());
        assert_eq!(decoded.input_tick, None);
    }

    #[test]
    fn test_truncated_snapshot_fails() {
        let bytes = encode_snapshot(&sample(), Completeness::Full).unwrap();
        let result: Result<StateSnapshot<Charge>> = decode_snapshot(&bytes[..10], Completeness::Full);
        assert!(matches!(result, Err(SimError::Decode(_))));
    }

    #[test]
    fn test_input_bundle() {
        let packets: Vec<InputPacket<u16>> = (5..8).map(|tick| InputPacket::new(tick, tick as u16 * 2)).collect();
        let bytes = encode_input_bundle(&packets).unwrap();

        assert_eq!(bytes[0], 3);
        assert_eq!(decode_input_bundle::<u16>(&bytes).unwrap(), packets);
    }

    #[test]
    fn test_input_bundle_keeps_newest_when_oversized() {
        let packets: Vec<InputPacket<u8>> = (0..300).map(|tick| InputPacket::new(tick, 0)).collect();
        let decoded = decode_input_bundle::<u8>(&encode_input_bundle(&packets).unwrap()).unwrap();

        assert_eq!(decoded.len(), 255);
        assert_eq!(decoded.last().map(|p| p.tick), Some(299));
    }
}
