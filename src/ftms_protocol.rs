//! FTMS (Fitness Machine Service, BLE SIG 0x1826) wire format: UUIDs, the
//! Treadmill Data notification, Control Point opcode parsing/encoding, and
//! the fixed static characteristics (Feature, ranges, Training Status).
//!
//! Layout mirrors the BLE SIG assigned-numbers document; byte orders are
//! all little-endian per GATT convention.

use uuid::Uuid;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128)
}

pub const FTMS_SERVICE: Uuid = ble_uuid(0x1826);
pub const TREADMILL_DATA: Uuid = ble_uuid(0x2ACD);
pub const CONTROL_POINT: Uuid = ble_uuid(0x2AD9);
pub const FEATURE: Uuid = ble_uuid(0x2ACC);
pub const MACHINE_STATUS: Uuid = ble_uuid(0x2ADA);
pub const TRAINING_STATUS: Uuid = ble_uuid(0x2AD3);
pub const SPEED_RANGE: Uuid = ble_uuid(0x2AD4);
pub const INCLINE_RANGE: Uuid = ble_uuid(0x2AD5);

pub const DEVICE_INFO_SERVICE: Uuid = ble_uuid(0x180A);
pub const MANUFACTURER_NAME: Uuid = ble_uuid(0x2A29);
pub const MODEL_NUMBER: Uuid = ble_uuid(0x2A24);
pub const FIRMWARE_REVISION: Uuid = ble_uuid(0x2A26);
pub const SERIAL_NUMBER: Uuid = ble_uuid(0x2A25);

/// Fixed feature mask: total distance + inclination + expended energy +
/// speed/incline target support. Byte layout per spec: byte 0 bit 1 total
/// distance, bit 5 inclination; byte 1 bit 0 expended energy; byte 4 bit 0
/// speed target, bit 1 incline target.
pub const FEATURE_VALUE: [u8; 8] = [0x22, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00];

pub const TRAINING_STATUS_IDLE: [u8; 2] = [0x00, 0x01];

/// Treadmill Data notification flags: distance, incline+ramp, energy,
/// elapsed time. Field order in the payload must follow this bit order.
const TREADMILL_DATA_FLAGS: u16 = 0x048C;

/// Encode the Treadmill Data notification from vendor-raw derived values.
///
/// `speed_raw` and `incline_raw` are already in FTMS units (×0.01 km/h and
/// ×0.1 %, the caller having applied unit reconciliation). `distance_m` and
/// `calories_kcal` are plain SI and get capped/truncated to fit their wire
/// widths.
pub fn encode_treadmill_data(
    speed_raw: u16,
    incline_tenths_pct: i16,
    distance_m: f64,
    calories_kcal: f64,
    elapsed_time_s: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&TREADMILL_DATA_FLAGS.to_le_bytes());
    buf.extend_from_slice(&speed_raw.to_le_bytes());

    let distance_u24 = distance_m.max(0.0).min(16_777_215.0) as u32;
    buf.push((distance_u24 & 0xFF) as u8);
    buf.push(((distance_u24 >> 8) & 0xFF) as u8);
    buf.push(((distance_u24 >> 16) & 0xFF) as u8);

    buf.extend_from_slice(&incline_tenths_pct.to_le_bytes());
    buf.extend_from_slice(&0i16.to_le_bytes()); // ramp_angle, unused

    let calories_total = calories_kcal.max(0.0).min(65535.0) as u16;
    buf.extend_from_slice(&calories_total.to_le_bytes());
    buf.extend_from_slice(&0xFFFFu16.to_le_bytes()); // calories_per_hour, n/a
    buf.push(0xFF); // calories_per_min, n/a

    let elapsed_capped = elapsed_time_s.min(65535) as u16;
    buf.extend_from_slice(&elapsed_capped.to_le_bytes());

    buf
}

pub fn encode_feature() -> Vec<u8> {
    FEATURE_VALUE.to_vec()
}

/// `Supported Speed Range`: min=100, max=2000, step=10 (×0.01 km/h).
pub fn encode_speed_range() -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&100u16.to_le_bytes());
    buf.extend_from_slice(&2000u16.to_le_bytes());
    buf.extend_from_slice(&10u16.to_le_bytes());
    buf
}

/// `Supported Incline Range`: min=-60, max=150, step=10 (×0.1 %).
pub fn encode_incline_range() -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&(-60i16).to_le_bytes());
    buf.extend_from_slice(&150i16.to_le_bytes());
    buf.extend_from_slice(&10u16.to_le_bytes());
    buf
}

/// A parsed Control Point write, before unit reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointCommand {
    RequestControl,
    Reset,
    SetTargetSpeed(u16),
    SetTargetIncline(i16),
    StartResume,
    StopPause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointError {
    UnsupportedOpcode,
    InvalidParameter,
}

/// Result codes per the FTMS Control Point response: `80 <op> <result>`.
pub const RESULT_SUCCESS: u8 = 0x01;
pub const RESULT_OP_NOT_SUPPORTED: u8 = 0x02;
pub const RESULT_INVALID_PARAMETER: u8 = 0x03;

/// Parse a raw Control Point write into a command, or an error result code
/// to send back untranslated (no command enqueued).
pub fn parse_control_point(data: &[u8]) -> Result<ControlPointCommand, ControlPointError> {
    let opcode = *data.first().ok_or(ControlPointError::InvalidParameter)?;
    match opcode {
        0x00 => Ok(ControlPointCommand::RequestControl),
        0x01 => Ok(ControlPointCommand::Reset),
        0x02 => {
            let v = data.get(1..3).ok_or(ControlPointError::InvalidParameter)?;
            Ok(ControlPointCommand::SetTargetSpeed(u16::from_le_bytes([
                v[0], v[1],
            ])))
        }
        0x03 => {
            let v = data.get(1..3).ok_or(ControlPointError::InvalidParameter)?;
            Ok(ControlPointCommand::SetTargetIncline(i16::from_le_bytes([
                v[0], v[1],
            ])))
        }
        0x07 => Ok(ControlPointCommand::StartResume),
        0x08 => Ok(ControlPointCommand::StopPause),
        _ => Err(ControlPointError::UnsupportedOpcode),
    }
}

/// The raw opcode byte for a parsed command, used to build the `80 <op>
/// <result>` indication.
pub fn opcode_of(cmd: ControlPointCommand) -> u8 {
    match cmd {
        ControlPointCommand::RequestControl => 0x00,
        ControlPointCommand::Reset => 0x01,
        ControlPointCommand::SetTargetSpeed(_) => 0x02,
        ControlPointCommand::SetTargetIncline(_) => 0x03,
        ControlPointCommand::StartResume => 0x07,
        ControlPointCommand::StopPause => 0x08,
    }
}

/// Build the `80 <op> <result>` indication payload.
pub fn encode_control_response(opcode: u8, result: u8) -> Vec<u8> {
    vec![0x80, opcode, result]
}

/// Build the `80 <op> <result>` indication for a rejected write (unknown
/// opcode or bad parameters) directly from the parse error.
pub fn encode_error_response(raw_opcode_hint: u8, err: ControlPointError) -> Vec<u8> {
    let result = match err {
        ControlPointError::UnsupportedOpcode => RESULT_OP_NOT_SUPPORTED,
        ControlPointError::InvalidParameter => RESULT_INVALID_PARAMETER,
    };
    encode_control_response(raw_opcode_hint, result)
}

/// Fitness Machine Status values emitted on control transitions.
pub mod status {
    pub const STOPPED_OR_PAUSED: [u8; 2] = [0x02, 0x01];
    pub const STARTED_OR_RESUMED: [u8; 1] = [0x04];

    pub fn target_speed_changed(v: u16) -> Vec<u8> {
        let mut b = vec![0x05];
        b.extend_from_slice(&v.to_le_bytes());
        b
    }

    pub fn target_incline_changed(v: i16) -> Vec<u8> {
        let mut b = vec![0x06];
        b.extend_from_slice(&v.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_embed_the_short_form() {
        assert_eq!(FTMS_SERVICE.as_bytes()[0..2], [0x18, 0x26]);
        assert_eq!(TREADMILL_DATA.as_bytes()[0..2], [0x2A, 0xCD]);
        assert_eq!(CONTROL_POINT.as_bytes()[0..2], [0x2A, 0xD9]);
    }

    #[test]
    fn treadmill_data_frame_has_documented_flags_and_layout() {
        let frame = encode_treadmill_data(300, 50, 12.0, 3.0, 42);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), 0x048C);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 300);
        assert_eq!(frame[4], 12); // distance u24 low byte
        assert_eq!(i16::from_le_bytes([frame[7], frame[8]]), 50); // incline
        assert_eq!(i16::from_le_bytes([frame[9], frame[10]]), 0); // ramp
        assert_eq!(u16::from_le_bytes([frame[11], frame[12]]), 3); // calories
        assert_eq!(u16::from_le_bytes([frame[13], frame[14]]), 0xFFFF);
        assert_eq!(frame[15], 0xFF);
        assert_eq!(u16::from_le_bytes([frame[16], frame[17]]), 42);
    }

    #[test]
    fn treadmill_data_caps_calories_and_elapsed_time() {
        let frame = encode_treadmill_data(0, 0, 0.0, 1_000_000.0, u32::MAX);
        assert_eq!(u16::from_le_bytes([frame[11], frame[12]]), 65535);
        assert_eq!(u16::from_le_bytes([frame[16], frame[17]]), 65535);
    }

    #[test]
    fn feature_value_matches_documented_bytes() {
        assert_eq!(encode_feature(), vec![0x22, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn speed_and_incline_ranges_match_spec() {
        assert_eq!(encode_speed_range(), vec![100, 0, 0xD0, 0x07, 10, 0]);
        let incline = encode_incline_range();
        assert_eq!(i16::from_le_bytes([incline[0], incline[1]]), -60);
        assert_eq!(i16::from_le_bytes([incline[2], incline[3]]), 150);
    }

    #[test]
    fn parse_every_opcode_byte() {
        for op in 0u8..=255 {
            let data = [op, 0, 0];
            let result = parse_control_point(&data);
            match op {
                0x00 => assert_eq!(result, Ok(ControlPointCommand::RequestControl)),
                0x01 => assert_eq!(result, Ok(ControlPointCommand::Reset)),
                0x02 => assert_eq!(result, Ok(ControlPointCommand::SetTargetSpeed(0))),
                0x03 => assert_eq!(result, Ok(ControlPointCommand::SetTargetIncline(0))),
                0x07 => assert_eq!(result, Ok(ControlPointCommand::StartResume)),
                0x08 => assert_eq!(result, Ok(ControlPointCommand::StopPause)),
                _ => assert_eq!(result, Err(ControlPointError::UnsupportedOpcode)),
            }
        }
    }

    #[test]
    fn set_target_speed_parses_s1_bytes() {
        // S1: opcode 0x02, speed 0x012C = 300.
        let cmd = parse_control_point(&[0x02, 0x2C, 0x01]).unwrap();
        assert_eq!(cmd, ControlPointCommand::SetTargetSpeed(300));
    }

    #[test]
    fn set_target_incline_parses_s2_bytes() {
        // S2: opcode 0x03, incline 0x0032 = 50.
        let cmd = parse_control_point(&[0x03, 0x32, 0x00]).unwrap();
        assert_eq!(cmd, ControlPointCommand::SetTargetIncline(50));
    }

    #[test]
    fn short_parameterized_write_is_invalid_parameter() {
        assert_eq!(
            parse_control_point(&[0x02, 0x01]),
            Err(ControlPointError::InvalidParameter)
        );
    }

    #[test]
    fn empty_write_is_invalid_parameter() {
        assert_eq!(parse_control_point(&[]), Err(ControlPointError::InvalidParameter));
    }

    #[test]
    fn control_response_has_the_80_prefix() {
        assert_eq!(encode_control_response(0x02, RESULT_SUCCESS), vec![0x80, 0x02, 0x01]);
    }

    #[test]
    fn status_helpers_match_opcode_table() {
        assert_eq!(status::target_speed_changed(300), vec![0x05, 0x2C, 0x01]);
        assert_eq!(status::target_incline_changed(50), vec![0x06, 0x32, 0x00]);
        assert_eq!(status::STOPPED_OR_PAUSED, [0x02, 0x01]);
        assert_eq!(status::STARTED_OR_RESUMED, [0x04]);
    }
}
