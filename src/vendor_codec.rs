//! Vendor (I_TL) application-layer message encoding/decoding.
//!
//! Unlike `ftms_protocol`, these payloads never cross a standard BLE
//! profile — they are whatever bytes the proprietary treadmill firmware
//! expects, reassembled from `framer::Reassembler` chunks on the way in
//! and fragmented by `framer::fragment` on the way out.

/// Speed/incline control kinds understood by `encode_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Speed,
    Incline,
}

impl ControlKind {
    fn byte(self) -> u8 {
        match self {
            ControlKind::Speed => 0x01,
            ControlKind::Incline => 0x02,
        }
    }
}

/// Build a speed/incline control payload.
///
/// Layout: `02 04 02 09 04 09 02 01 <kind> <v16 LE> 00 <checksum>`, where
/// checksum is the additive sum of everything from offset 4 onward, mod 256.
pub fn encode_control(kind: ControlKind, v16: u16) -> Vec<u8> {
    let mut buf = vec![0x02, 0x04, 0x02, 0x09, 0x04, 0x09, 0x02, 0x01, kind.byte()];
    buf.extend_from_slice(&v16.to_le_bytes());
    buf.push(0x00);
    let checksum = buf[4..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    buf.push(checksum);
    buf
}

/// A decoded telemetry record, still in vendor raw units (no SI conversion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySample {
    pub speed_raw: u16,
    pub incline_raw: u16,
    pub time_raw: u32,
    pub cal_raw: u32,
    pub dist_raw: u32,
}

/// Decode a reassembled telemetry payload. Returns `None` if the payload is
/// too short or lacks the `0x2F` discriminator at offset 3.
pub fn decode_telemetry(payload: &[u8]) -> Option<TelemetrySample> {
    if payload.len() < 30 || payload[3] != 0x2F {
        return None;
    }

    let speed_raw = u16::from_le_bytes([payload[8], payload[9]]);
    let incline_raw = u16::from_le_bytes([payload[10], payload[11]]);
    let time_raw = read_u32(payload, 27).unwrap_or(0);
    let cal_raw = read_u32(payload, 31).unwrap_or(0);
    let dist_raw = read_u32(payload, 42).unwrap_or(0);

    Some(TelemetrySample {
        speed_raw,
        incline_raw,
        time_raw,
        cal_raw,
        dist_raw,
    })
}

fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The nine fixed handshake payloads, sent in order at startup. The
/// vendor link is one-way here: responses are reassembled by the caller
/// but never parsed (spec Open Question (c)). Byte values are taken
/// directly from the original firmware monologue.
pub const HANDSHAKE_PAYLOADS: [&[u8]; 9] = [
    &[0x02, 0x04, 0x02, 0x04, 0x02, 0x04, 0x81, 0x87],
    &[0x02, 0x04, 0x02, 0x04, 0x04, 0x04, 0x80, 0x88],
    &[0x02, 0x04, 0x02, 0x04, 0x04, 0x04, 0x88, 0x90],
    &[0x02, 0x04, 0x02, 0x07, 0x02, 0x07, 0x82, 0x00, 0x00, 0x00, 0x8B],
    &[0x02, 0x04, 0x02, 0x06, 0x02, 0x06, 0x84, 0x00, 0x00, 0x8C],
    &[0x02, 0x04, 0x02, 0x04, 0x02, 0x04, 0x95, 0x9B],
    &[
        0x02, 0x04, 0x02, 0x28, 0x04, 0x28, 0x90, 0x07, 0x01, 0x8D, 0x68, 0x49, 0x28, 0x15, 0xF0,
        0xE9, 0xC0, 0xBD, 0xA8, 0x99, 0x88, 0x75, 0x60, 0x79, 0x70, 0x4D, 0x48, 0x49, 0x48, 0x75,
        0x70, 0x69, 0x60, 0x9D, 0x88, 0xB9, 0xA8, 0xD5, 0xC0, 0xA0, 0x02, 0x00, 0x00, 0xAD,
    ],
    &[
        0x02, 0x04, 0x02, 0x15, 0x04, 0x15, 0x02, 0x0E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x01, 0x00, 0x3A,
    ],
    &[
        0x02, 0x04, 0x02, 0x13, 0x04, 0x13, 0x02, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0xA5,
    ],
];

/// Fixed telemetry poll payload sent once per active-loop tick unless a
/// command was already sent.
pub const POLL_PAYLOAD: &[u8] = &[
    0x02, 0x04, 0x02, 0x10, 0x04, 0x10, 0x02, 0x00, 0x0A, 0x13, 0x94, 0x33, 0x00, 0x10, 0x40,
    0x10, 0x00, 0x80, 0x18, 0xF2,
];
