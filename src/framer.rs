//! Vendor link transport framing: splits an outbound payload into an
//! `FE`-header + numbered data chunks + `FF`-terminator, and reassembles
//! the same shape on ingress.
//!
//! Each GATT write/notification on the vendor link carries one chunk. A
//! chunk is at most 20 bytes: either the fixed 20-byte header, or
//! `[seq, len, bytes...]` with up to 18 payload bytes.

const CHUNK_PAYLOAD_LEN: usize = 18;
const TAIL_SEQ: u8 = 0xFF;
const HEADER_MARKER: u8 = 0xFE;

/// Assembly is capped at this many payload bytes; anything larger is
/// dropped rather than grown without bound (see spec's over-length
/// assembly cap).
const MAX_ASSEMBLY_LEN: usize = 4096;

/// One wire chunk, already framed and ready to write to the vendor
/// characteristic.
pub type Frame = Vec<u8>;

/// Split `payload` into frames: one header followed by numbered data
/// chunks, the last chunk carrying sequence byte `0xFF`.
pub fn fragment(payload: &[u8]) -> Vec<Frame> {
    let total_len = payload.len();
    let data_slices: Vec<&[u8]> = payload.chunks(CHUNK_PAYLOAD_LEN).collect();
    // A zero-length payload still gets one (empty) data chunk, matching
    // `ceil(0/18) == 0` -> but the original always emits at least one data
    // chunk for the tail marker.
    let data_slices: Vec<&[u8]> = if data_slices.is_empty() {
        vec![&[]]
    } else {
        data_slices
    };
    let total_chunks = 1 + data_slices.len();

    let mut frames = Vec::with_capacity(total_chunks);

    let mut header = Vec::with_capacity(20);
    header.push(HEADER_MARKER);
    header.push(0x02);
    header.push(total_len as u8);
    header.push(total_chunks as u8);
    header.extend(std::iter::repeat(0u8).take(16));
    frames.push(header);

    let last_index = data_slices.len() - 1;
    for (i, chunk) in data_slices.iter().enumerate() {
        let seq = if i == last_index { TAIL_SEQ } else { i as u8 };
        let mut frame = Vec::with_capacity(2 + chunk.len());
        frame.push(seq);
        frame.push(chunk.len() as u8);
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }

    frames
}

/// Incremental reassembler fed one frame at a time as they arrive on the
/// notify characteristic.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    in_progress: bool,
    declared_len: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns the reassembled payload once a tail chunk
    /// completes an in-progress assembly.
    pub fn feed(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.is_empty() {
            return None;
        }

        let seq = frame[0];

        if seq == HEADER_MARKER {
            if frame.len() >= 4 {
                self.declared_len = frame[2] as usize;
            }
            self.buffer.clear();
            self.in_progress = true;
            return None;
        }

        if !self.in_progress {
            return None;
        }

        if frame.len() < 2 {
            return None;
        }
        let len = frame[1] as usize;
        let data = frame.get(2..2 + len).unwrap_or(&frame[2.min(frame.len())..]);

        if self.buffer.len() + data.len() > MAX_ASSEMBLY_LEN {
            self.buffer.clear();
            self.in_progress = false;
            return None;
        }
        self.buffer.extend_from_slice(data);

        if seq == TAIL_SEQ {
            self.in_progress = false;
            if self.buffer.len() != self.declared_len {
                log::debug!(
                    "reassembled payload length {} does not match declared total_len {}",
                    self.buffer.len(),
                    self.declared_len
                );
            }
            let payload = std::mem::take(&mut self.buffer);
            return Some(payload);
        }

        None
    }
}
