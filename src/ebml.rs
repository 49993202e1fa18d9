//! Minimal EBML (Matroska/WebM) primitives
//!
//! Just enough of the format to stream a PCM capture container and to patch
//! header metadata afterwards: variable-length integers, element ids,
//! element header parsing, and element writing.

use thiserror::Error;

pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const EBML_VERSION: u32 = 0x4286;
pub const EBML_READ_VERSION: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const DOC_TYPE: u32 = 0x4282;
pub const DOC_TYPE_VERSION: u32 = 0x4287;
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

pub const SEGMENT: u32 = 0x1853_8067;
pub const SEEK_HEAD: u32 = 0x114D_9B74;
pub const INFO: u32 = 0x1549_A966;
pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
pub const DURATION: u32 = 0x4489;
pub const MUXING_APP: u32 = 0x4D80;
pub const WRITING_APP: u32 = 0x5741;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
pub const TRACK_TYPE: u32 = 0x83;
pub const CODEC_ID: u32 = 0x86;
pub const AUDIO: u32 = 0xE1;
pub const SAMPLING_FREQUENCY: u32 = 0xB5;
pub const CHANNELS: u32 = 0x9F;
pub const BIT_DEPTH: u32 = 0x6264;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const TIMECODE: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;
pub const CUES: u32 = 0x1C53_BB6B;
pub const VOID: u32 = 0xEC;

/// Default TimecodeScale: one tick per millisecond.
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Size field meaning "unknown / streaming", 8-byte form.
pub const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EbmlError {
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("invalid variable-length integer at offset {0}")]
    InvalidVint(usize),
}

/// Parsed element header. Offsets are absolute positions in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    pub offset: usize,
    pub size_offset: usize,
    pub size_len: usize,
    /// `None` when the size field is the reserved "unknown" value.
    pub size: Option<u64>,
}

impl ElementHeader {
    pub fn data_start(&self) -> usize {
        self.size_offset + self.size_len
    }

    /// End of the element's data, bounded by `limit` for unknown or
    /// overlong sizes.
    pub fn data_end(&self, limit: usize) -> usize {
        match self.size {
            Some(size) => {
                let end = self.data_start() as u64 + size;
                usize::try_from(end).map_or(limit, |end| end.min(limit))
            }
            None => limit,
        }
    }
}

fn vint_len(first: u8, offset: usize) -> Result<usize, EbmlError> {
    if first == 0 {
        return Err(EbmlError::InvalidVint(offset));
    }
    Ok(first.leading_zeros() as usize + 1)
}

/// Read an element id (marker bits kept, as ids are conventionally written).
pub fn read_id(buf: &[u8], pos: usize) -> Result<(u32, usize), EbmlError> {
    let first = *buf.get(pos).ok_or(EbmlError::Truncated(pos))?;
    let len = vint_len(first, pos)?;
    if len > 4 {
        return Err(EbmlError::InvalidVint(pos));
    }
    let bytes = buf
        .get(pos..pos + len)
        .ok_or(EbmlError::Truncated(pos))?;
    let id = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok((id, len))
}

/// Read a size vint. Returns `None` for the all-ones "unknown" marker.
pub fn read_size(buf: &[u8], pos: usize) -> Result<(Option<u64>, usize), EbmlError> {
    let first = *buf.get(pos).ok_or(EbmlError::Truncated(pos))?;
    let len = vint_len(first, pos)?;
    let bytes = buf
        .get(pos..pos + len)
        .ok_or(EbmlError::Truncated(pos))?;

    let mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    let mut value = (first & mask) as u64;
    for &b in &bytes[1..] {
        value = (value << 8) | b as u64;
    }

    let all_ones = (1u64 << (7 * len)) - 1;
    if value == all_ones {
        Ok((None, len))
    } else {
        Ok((Some(value), len))
    }
}

pub fn read_header(buf: &[u8], pos: usize) -> Result<ElementHeader, EbmlError> {
    let (id, id_len) = read_id(buf, pos)?;
    let size_offset = pos + id_len;
    let (size, size_len) = read_size(buf, size_offset)?;
    Ok(ElementHeader {
        id,
        offset: pos,
        size_offset,
        size_len,
        size,
    })
}

/// Big-endian unsigned integer payload (0..=8 bytes).
pub fn read_uint(data: &[u8]) -> u64 {
    data.iter().take(8).fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Float payload; EBML floats are 4 or 8 bytes, empty means 0.
pub fn read_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        0 => Some(0.0),
        4 => Some(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(data);
            Some(f64::from_be_bytes(raw))
        }
        _ => None,
    }
}

/// Encode `size` as a vint of exactly `width` bytes, if it fits.
pub fn encode_size_with_width(size: u64, width: usize) -> Option<Vec<u8>> {
    if !(1..=8).contains(&width) {
        return None;
    }
    // All-ones is reserved for "unknown".
    let max = (1u64 << (7 * width)) - 2;
    if size > max {
        return None;
    }
    let marked = size | (1u64 << (7 * width));
    Some(marked.to_be_bytes()[8 - width..].to_vec())
}

pub fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn write_size(out: &mut Vec<u8>, size: u64) {
    let width = (1..=8)
        .find(|&w| size < (1u64 << (7 * w)) - 1)
        .unwrap_or(8);
    if let Some(encoded) = encode_size_with_width(size, width) {
        out.extend_from_slice(&encoded);
    }
}

pub fn write_element(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    write_id(out, id);
    write_size(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

pub fn write_uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    write_element(out, id, &bytes[skip..]);
}

pub fn write_float(out: &mut Vec<u8>, id: u32, value: f64) {
    write_element(out, id, &value.to_be_bytes());
}

pub fn write_string(out: &mut Vec<u8>, id: u32, value: &str) {
    write_element(out, id, value.as_bytes());
}

/// Void element occupying exactly `total_len` bytes (minimum 9).
pub fn write_void(out: &mut Vec<u8>, total_len: usize) {
    if total_len < 9 {
        return;
    }
    let payload = total_len - 9;
    out.push(VOID as u8);
    if let Some(size) = encode_size_with_width(payload as u64, 8) {
        out.extend_from_slice(&size);
    }
    out.resize(out.len() + payload, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_vint_roundtrips_common_widths() {
        let mut out = Vec::new();
        write_size(&mut out, 5);
        assert_eq!(out, vec![0x85]);
        assert_eq!(read_size(&out, 0).unwrap(), (Some(5), 1));

        let mut out = Vec::new();
        write_size(&mut out, 127);
        // 127 is all-ones in 1 byte, so it must widen
        assert_eq!(out.len(), 2);
        assert_eq!(read_size(&out, 0).unwrap(), (Some(127), 2));
    }

    #[test]
    fn unknown_size_is_recognised() {
        assert_eq!(read_size(&UNKNOWN_SIZE, 0).unwrap(), (None, 8));
        assert_eq!(read_size(&[0xFF], 0).unwrap(), (None, 1));
    }

    #[test]
    fn ids_keep_marker_bits() {
        let mut out = Vec::new();
        write_id(&mut out, SEGMENT);
        assert_eq!(out, vec![0x18, 0x53, 0x80, 0x67]);
        assert_eq!(read_id(&out, 0).unwrap(), (SEGMENT, 4));

        let mut out = Vec::new();
        write_id(&mut out, TIMECODE);
        assert_eq!(out, vec![0xE7]);
    }

    #[test]
    fn zero_byte_is_not_a_vint() {
        assert_eq!(read_size(&[0x00], 0), Err(EbmlError::InvalidVint(0)));
        assert_eq!(read_id(&[], 0), Err(EbmlError::Truncated(0)));
    }

    #[test]
    fn fixed_width_encoding_rejects_overflow() {
        assert_eq!(encode_size_with_width(10, 2), Some(vec![0x40, 0x0A]));
        assert_eq!(encode_size_with_width(200, 1), None);
    }

    #[test]
    fn header_reports_data_bounds() {
        let mut out = Vec::new();
        write_uint(&mut out, TIMECODE_SCALE, DEFAULT_TIMECODE_SCALE);
        let header = read_header(&out, 0).unwrap();
        assert_eq!(header.id, TIMECODE_SCALE);
        assert_eq!(header.data_start(), 4);
        assert_eq!(header.data_end(out.len()), out.len());
        assert_eq!(
            read_uint(&out[header.data_start()..]),
            DEFAULT_TIMECODE_SCALE
        );
    }

    #[test]
    fn void_fills_requested_length() {
        let mut out = Vec::new();
        write_void(&mut out, 40);
        assert_eq!(out.len(), 40);
        let header = read_header(&out, 0).unwrap();
        assert_eq!(header.id, VOID);
        assert_eq!(header.data_end(out.len()), 40);
    }
}
