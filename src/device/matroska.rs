//! Streamed Matroska writer and reader for PCM captures
//!
//! Produces the same shape of container a browser media recorder emits:
//! an EBML header, a Segment of unknown size, an Info element without a
//! Duration, one audio track, then one Cluster per chunk. Duration is left
//! for the post-processor to repair once the real length is known.
//!
//! The track is raw `A_PCM/INT/LIT`, which WebM does not allow, so the
//! document is declared as plain Matroska.

use thiserror::Error;

use crate::ebml::{self, EbmlError, ElementHeader, UNKNOWN_SIZE};

pub const CAPTURE_MIME_TYPE: &str = "audio/x-matroska";
pub const CAPTURE_DOC_TYPE: &str = "matroska";

const PCM_CODEC_ID: &str = "A_PCM/INT/LIT";
const AUDIO_TRACK_TYPE: u64 = 2;
const BITS_PER_SAMPLE: u64 = 16;

#[derive(Debug, Clone)]
pub struct PcmClusterWriter {
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
    header_written: bool,
}

impl PcmClusterWriter {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frames_written: 0,
            header_written: false,
        }
    }

    /// Container preamble: EBML header, open Segment, Info and Tracks.
    pub fn header(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let mut head = Vec::new();
        ebml::write_uint(&mut head, ebml::EBML_VERSION, 1);
        ebml::write_uint(&mut head, ebml::EBML_READ_VERSION, 1);
        ebml::write_uint(&mut head, ebml::EBML_MAX_ID_LENGTH, 4);
        ebml::write_uint(&mut head, ebml::EBML_MAX_SIZE_LENGTH, 8);
        ebml::write_string(&mut head, ebml::DOC_TYPE, CAPTURE_DOC_TYPE);
        ebml::write_uint(&mut head, ebml::DOC_TYPE_VERSION, 4);
        ebml::write_uint(&mut head, ebml::DOC_TYPE_READ_VERSION, 2);
        ebml::write_element(&mut out, ebml::EBML_HEADER, &head);

        ebml::write_id(&mut out, ebml::SEGMENT);
        out.extend_from_slice(&UNKNOWN_SIZE);

        let mut info = Vec::new();
        ebml::write_uint(&mut info, ebml::TIMECODE_SCALE, ebml::DEFAULT_TIMECODE_SCALE);
        ebml::write_string(&mut info, ebml::MUXING_APP, env!("CARGO_PKG_NAME"));
        ebml::write_string(&mut info, ebml::WRITING_APP, env!("CARGO_PKG_NAME"));
        ebml::write_element(&mut out, ebml::INFO, &info);

        let mut audio = Vec::new();
        ebml::write_float(&mut audio, ebml::SAMPLING_FREQUENCY, self.sample_rate as f64);
        ebml::write_uint(&mut audio, ebml::CHANNELS, self.channels as u64);
        ebml::write_uint(&mut audio, ebml::BIT_DEPTH, BITS_PER_SAMPLE);

        let mut entry = Vec::new();
        ebml::write_uint(&mut entry, ebml::TRACK_NUMBER, 1);
        ebml::write_uint(&mut entry, ebml::TRACK_UID, 1);
        ebml::write_uint(&mut entry, ebml::TRACK_TYPE, AUDIO_TRACK_TYPE);
        ebml::write_string(&mut entry, ebml::CODEC_ID, PCM_CODEC_ID);
        ebml::write_element(&mut entry, ebml::AUDIO, &audio);

        let mut tracks = Vec::new();
        ebml::write_element(&mut tracks, ebml::TRACK_ENTRY, &entry);
        ebml::write_element(&mut out, ebml::TRACKS, &tracks);

        out
    }

    /// Wrap interleaved samples into one Cluster holding one SimpleBlock.
    /// The cluster timecode is the running sample position in milliseconds.
    pub fn cluster(&mut self, samples: &[i16]) -> Vec<u8> {
        let timecode_ms = self.frames_written * 1000 / self.sample_rate.max(1) as u64;
        self.frames_written += (samples.len() / self.channels as usize) as u64;

        let mut block = Vec::with_capacity(4 + samples.len() * 2);
        block.push(0x81); // track number 1 as a vint
        block.extend_from_slice(&0i16.to_be_bytes());
        block.push(0x80); // keyframe
        for sample in samples {
            block.extend_from_slice(&sample.to_le_bytes());
        }

        let mut body = Vec::new();
        ebml::write_uint(&mut body, ebml::TIMECODE, timecode_ms);
        ebml::write_element(&mut body, ebml::SIMPLE_BLOCK, &block);

        let mut out = Vec::new();
        ebml::write_element(&mut out, ebml::CLUSTER, &body);
        out
    }

    /// Next chunk for the capture stream: the preamble is prepended to the
    /// first one. Empty input after the preamble yields an empty chunk.
    pub fn next_chunk(&mut self, samples: &[i16]) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.header_written {
            out.extend(self.header());
            self.header_written = true;
        }
        if !samples.is_empty() {
            out.extend(self.cluster(samples));
        }
        out
    }
}

/// Interleaved 16-bit samples pulled back out of a PCM capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmTrack {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmReadError {
    #[error("not a Matroska document")]
    NotMatroska,
    #[error("laced blocks are not supported")]
    Laced,
    #[error(transparent)]
    Ebml(#[from] EbmlError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TrackInfo {
    number: u64,
    sample_rate: f64,
    channels: u64,
    bit_depth: u64,
}

/// Sibling elements in `start..end`, stopping at the first one that cannot be read.
fn children(bytes: &[u8], start: usize, end: usize) -> Vec<ElementHeader> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < end {
        let Ok(header) = ebml::read_header(bytes, pos) else {
            break;
        };
        let next = header.data_end(end);
        out.push(header);
        if header.size.is_none() || next <= pos {
            break;
        }
        pos = next;
    }
    out
}

fn payload<'a>(bytes: &'a [u8], header: &ElementHeader, end: usize) -> &'a [u8] {
    bytes
        .get(header.data_start()..header.data_end(end))
        .unwrap_or_default()
}

fn pcm_track(bytes: &[u8], tracks: &ElementHeader, end: usize) -> Option<TrackInfo> {
    let tracks_end = tracks.data_end(end);
    for entry in children(bytes, tracks.data_start(), tracks_end) {
        if entry.id != ebml::TRACK_ENTRY {
            continue;
        }
        let entry_end = entry.data_end(tracks_end);
        let mut info = TrackInfo {
            number: 0,
            sample_rate: 8_000.0,
            channels: 1,
            bit_depth: 0,
        };
        let mut is_pcm = false;
        for field in children(bytes, entry.data_start(), entry_end) {
            let data = payload(bytes, &field, entry_end);
            match field.id {
                ebml::TRACK_NUMBER => info.number = ebml::read_uint(data),
                ebml::CODEC_ID => is_pcm = data == PCM_CODEC_ID.as_bytes(),
                ebml::AUDIO => {
                    let audio_end = field.data_end(entry_end);
                    for setting in children(bytes, field.data_start(), audio_end) {
                        let data = payload(bytes, &setting, audio_end);
                        match setting.id {
                            ebml::SAMPLING_FREQUENCY => {
                                if let Some(rate) = ebml::read_float(data) {
                                    info.sample_rate = rate;
                                }
                            }
                            ebml::CHANNELS => info.channels = ebml::read_uint(data),
                            ebml::BIT_DEPTH => info.bit_depth = ebml::read_uint(data),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        if is_pcm {
            return Some(info);
        }
    }
    None
}

/// Append the samples of one SimpleBlock if it belongs to `track`.
fn read_block(block: &[u8], track: u64, samples: &mut Vec<i16>) -> Result<(), PcmReadError> {
    let (number, len) = ebml::read_size(block, 0)?;
    if number != Some(track) {
        return Ok(());
    }
    // Timecode (2 bytes) and flags (1 byte) follow the track number
    let flags = *block.get(len + 2).ok_or(EbmlError::Truncated(len + 2))?;
    if flags & 0x06 != 0 {
        return Err(PcmReadError::Laced);
    }
    let data = &block[len + 3..];
    samples.extend(
        data.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
    Ok(())
}

/// Read back a 16-bit `A_PCM/INT/LIT` track.
///
/// `Ok(None)` means the bytes are Matroska but carry some other codec.
/// A trailing partial element is ignored, as a cut-off stream would have one.
pub fn read_pcm_track(bytes: &[u8]) -> Result<Option<PcmTrack>, PcmReadError> {
    let head = ebml::read_header(bytes, 0)?;
    if head.id != ebml::EBML_HEADER {
        return Err(PcmReadError::NotMatroska);
    }
    let segment = ebml::read_header(bytes, head.data_end(bytes.len()))?;
    if segment.id != ebml::SEGMENT {
        return Err(PcmReadError::NotMatroska);
    }
    let end = segment.data_end(bytes.len());

    let mut track: Option<TrackInfo> = None;
    let mut samples = Vec::new();
    let mut pos = segment.data_start();

    while pos < end {
        let Ok(element) = ebml::read_header(bytes, pos) else {
            break;
        };
        match element.id {
            ebml::TRACKS => match pcm_track(bytes, &element, end) {
                Some(info) if info.bit_depth == BITS_PER_SAMPLE => track = Some(info),
                _ => return Ok(None),
            },
            ebml::CLUSTER => {
                let Some(info) = track else {
                    return Ok(None);
                };
                let cluster_end = element.data_end(end);
                for child in children(bytes, element.data_start(), cluster_end) {
                    if child.id == ebml::SIMPLE_BLOCK {
                        read_block(payload(bytes, &child, cluster_end), info.number, &mut samples)?;
                    }
                }
            }
            _ => {}
        }
        if element.size.is_none() {
            break;
        }
        let next = element.data_end(end);
        if next <= pos {
            break;
        }
        pos = next;
    }

    let Some(info) = track else {
        return Ok(None);
    };
    let channels = info.channels.clamp(1, u16::MAX as u64) as u16;
    samples.truncate(samples.len() - samples.len() % channels as usize);
    Ok(Some(PcmTrack {
        samples,
        sample_rate: info.sample_rate.round().max(1.0) as u32,
        channels,
    }))
}
