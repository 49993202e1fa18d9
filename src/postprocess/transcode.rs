//! Decode the captured container and re-encode it as 16-bit PCM WAV.

use std::io::Cursor;

use hound::{WavSpec, WavWriter};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use thiserror::Error;

use crate::device::matroska::{self, PcmTrack};

/// Decoded audio as interleaved `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscodeError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("decoded 0 samples")]
    NoSamples,
    #[error("WAV encode failed: {0}")]
    Encode(String),
    #[error("transcode task failed: {0}")]
    Task(String),
}

/// Turns container bytes into raw samples. Runs on a blocking thread.
pub trait AudioDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<PcmAudio, TranscodeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

fn hint_for(mime_type: &str) -> Hint {
    let mut hint = Hint::new();
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    hint.mime_type(essence);
    match essence {
        "audio/webm" | "video/webm" => {
            hint.with_extension("webm");
        }
        "audio/x-matroska" | "video/x-matroska" => {
            hint.with_extension("mkv");
        }
        "audio/wav" | "audio/x-wav" | "audio/wave" => {
            hint.with_extension("wav");
        }
        "audio/ogg" => {
            hint.with_extension("ogg");
        }
        _ => {}
    }
    hint
}

impl From<PcmTrack> for PcmAudio {
    fn from(track: PcmTrack) -> Self {
        Self {
            samples: track
                .samples
                .iter()
                .map(|&s| s as f32 / i16::MAX as f32)
                .collect(),
            sample_rate: track.sample_rate,
            channels: track.channels,
        }
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<PcmAudio, TranscodeError> {
        // Raw PCM tracks are read directly; symphonia's PCM decoder needs a
        // frames-per-packet bound that streamed captures never declare.
        match matroska::read_pcm_track(bytes) {
            Ok(Some(track)) if !track.samples.is_empty() => return Ok(track.into()),
            Ok(Some(_)) => return Err(TranscodeError::NoSamples),
            Ok(None) => log::debug!("Matroska track is not raw PCM, decoding with symphonia"),
            Err(e) => log::debug!("Not a PCM capture ({}), decoding with symphonia", e),
        }

        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint_for(mime_type),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|err| TranscodeError::Decode(format!("probe: {err}")))?;
        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| TranscodeError::Decode("no default track".to_string()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| TranscodeError::Decode("missing sample rate".to_string()))?;
        let mut channels = codec_params.channels.map(|c| c.count() as u16);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|err| TranscodeError::Decode(format!("codec: {err}")))?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(_)) => break,
                Err(err) => return Err(TranscodeError::Decode(format!("packet: {err}"))),
            };
            if packet.track_id() != track_id {
                continue;
            }
            let audio_buf = match decoder.decode(&packet) {
                Ok(audio_buf) => audio_buf,
                Err(SymphoniaError::DecodeError(err)) => {
                    log::debug!("Skipping undecodable packet: {}", err);
                    continue;
                }
                Err(err) => return Err(TranscodeError::Decode(err.to_string())),
            };
            let spec = *audio_buf.spec();
            channels.get_or_insert(spec.channels.count() as u16);
            let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(audio_buf);
            samples.extend_from_slice(sample_buf.samples());
        }

        if samples.is_empty() {
            return Err(TranscodeError::NoSamples);
        }

        Ok(PcmAudio {
            samples,
            sample_rate: sample_rate.max(1),
            channels: channels.unwrap_or(1).max(1),
        })
    }
}

fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Encode samples as a 16-bit PCM WAV file at the source rate and channel count.
pub fn encode_wav(audio: &PcmAudio) -> Result<Vec<u8>, TranscodeError> {
    if audio.samples.is_empty() {
        return Err(TranscodeError::NoSamples);
    }

    let spec = WavSpec {
        channels: audio.channels.max(1),
        sample_rate: audio.sample_rate.max(1),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        for &sample in &audio.samples {
            writer
                .write_sample(sample_to_i16(sample))
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| TranscodeError::Encode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Whether `mime_type` already names a WAV container.
pub fn is_wav(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    matches!(essence, "audio/wav" | "audio/x-wav" | "audio/wave")
}
