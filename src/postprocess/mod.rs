//! Post-processing of a finished capture
//!
//! Two best-effort steps in fixed order: duration repair, then an optional
//! WAV transcode. Neither can fail the session; each falls back to the
//! bytes it was given and says so in the log.

pub mod duration;
pub mod transcode;

use std::sync::Arc;

pub use duration::{read_duration, repair_duration, MetadataRepairError};
pub use transcode::{encode_wav, AudioDecoder, PcmAudio, SymphoniaDecoder, TranscodeError};

use crate::device::CapturedAudio;
use crate::settings::OutputFormat;

/// Final payload handed to the encoder.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_repaired: bool,
    pub transcoded: bool,
}

impl std::fmt::Debug for ProcessedAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedAudio")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("duration_repaired", &self.duration_repaired)
            .field("transcoded", &self.transcoded)
            .finish()
    }
}

fn is_matroska(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    matches!(
        essence,
        "audio/webm" | "video/webm" | "audio/x-matroska" | "video/x-matroska"
    )
}

/// Decode and re-encode as WAV on a blocking thread.
pub async fn transcode_to_wav(
    bytes: Vec<u8>,
    mime_type: String,
    decoder: Arc<dyn AudioDecoder>,
) -> Result<Vec<u8>, TranscodeError> {
    tokio::task::spawn_blocking(move || {
        let pcm = decoder.decode(&bytes, &mime_type)?;
        encode_wav(&pcm)
    })
    .await
    .map_err(|e| TranscodeError::Task(e.to_string()))?
}

/// Repair duration metadata, then transcode when WAV output is requested.
pub async fn process(
    audio: &CapturedAudio,
    output_format: OutputFormat,
    decoder: Arc<dyn AudioDecoder>,
) -> ProcessedAudio {
    let original = audio.concat();
    let mut result = ProcessedAudio {
        bytes: original,
        mime_type: audio.mime_type.clone(),
        duration_repaired: false,
        transcoded: false,
    };

    if is_matroska(&audio.mime_type) {
        match repair_duration(&result.bytes, audio.captured) {
            Ok(repaired) => {
                log::info!(
                    "Duration repaired: {:.1}s written into {} byte container",
                    audio.captured.as_secs_f64(),
                    repaired.len()
                );
                result.bytes = repaired;
                result.duration_repaired = true;
            }
            Err(e) => log::warn!("Duration repair failed, using original container: {}", e),
        }
    } else {
        log::debug!("No duration repair for {}", audio.mime_type);
    }

    if output_format != OutputFormat::Wav {
        return result;
    }
    if transcode::is_wav(&result.mime_type) {
        log::debug!("Capture is already WAV, skipping transcode");
        return result;
    }

    match transcode_to_wav(result.bytes.clone(), result.mime_type.clone(), decoder).await {
        Ok(wav) => {
            log::info!(
                "Transcoded {} bytes of {} to {} bytes of WAV",
                result.bytes.len(),
                result.mime_type,
                wav.len()
            );
            result.bytes = wav;
            result.mime_type = OutputFormat::Wav.mime_type().to_string();
            result.transcoded = true;
        }
        Err(e) => log::warn!(
            "WAV transcode failed, delivering {} instead: {}",
            result.mime_type,
            e
        ),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::matroska::{PcmClusterWriter, CAPTURE_MIME_TYPE};
    use std::time::Duration;

    struct FixedDecoder(Result<PcmAudio, TranscodeError>);

    impl AudioDecoder for FixedDecoder {
        fn decode(&self, _bytes: &[u8], _mime_type: &str) -> Result<PcmAudio, TranscodeError> {
            self.0.clone()
        }
    }

    fn capture() -> CapturedAudio {
        let mut writer = PcmClusterWriter::new(8_000, 1);
        CapturedAudio {
            chunks: vec![writer.next_chunk(&[0; 400]), writer.next_chunk(&[0; 400])],
            captured: Duration::from_secs(10),
            mime_type: CAPTURE_MIME_TYPE.to_string(),
        }
    }

    fn tone() -> PcmAudio {
        PcmAudio {
            samples: vec![0.25; 160],
            sample_rate: 8_000,
            channels: 1,
        }
    }

    #[tokio::test]
    async fn webm_output_is_repaired_only() {
        let audio = capture();
        let decoder = Arc::new(FixedDecoder(Ok(tone())));
        let processed = process(&audio, OutputFormat::Webm, decoder).await;

        assert!(processed.duration_repaired);
        assert!(!processed.transcoded);
        assert_eq!(processed.mime_type, CAPTURE_MIME_TYPE);
        assert!((read_duration(&processed.bytes).unwrap() - 10_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn wav_output_is_transcoded() {
        let audio = capture();
        let decoder = Arc::new(FixedDecoder(Ok(tone())));
        let processed = process(&audio, OutputFormat::Wav, decoder).await;

        assert!(processed.duration_repaired);
        assert!(processed.transcoded);
        assert_eq!(processed.mime_type, "audio/wav");
        assert_eq!(&processed.bytes[0..4], b"RIFF");
    }

    #[tokio::test]
    async fn device_capture_becomes_wav_with_the_real_decoder() {
        let mut writer = PcmClusterWriter::new(8_000, 2);
        let audio = CapturedAudio {
            chunks: vec![
                writer.next_chunk(&[1_000; 800]),
                writer.next_chunk(&[-1_000; 800]),
            ],
            captured: Duration::from_millis(100),
            mime_type: CAPTURE_MIME_TYPE.to_string(),
        };
        let processed = process(&audio, OutputFormat::Wav, Arc::new(SymphoniaDecoder)).await;

        assert!(processed.duration_repaired);
        assert!(processed.transcoded);
        assert_eq!(processed.mime_type, "audio/wav");

        let reader = hound::WavReader::new(std::io::Cursor::new(processed.bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 1_600);
    }

    #[tokio::test]
    async fn failed_transcode_falls_back_to_repaired_container() {
        let audio = capture();
        let decoder = Arc::new(FixedDecoder(Err(TranscodeError::Decode(
            "unsupported codec".to_string(),
        ))));
        let processed = process(&audio, OutputFormat::Wav, decoder).await;

        let repaired = repair_duration(&audio.concat(), audio.captured).unwrap();
        assert!(!processed.transcoded);
        assert_eq!(processed.mime_type, CAPTURE_MIME_TYPE);
        assert_eq!(processed.bytes, repaired);
    }

    #[tokio::test]
    async fn unrepairable_container_passes_through() {
        let audio = CapturedAudio {
            chunks: vec![vec![0x42; 64]],
            captured: Duration::from_secs(1),
            mime_type: "audio/webm".to_string(),
        };
        let decoder = Arc::new(FixedDecoder(Ok(tone())));
        let processed = process(&audio, OutputFormat::Webm, decoder).await;

        assert!(!processed.duration_repaired);
        assert_eq!(processed.bytes, audio.concat());
    }

    #[tokio::test]
    async fn wav_capture_is_not_transcoded_again() {
        let audio = CapturedAudio {
            chunks: vec![b"RIFF....WAVE".to_vec()],
            captured: Duration::from_secs(1),
            mime_type: "audio/wav".to_string(),
        };
        let decoder = Arc::new(FixedDecoder(Err(TranscodeError::NoSamples)));
        let processed = process(&audio, OutputFormat::Wav, decoder).await;

        assert!(!processed.transcoded);
        assert!(!processed.duration_repaired);
        assert_eq!(processed.bytes, audio.concat());
    }
}
