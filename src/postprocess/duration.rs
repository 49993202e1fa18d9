//! Matroska/WebM duration repair
//!
//! Streaming recorders leave the Segment size unknown and never write a
//! Duration, so players show no length and cannot seek. Once the capture
//! is complete the real duration is known and can be written into `Info`.

use std::time::Duration;

use thiserror::Error;

use crate::ebml::{self, EbmlError, ElementHeader};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataRepairError {
    #[error("not an EBML document")]
    NotEbml,
    #[error("no Segment element")]
    MissingSegment,
    #[error("no Info element in segment")]
    MissingInfo,
    #[error("Info element has unknown size")]
    UnknownInfoSize,
    #[error("existing Duration has unsupported width {0}")]
    UnsupportedDurationWidth(u64),
    #[error("{0} element is truncated")]
    Truncated(&'static str),
    #[error("{0} size field too narrow for repaired size")]
    SizeOverflow(&'static str),
    #[error("SeekHead or Cues present, inserting would invalidate offsets")]
    IndexedSegment,
    #[error(transparent)]
    Ebml(#[from] EbmlError),
}

struct InfoLayout {
    segment: ElementHeader,
    info: ElementHeader,
    timecode_scale: u64,
    duration: Option<ElementHeader>,
    indexed: bool,
}

fn payload<'a>(buf: &'a [u8], header: &ElementHeader, limit: usize) -> &'a [u8] {
    let end = header.data_end(limit);
    let start = header.data_start().min(end);
    &buf[start..end]
}

fn locate_info(buf: &[u8]) -> Result<InfoLayout, MetadataRepairError> {
    let head = ebml::read_header(buf, 0).map_err(|_| MetadataRepairError::NotEbml)?;
    if head.id != ebml::EBML_HEADER || head.size.is_none() {
        return Err(MetadataRepairError::NotEbml);
    }

    let segment_pos = head.data_end(buf.len());
    let segment =
        ebml::read_header(buf, segment_pos).map_err(|_| MetadataRepairError::MissingSegment)?;
    if segment.id != ebml::SEGMENT {
        return Err(MetadataRepairError::MissingSegment);
    }

    let segment_end = segment.data_end(buf.len());
    let mut info = None;
    let mut indexed = false;
    let mut pos = segment.data_start();
    while pos < segment_end {
        // A stream cut mid-header just ends the scan.
        let Ok(child) = ebml::read_header(buf, pos) else {
            break;
        };
        match child.id {
            ebml::INFO if info.is_none() => info = Some(child),
            ebml::SEEK_HEAD | ebml::CUES => indexed = true,
            _ => {}
        }
        if child.size.is_none() {
            // Unknown-size child (streamed cluster): nothing after it is addressable.
            break;
        }
        pos = child.data_end(segment_end);
    }
    let info = info.ok_or(MetadataRepairError::MissingInfo)?;

    let info_end = info.data_end(segment_end);
    let mut timecode_scale = ebml::DEFAULT_TIMECODE_SCALE;
    let mut duration = None;
    let mut pos = info.data_start();
    while pos < info_end {
        let child = ebml::read_header(buf, pos)?;
        match child.id {
            ebml::TIMECODE_SCALE => {
                let scale = ebml::read_uint(payload(buf, &child, info_end));
                if scale > 0 {
                    timecode_scale = scale;
                }
            }
            ebml::DURATION => duration = Some(child),
            _ => {}
        }
        if child.size.is_none() {
            break;
        }
        pos = child.data_end(info_end);
    }

    Ok(InfoLayout {
        segment,
        info,
        timecode_scale,
        duration,
        indexed,
    })
}

fn overwrite_size(
    out: &mut [u8],
    header: &ElementHeader,
    size: u64,
    name: &'static str,
) -> Result<(), MetadataRepairError> {
    let encoded = ebml::encode_size_with_width(size, header.size_len)
        .ok_or(MetadataRepairError::SizeOverflow(name))?;
    out[header.size_offset..header.data_start()].copy_from_slice(&encoded);
    Ok(())
}

/// Give an unknown-size Segment its real length when the size field is
/// wide enough; otherwise leave it streaming.
fn finalize_segment_size(out: &mut [u8], segment: &ElementHeader) {
    if segment.size.is_some() {
        return;
    }
    let real = (out.len() - segment.data_start()) as u64;
    match overwrite_size(out, segment, real, "Segment") {
        Ok(()) => log::debug!("Segment size finalized to {} bytes", real),
        Err(_) => log::debug!("Segment size field too narrow, left unknown"),
    }
}

/// Write `duration` into the container's Info element.
///
/// An existing Duration is overwritten in place. A missing one is inserted
/// at the end of Info, which grows Info and a known-size Segment by the
/// element's length.
pub fn repair_duration(webm: &[u8], duration: Duration) -> Result<Vec<u8>, MetadataRepairError> {
    let layout = locate_info(webm)?;
    let ticks = duration.as_secs_f64() * 1e9 / layout.timecode_scale as f64;

    if let Some(existing) = layout.duration {
        let start = existing.data_start();
        let width = existing.size.unwrap_or(0);
        if existing.data_end(webm.len()) - start.min(webm.len()) != width as usize {
            return Err(MetadataRepairError::Truncated("Duration"));
        }

        let mut out = webm.to_vec();
        match width {
            4 => out[start..start + 4].copy_from_slice(&(ticks as f32).to_be_bytes()),
            8 => out[start..start + 8].copy_from_slice(&ticks.to_be_bytes()),
            other => return Err(MetadataRepairError::UnsupportedDurationWidth(other)),
        }
        finalize_segment_size(&mut out, &layout.segment);
        return Ok(out);
    }

    if layout.indexed {
        return Err(MetadataRepairError::IndexedSegment);
    }

    let info_size = layout.info.size.ok_or(MetadataRepairError::UnknownInfoSize)?;
    let insert_at = layout.info.data_end(webm.len());
    if layout.info.data_start() as u64 + info_size != insert_at as u64 {
        return Err(MetadataRepairError::Truncated("Info"));
    }

    let mut element = Vec::with_capacity(11);
    ebml::write_float(&mut element, ebml::DURATION, ticks);
    let grown = element.len() as u64;

    let mut out = Vec::with_capacity(webm.len() + element.len());
    out.extend_from_slice(&webm[..insert_at]);
    out.extend_from_slice(&element);
    out.extend_from_slice(&webm[insert_at..]);

    overwrite_size(&mut out, &layout.info, info_size + grown, "Info")?;
    match layout.segment.size {
        Some(size) => overwrite_size(&mut out, &layout.segment, size + grown, "Segment")?,
        None => finalize_segment_size(&mut out, &layout.segment),
    }

    Ok(out)
}

/// Duration stored in the container, in milliseconds.
pub fn read_duration(webm: &[u8]) -> Option<f64> {
    let layout = locate_info(webm).ok()?;
    let header = layout.duration?;
    let ticks = ebml::read_float(payload(webm, &header, webm.len()))?;
    Some(ticks * layout.timecode_scale as f64 / 1e6)
}
