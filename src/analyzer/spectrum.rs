//! Byte frequency data from raw samples
//!
//! Keeps a bounded ring of recent mono samples from the capture callback
//! and turns the newest window into analyser-style byte magnitudes: FFT,
//! Blackman window, dB scaled onto 0..=255 with time smoothing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::device::FrequencyProbe;

/// FFT window size; yields `FFT_SIZE / 2` bins.
pub const FFT_SIZE: usize = 256;

/// Ring capacity (~200ms at 48kHz mono)
const RING_CAPACITY: usize = 10_000;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Weight of the previous frame when smoothing magnitudes.
const SMOOTHING: f32 = 0.8;

/// Ring buffer of recent samples used for analysis
pub struct SampleRing {
    samples: VecDeque<i16>,
    capacity: usize,
}

impl SampleRing {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Add samples, dropping the oldest ones once at capacity
    pub fn push_samples(&mut self, samples: &[i16]) {
        let len = samples.len();

        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Copy the newest `out.len()` samples into `out`, zero-padding the front
    /// when fewer are available.
    pub fn latest(&self, out: &mut [i16]) {
        let n = out.len().min(self.samples.len());
        let pad = out.len() - n;
        out[..pad].fill(0);
        let start = self.samples.len() - n;
        for (slot, sample) in out[pad..].iter_mut().zip(self.samples.range(start..)) {
            *slot = *sample;
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Analyser state: FFT plan, window and smoothed magnitudes.
pub struct ByteSpectrum {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl ByteSpectrum {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        Self {
            fft,
            window: blackman_window(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
        }
    }

    pub fn bin_count(&self) -> usize {
        FFT_SIZE / 2
    }

    /// Analyse one `FFT_SIZE` window and write byte magnitudes into `out`.
    pub fn process(&mut self, samples: &[i16], out: &mut [u8]) {
        let mut buffer: Vec<Complex<f32>> = (0..FFT_SIZE)
            .map(|i| {
                let s = samples.get(i).copied().unwrap_or(0) as f32 / 32768.0;
                Complex::new(s * self.window[i], 0.0)
            })
            .collect();

        self.fft.process(&mut buffer);

        for (bin, slot) in self.smoothed.iter_mut().enumerate() {
            let magnitude = buffer[bin].norm() / FFT_SIZE as f32;
            *slot = SMOOTHING * *slot + (1.0 - SMOOTHING) * magnitude;
        }

        for (slot, &magnitude) in out.iter_mut().zip(self.smoothed.iter()) {
            *slot = magnitude_to_byte(magnitude);
        }
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

impl Default for ByteSpectrum {
    fn default() -> Self {
        Self::new()
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / n;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}

/// Map a linear magnitude onto 0..=255 across the analyser's dB range.
pub fn magnitude_to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

/// Probe fed by a capture callback and read by the level analyzer.
pub struct SampleProbe {
    ring: Mutex<SampleRing>,
    spectrum: Mutex<ByteSpectrum>,
}

impl SampleProbe {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(SampleRing::new()),
            spectrum: Mutex::new(ByteSpectrum::new()),
        }
    }

    /// Feed interleaved samples; channels are averaged down to mono.
    pub fn push_interleaved(&self, samples: &[i16], channels: u16) {
        let channels = channels.max(1) as usize;
        let mono: Vec<i16> = samples
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect();

        if let Ok(mut ring) = self.ring.lock() {
            ring.push_samples(&mono);
        }
    }
}

impl Default for SampleProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyProbe for SampleProbe {
    fn bin_count(&self) -> usize {
        FFT_SIZE / 2
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        let mut window = [0i16; FFT_SIZE];
        match self.ring.lock() {
            Ok(ring) => ring.latest(&mut window),
            Err(_) => {
                out.fill(0);
                return;
            }
        }
        match self.spectrum.lock() {
            Ok(mut spectrum) => spectrum.process(&window, out),
            Err(_) => out.fill(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let mut ring = SampleRing::with_capacity(100);
        let samples: Vec<i16> = (0..150).collect();
        ring.push_samples(&samples);
        assert_eq!(ring.len(), 100);

        ring.push_samples(&[1, 2, 3]);
        assert_eq!(ring.len(), 100);
    }

    #[test]
    fn latest_pads_front_with_silence() {
        let mut ring = SampleRing::with_capacity(16);
        ring.push_samples(&[5, 6, 7]);
        let mut out = [9i16; 5];
        ring.latest(&mut out);
        assert_eq!(out, [0, 0, 5, 6, 7]);
    }

    #[test]
    fn silence_maps_to_zero_bytes() {
        let mut spectrum = ByteSpectrum::new();
        let mut out = vec![255u8; spectrum.bin_count()];
        spectrum.process(&[0i16; FFT_SIZE], &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_lights_up_its_bin() {
        let mut spectrum = ByteSpectrum::new();
        // Bin 16 of a 256-point FFT
        let samples: Vec<i16> = (0..FFT_SIZE)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * 16.0 * i as f32 / FFT_SIZE as f32;
                (phase.sin() * 16_000.0) as i16
            })
            .collect();
        let mut out = vec![0u8; spectrum.bin_count()];
        for _ in 0..20 {
            spectrum.process(&samples, &mut out);
        }
        let loudest = *out.iter().max().unwrap();
        assert_eq!(out[16], loudest);
        assert!(out[16] > 200);
        assert!(out[60] < 50);
    }

    #[test]
    fn magnitude_scale_is_clamped() {
        assert_eq!(magnitude_to_byte(0.0), 0);
        assert_eq!(magnitude_to_byte(1e-9), 0);
        assert_eq!(magnitude_to_byte(1.0), 255);
    }

    #[test]
    fn probe_downmixes_stereo() {
        let probe = SampleProbe::new();
        probe.push_interleaved(&[100, 300, -100, -300], 2);
        let ring = probe.ring.lock().unwrap();
        let mut out = [0i16; 2];
        ring.latest(&mut out);
        assert_eq!(out, [200, -200]);
    }
}
