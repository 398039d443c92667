use std::collections::VecDeque;
use std::sync::Arc;

use num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use serde::ser::{Serialize, Serializer};

use crate::audio_source::{SampleTap, SignalSource};

/// Transform size: 256 samples is plenty for 64 bars and keeps latency low
/// - At 44.1kHz: 5.8ms window, 172 Hz/bin resolution
/// - At 48kHz: 5.3ms window, 187.5 Hz/bin resolution
pub const FFT_SIZE: usize = 256;

/// Number of bars the overlay draws
pub const BAR_COUNT: usize = 64;

/// Weight of the previous frame in the per-bin moving average
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Decibel window mapped onto [0, 1]
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Compensate for Hann window energy loss
const HANN_WINDOW_CORRECTION: f32 = 2.0;

/// Fixed-length magnitude vector handed to the renderer every tick
#[derive(Clone, Debug, PartialEq)]
pub struct FrequencyVector([f32; BAR_COUNT]);

impl FrequencyVector {
    pub fn silent() -> Self {
        Self([0.0; BAR_COUNT])
    }

    /// Build from any number of bins: extra bins are dropped, missing ones
    /// read as zero
    pub fn from_bins(bins: &[f32]) -> Self {
        let mut bars = [0.0; BAR_COUNT];
        for (bar, &bin) in bars.iter_mut().zip(bins) {
            *bar = bin;
        }
        Self(bars)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Loudest bar
    pub fn peak(&self) -> f32 {
        self.0.iter().copied().fold(0.0, f32::max)
    }
}

impl Default for FrequencyVector {
    fn default() -> Self {
        Self::silent()
    }
}

// serde only derives arrays up to 32 elements
impl Serialize for FrequencyVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// How smoothed magnitudes become bar heights
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MagnitudeScale {
    /// Linear magnitude on a 0-255 byte scale
    Byte,

    /// Decibels normalized between floor and ceiling into [0, 1]
    Decibel { floor_db: f32, ceiling_db: f32 },
}

impl MagnitudeScale {
    /// Decibel mode with the stock -100 dB / -30 dB window
    pub const fn decibel() -> Self {
        MagnitudeScale::Decibel {
            floor_db: MIN_DECIBELS,
            ceiling_db: MAX_DECIBELS,
        }
    }

    /// Largest value a bar can take in this mode
    pub fn full_scale(&self) -> f32 {
        match self {
            MagnitudeScale::Byte => 255.0,
            MagnitudeScale::Decibel { .. } => 1.0,
        }
    }

    /// Map one smoothed magnitude (1.0 = full-scale sine) to a bar height
    pub fn apply(&self, magnitude: f32) -> f32 {
        match *self {
            MagnitudeScale::Byte => (magnitude * 255.0).clamp(0.0, 255.0),
            MagnitudeScale::Decibel { floor_db, ceiling_db } => {
                let range = (ceiling_db - floor_db).max(f32::EPSILON);
                // add small epsilon to avoid log(0)
                let db = 20.0 * (magnitude + 1e-10).log10();
                ((db - floor_db) / range).clamp(0.0, 1.0)
            }
        }
    }
}

impl Default for MagnitudeScale {
    fn default() -> Self {
        Self::decibel()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalyzerError {
    #[error("source does not expose its samples")]
    SamplesHidden,
    #[error("source tap already taken")]
    TapTaken,
    #[error("source is not delivering audio")]
    SourceIdle,
}

/// Spectral analyzer - windowing, FFT, smoothing and bar scaling.
///
/// Pull based: `sample()` is called once per render tick, drains whatever
/// audio arrived since the last call and returns the current vector. It never
/// waits for audio.
pub struct SpectralAnalyzer {
    tap: SampleTap,
    scale: MagnitudeScale,

    // FFT State (reusable, no per-frame allocation)
    fft: Arc<dyn RealToComplex<f32>>,
    history: VecDeque<f32>,     // Most recent FFT_SIZE mono samples
    input_buffer: Vec<f32>,     // Windowed input samples
    spectrum: Vec<Complex<f32>>,
    scratch_buffer: Vec<Complex<f32>>,

    // Hann Window (precomputed, never changes)
    hann_window: Vec<f32>,

    // Smoothing state (persists between frames)
    smoothed: Vec<f32>,
    last: FrequencyVector,

    // Transform context is suspended until a tick resumes it
    suspended: bool,
    frames: u64,
}

impl SpectralAnalyzer {
    /// Attach to a source, taking its sample tap
    pub fn attach<S>(source: &mut S, scale: MagnitudeScale) -> Result<Self, AnalyzerError>
    where
        S: SignalSource + ?Sized,
    {
        if !source.samples_exposed() {
            return Err(AnalyzerError::SamplesHidden);
        }
        let tap = source.take_tap().ok_or(AnalyzerError::TapTaken)?;
        Ok(Self::new(tap, scale))
    }

    /// Create an analyzer over a tap directly
    pub fn new(tap: SampleTap, scale: MagnitudeScale) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        // Allocate all buffers upfront (no runtime allocations)
        let input_buffer = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch_buffer = fft.make_scratch_vec();

        Self {
            tap,
            scale,
            fft,
            history: VecDeque::with_capacity(FFT_SIZE),
            input_buffer,
            spectrum,
            scratch_buffer,
            hann_window: Self::compute_hann_window(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
            last: FrequencyVector::silent(),
            suspended: true,
            frames: 0,
        }
    }

    /// Number of frequency bins the transform yields (Nyquist bin dropped)
    pub fn bin_count(&self) -> usize {
        FFT_SIZE / 2
    }

    pub fn scale(&self) -> MagnitudeScale {
        self.scale
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Transforms computed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Resume the transform context if it is suspended.
    ///
    /// Returns `Ok(true)` when it was resumed, `Ok(false)` when it was already
    /// running, and `SourceIdle` while the source isn't delivering audio.
    pub fn resume_if_suspended(&mut self) -> Result<bool, AnalyzerError> {
        if !self.suspended {
            return Ok(false);
        }
        if !self.tap.is_flowing() {
            return Err(AnalyzerError::SourceIdle);
        }
        self.suspended = false;
        Ok(true)
    }

    /// Pull the current frequency vector.
    ///
    /// Same vector as last time when no new audio arrived or the context is
    /// suspended.
    pub fn sample(&mut self) -> FrequencyVector {
        if self.suspended {
            return self.last.clone();
        }
        if !self.tap.is_flowing() {
            tracing::debug!("[Analyzer] Source stopped flowing, suspending transform");
            self.suspended = true;
            return self.last.clone();
        }

        let mut fresh = false;
        for packet in self.tap.drain() {
            fresh = true;
            for sample in packet.to_mono() {
                if self.history.len() == FFT_SIZE {
                    self.history.pop_front();
                }
                self.history.push_back(sample);
            }
        }

        if fresh && self.transform() {
            let bars: Vec<f32> = self
                .smoothed
                .iter()
                .map(|&magnitude| self.scale.apply(magnitude))
                .collect();
            self.last = FrequencyVector::from_bins(&bars);
            self.frames += 1;
        }

        self.last.clone()
    }

    // ============ Private Implementation ============

    // Precompute Hann Window Function
    fn compute_hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| {
                let angle = 2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32;
                0.5 * (1.0 - angle.cos())
            })
            .collect()
    }

    /// Window the newest samples, run the FFT and fold the magnitudes into
    /// the moving average
    fn transform(&mut self) -> bool {
        // Left-pad with silence until a full window has arrived
        let missing = FFT_SIZE - self.history.len();
        for (i, slot) in self.input_buffer.iter_mut().enumerate() {
            let sample = if i < missing { 0.0 } else { self.history[i - missing] };
            *slot = sample * self.hann_window[i];
        }

        if let Err(e) = self.fft.process_with_scratch(
            &mut self.input_buffer,
            &mut self.spectrum,
            &mut self.scratch_buffer,
        ) {
            tracing::warn!("[Analyzer] FFT processing failed: {}", e);
            return false;
        }

        // Normalize so a full-scale sine centered on a bin reads ~1.0
        let normalize = 2.0 / FFT_SIZE as f32 * HANN_WINDOW_CORRECTION;

        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.spectrum) {
            let magnitude = bin.norm() * normalize;
            *smoothed = SMOOTHING_TIME_CONSTANT * *smoothed
                + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
        }
        true
    }
}

// ===========  Tests ===============
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_source::AudioPacket;
    use crate::testing::ScriptedSource;

    const SAMPLE_RATE: u32 = 48000;

    /// One full window of a sine sitting exactly on `bin`
    fn tone_window(bin: usize, amplitude: f32) -> AudioPacket {
        let samples = (0..FFT_SIZE)
            .map(|n| {
                let phase = 2.0 * std::f32::consts::PI * bin as f32 * n as f32 / FFT_SIZE as f32;
                amplitude * phase.sin()
            })
            .collect();
        AudioPacket {
            samples,
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }

    fn running_analyzer(scale: MagnitudeScale) -> (ScriptedSource, SpectralAnalyzer) {
        let mut source = ScriptedSource::new();
        source.set_flowing(true);
        let mut analyzer = SpectralAnalyzer::attach(&mut source, scale).unwrap();
        assert_eq!(analyzer.resume_if_suspended(), Ok(true));
        (source, analyzer)
    }

    #[test]
    fn test_hann_window() {
        let window = SpectralAnalyzer::compute_hann_window(FFT_SIZE);
        let epsilon = 1e-5;

        // Window should start and end at 0.0
        assert!(window[0].abs() < epsilon, "Window start was {}", window[0]);
        assert!(window[FFT_SIZE - 1].abs() < epsilon, "Window end was {}", window[FFT_SIZE - 1]);

        // ...and peak near 1.0 in the middle
        assert!((window[FFT_SIZE / 2] - 1.0).abs() < 1e-3, "Window peak was {}", window[FFT_SIZE / 2]);
    }

    #[test]
    fn test_vector_pads_and_truncates() {
        let short = FrequencyVector::from_bins(&[1.0, 2.0, 3.0]);
        assert_eq!(short.as_slice().len(), BAR_COUNT);
        assert_eq!(&short.as_slice()[..3], &[1.0, 2.0, 3.0]);
        assert!(short.as_slice()[3..].iter().all(|&v| v == 0.0));

        let long: Vec<f32> = (0..200).map(|i| i as f32).collect();
        let truncated = FrequencyVector::from_bins(&long);
        assert_eq!(truncated.as_slice().len(), BAR_COUNT);
        assert_eq!(truncated.as_slice()[BAR_COUNT - 1], (BAR_COUNT - 1) as f32);

        assert_eq!(FrequencyVector::from_bins(&[]).as_slice().len(), BAR_COUNT);
    }

    #[test]
    fn test_sample_always_has_bar_count_entries() {
        let (source, mut analyzer) = running_analyzer(MagnitudeScale::decibel());
        assert_eq!(analyzer.bin_count(), 128);

        // Before any audio, odd-sized packets, and full windows
        assert_eq!(analyzer.sample().as_slice().len(), BAR_COUNT);
        source.push(AudioPacket { samples: vec![0.25; 17], sample_rate: SAMPLE_RATE, channels: 1 });
        assert_eq!(analyzer.sample().as_slice().len(), BAR_COUNT);
        source.push(tone_window(4, 0.5));
        assert_eq!(analyzer.sample().as_slice().len(), BAR_COUNT);
    }

    #[test]
    fn test_sample_is_idempotent_without_new_audio() {
        let (source, mut analyzer) = running_analyzer(MagnitudeScale::decibel());
        source.push(tone_window(8, 0.5));

        let first = analyzer.sample();
        let second = analyzer.sample();
        let third = analyzer.sample();

        assert!(first.peak() > 0.0, "tone should register");
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(analyzer.frames(), 1);
    }

    #[test]
    fn test_step_input_rises_monotonically_without_overshoot() {
        for scale in [MagnitudeScale::Byte, MagnitudeScale::decibel()] {
            let (source, mut analyzer) = running_analyzer(scale);
            let bin = 8;

            // Silence first
            source.push(AudioPacket { samples: vec![0.0; FFT_SIZE], sample_rate: SAMPLE_RATE, channels: 1 });
            let mut previous = analyzer.sample().as_slice()[bin];

            // Steady state: what the bin settles to after many identical windows
            let steady = {
                let (steady_source, mut steady_analyzer) = running_analyzer(scale);
                let mut value = 0.0;
                for _ in 0..200 {
                    steady_source.push(tone_window(bin, 0.5));
                    value = steady_analyzer.sample().as_slice()[bin];
                }
                value
            };

            for step in 0..40 {
                source.push(tone_window(bin, 0.5));
                let current = analyzer.sample().as_slice()[bin];
                assert!(current >= previous, "{:?} step {}: {} fell below {}", scale, step, current, previous);
                assert!(current <= steady + 1e-4, "{:?} step {}: {} overshot {}", scale, step, current, steady);
                previous = current;
            }
            assert!(previous > 0.0);
        }
    }

    #[test]
    fn test_byte_scale_full_scale_sine() {
        // After the average settles, a full-scale tone should read near 255
        let (source, mut analyzer) = running_analyzer(MagnitudeScale::Byte);
        let mut bars = FrequencyVector::silent();
        for _ in 0..100 {
            source.push(tone_window(10, 1.0));
            bars = analyzer.sample();
        }
        let peak = bars.as_slice()[10];
        assert!(peak > 240.0 && peak <= 255.0, "peak was {}", peak);

        // Energy stays around the tone's bin
        assert!(bars.as_slice()[30] < 10.0);
    }

    #[test]
    fn test_decibel_scale_mapping() {
        let scale = MagnitudeScale::decibel();
        assert_eq!(scale.apply(0.0), 0.0);
        assert_eq!(scale.apply(1.0), 1.0); // 0 dB is above the ceiling

        // -65 dB sits halfway between -100 and -30
        let halfway = 10f32.powf(-65.0 / 20.0);
        assert!((scale.apply(halfway) - 0.5).abs() < 1e-3);

        // Output depends only on the two scalars
        let wide = MagnitudeScale::Decibel { floor_db: -120.0, ceiling_db: 0.0 };
        assert!((wide.apply(halfway) - (55.0 / 120.0)).abs() < 1e-3);
    }

    #[test]
    fn test_suspended_context_skips_transform() {
        let mut source = ScriptedSource::new();
        let mut analyzer = SpectralAnalyzer::attach(&mut source, MagnitudeScale::Byte).unwrap();

        // Not flowing yet: resume fails but nothing breaks
        assert!(analyzer.is_suspended());
        assert_eq!(analyzer.resume_if_suspended(), Err(AnalyzerError::SourceIdle));
        source.push(tone_window(8, 0.5));
        assert_eq!(analyzer.sample(), FrequencyVector::silent());
        assert_eq!(analyzer.frames(), 0);

        source.set_flowing(true);
        assert_eq!(analyzer.resume_if_suspended(), Ok(true));
        assert_eq!(analyzer.resume_if_suspended(), Ok(false));
        assert!(analyzer.sample().peak() > 0.0);

        // Source stops: analyzer suspends itself and keeps the last frame
        let before = analyzer.sample();
        source.set_flowing(false);
        source.push(tone_window(20, 1.0));
        assert_eq!(analyzer.sample(), before);
        assert!(analyzer.is_suspended());
    }

    #[test]
    fn test_hidden_samples_refuse_attach() {
        let mut source = ScriptedSource::new();
        source.hide_samples();
        assert_eq!(
            SpectralAnalyzer::attach(&mut source, MagnitudeScale::Byte).err(),
            Some(AnalyzerError::SamplesHidden)
        );

        let mut source = ScriptedSource::new();
        let _first = SpectralAnalyzer::attach(&mut source, MagnitudeScale::Byte).unwrap();
        assert_eq!(
            SpectralAnalyzer::attach(&mut source, MagnitudeScale::Byte).err(),
            Some(AnalyzerError::TapTaken)
        );
    }
}
