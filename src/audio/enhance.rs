//! # Caller Voice Enhancement
//!
//! Cleans up raw telephony audio before it is played back. Raw μ-law from the
//! phone network is noisy, and processing it chunk by chunk produces pops at
//! chunk boundaries, so every caller chunk runs through a fixed chain of stages.
//!
//! ## Stage Order:
//! 1. **Low-pass filter**: single-pole IIR, ~3kHz cutoff
//! 2. **Soft noise gate**: attenuate (not mute) very quiet samples
//! 3. **Compression**: scale the excess above a threshold
//! 4. **Smoothing**: 3-point weighted average
//! 5. **AGC + limiter**: RMS gain toward a target, soft knee, hard ceiling
//! 6. **Edge fades**: short linear fade in/out to mask chunk seams
//!
//! Agent audio is never processed here.
//!
//! All stages work on `f32` samples on the ±32768 scale of 16-bit PCM.

use crate::audio::chunk::AudioChunk;
use serde::{Deserialize, Serialize};

/// Tunable parameters of the enhancement chain.
///
/// ## Defaults:
/// The defaults are the hand-tuned values the chain was calibrated with.
/// They can be overridden from the `[enhancement]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementConfig {
    /// Low-pass cutoff frequency in Hz
    pub lowpass_cutoff_hz: f32,
    /// Samples quieter than this are attenuated by the gate
    pub gate_threshold: f32,
    /// Multiplier applied to gated samples
    pub gate_attenuation: f32,
    /// Compressor threshold
    pub compressor_threshold: f32,
    /// Fraction of the excess above threshold that is kept
    pub compressor_ratio: f32,
    /// RMS level the AGC aims for
    pub agc_target_rms: f32,
    /// Upper bound on AGC gain
    pub agc_max_gain: f32,
    /// Soft-knee limiter knee
    pub limiter_knee: f32,
    /// Fraction of the excess above the knee that is kept
    pub limiter_ratio: f32,
    /// Absolute ceiling after limiting
    pub ceiling: f32,
    /// Fade length at each chunk edge
    pub fade_samples: usize,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            lowpass_cutoff_hz: 3000.0,
            gate_threshold: 120.0,
            gate_attenuation: 0.85,
            compressor_threshold: 16000.0,
            compressor_ratio: 0.7,
            agc_target_rms: 7000.0,
            agc_max_gain: 1.8,
            limiter_knee: 26000.0,
            limiter_ratio: 0.25,
            ceiling: 32000.0,
            fade_samples: 16,
        }
    }
}

impl EnhancementConfig {
    /// Check that the parameters describe a usable chain.
    pub fn validate(&self) -> Result<(), String> {
        if self.lowpass_cutoff_hz <= 0.0 {
            return Err("lowpass_cutoff_hz must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.gate_attenuation) {
            return Err("gate_attenuation must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.compressor_ratio) || !(0.0..=1.0).contains(&self.limiter_ratio) {
            return Err("compressor_ratio and limiter_ratio must be between 0 and 1".to_string());
        }
        if self.agc_max_gain <= 0.0 || self.agc_target_rms <= 0.0 {
            return Err("agc_max_gain and agc_target_rms must be greater than 0".to_string());
        }
        if self.ceiling <= 0.0 || self.ceiling > 32767.0 {
            return Err("ceiling must be in (0, 32767]".to_string());
        }
        if self.limiter_knee > self.ceiling {
            return Err("limiter_knee cannot exceed ceiling".to_string());
        }
        Ok(())
    }
}

/// Applies the caller enhancement chain to decoded chunks.
#[derive(Debug, Clone)]
pub struct VoiceEnhancer {
    config: EnhancementConfig,
}

impl VoiceEnhancer {
    pub fn new(config: EnhancementConfig) -> Self {
        Self { config }
    }

    /// Run the full chain over one chunk and return the cleaned chunk.
    pub fn enhance(&self, chunk: &AudioChunk) -> AudioChunk {
        let samples = self.process(chunk.samples(), chunk.sample_rate);
        AudioChunk::new(chunk.party, chunk.sample_rate, samples)
    }

    /// Run the full chain over raw samples.
    pub fn process(&self, samples: &[i16], sample_rate: u32) -> Vec<i16> {
        if samples.is_empty() {
            return Vec::new();
        }

        let mut buf = pcm_to_float(samples);
        self.low_pass(&mut buf, sample_rate);
        self.noise_gate(&mut buf);
        self.compress(&mut buf);
        smooth(&mut buf);
        self.gain_and_limit(&mut buf);
        self.fade_edges(&mut buf);
        float_to_pcm(&buf)
    }

    /// Single-pole IIR low-pass, `alpha = dt / (rc + dt)`.
    fn low_pass(&self, buf: &mut [f32], sample_rate: u32) {
        if sample_rate == 0 {
            return;
        }
        let rc = 1.0 / (2.0 * std::f32::consts::PI * self.config.lowpass_cutoff_hz);
        let dt = 1.0 / sample_rate as f32;
        let alpha = dt / (rc + dt);

        let mut prev = buf[0];
        for sample in buf.iter_mut().skip(1) {
            prev += alpha * (*sample - prev);
            *sample = prev;
        }
    }

    fn noise_gate(&self, buf: &mut [f32]) {
        for sample in buf.iter_mut() {
            if sample.abs() < self.config.gate_threshold {
                *sample *= self.config.gate_attenuation;
            }
        }
    }

    fn compress(&self, buf: &mut [f32]) {
        let threshold = self.config.compressor_threshold;
        for sample in buf.iter_mut() {
            let magnitude = sample.abs();
            if magnitude > threshold {
                let squashed = threshold + (magnitude - threshold) * self.config.compressor_ratio;
                *sample = squashed.copysign(*sample);
            }
        }
    }

    /// Gain the AGC applies for a chunk with the given RMS level.
    pub fn agc_gain(&self, rms: f32) -> f32 {
        if rms <= 0.0 {
            return 1.0;
        }
        (self.config.agc_target_rms / rms).min(self.config.agc_max_gain)
    }

    fn gain_and_limit(&self, buf: &mut [f32]) {
        let gain = self.agc_gain(rms(buf));
        let knee = self.config.limiter_knee;
        let ceiling = self.config.ceiling;

        for sample in buf.iter_mut() {
            let boosted = *sample * gain;
            let magnitude = boosted.abs();
            let limited = if magnitude > knee {
                knee + (magnitude - knee) * self.config.limiter_ratio
            } else {
                magnitude
            };
            *sample = limited.min(ceiling).copysign(boosted);
        }
    }

    fn fade_edges(&self, buf: &mut [f32]) {
        let len = buf.len();
        let fade = self.config.fade_samples.min(len / 2);
        if fade == 0 {
            return;
        }
        for i in 0..fade {
            let factor = i as f32 / fade as f32;
            buf[i] *= factor;
            buf[len - 1 - i] *= factor;
        }
    }
}

/// 3-point weighted smoothing; edge samples pass through.
fn smooth(buf: &mut [f32]) {
    if buf.len() < 3 {
        return;
    }
    let original = buf.to_vec();
    for i in 1..buf.len() - 1 {
        buf[i] = 0.25 * original[i - 1] + 0.5 * original[i] + 0.25 * original[i + 1];
    }
}

/// Root-mean-square level of a buffer.
pub fn rms(buf: &[f32]) -> f32 {
    if buf.is_empty() {
        return 0.0;
    }
    let sum: f64 = buf.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / buf.len() as f64).sqrt() as f32
}

/// 16-bit PCM to float on the same ±32768 scale.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32).collect()
}

/// Float back to 16-bit PCM, rounding and saturating.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| s.round().clamp(-32768.0, 32767.0) as i16)
        .collect()
}
