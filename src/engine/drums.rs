//! Drum collaborator boundary and the built-in fallback kit.

use std::fmt;
use std::sync::Arc;

use super::dsp::drum_voice::DrumRecipe;
use super::dsp::osc::Waveform;

pub const DRUM_COUNT: usize = 12;

pub const DRUM_LABELS: [&str; DRUM_COUNT] = [
  "Kick", "Snare", "Hat 1", "Hat 2", "Tom 1", "Tom 2", "Tom 3", "Crash", "Ride", "Hat O", "Clap", "Perc",
];

/// Decoded mono audio handed over by the sample provider.
#[derive(Clone)]
pub struct SampleBuffer {
  pub data: Arc<[f32]>,
  pub sample_rate: f32,
}

impl SampleBuffer {
  pub fn new(data: Arc<[f32]>, sample_rate: f32) -> Self { Self { data, sample_rate } }
}

impl fmt::Debug for SampleBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SampleBuffer").field("frames", &self.data.len()).field("sample_rate", &self.sample_rate).finish()
  }
}

/// Supplies decoded drum samples. Loading and kit management live outside the engine.
pub trait DrumSampleProvider: Send {
  fn sample_buffer(&self, drum_index: usize) -> Option<SampleBuffer>;
}

/// Provider with no samples; every hit uses the synthesized fallback.
pub struct NoSamples;

impl DrumSampleProvider for NoSamples {
  fn sample_buffer(&self, _drum_index: usize) -> Option<SampleBuffer> { None }
}

/// In-memory provider keyed by drum index.
#[derive(Default)]
pub struct SampleKit { slots: Vec<Option<SampleBuffer>> }

impl SampleKit {
  pub fn new() -> Self { Self { slots: vec![None; DRUM_COUNT] } }

  pub fn set(&mut self, drum_index: usize, buffer: SampleBuffer) {
    if drum_index >= self.slots.len() { self.slots.resize(drum_index + 1, None); }
    self.slots[drum_index] = Some(buffer);
  }
}

impl DrumSampleProvider for SampleKit {
  fn sample_buffer(&self, drum_index: usize) -> Option<SampleBuffer> {
    self.slots.get(drum_index).cloned().flatten()
  }
}

pub fn label(drum_index: usize) -> &'static str { DRUM_LABELS.get(drum_index).copied().unwrap_or("Perc") }

const fn recipe(tone: Waveform, freq_start: f32, freq_end: f32, sweep_secs: f32, decay_secs: f32, noise: f32, level: f32) -> DrumRecipe {
  DrumRecipe { tone, freq_start, freq_end, sweep_secs, decay_secs, noise, level }
}

const FALLBACK: [DrumRecipe; DRUM_COUNT] = [
  recipe(Waveform::Square, 60.0, 30.0, 0.3, 0.4, 0.0, 1.0),
  recipe(Waveform::Triangle, 100.0, 100.0, 0.0, 0.2, 0.6, 1.0),
  recipe(Waveform::Square, 800.0, 800.0, 0.0, 0.1, 0.7, 0.5),
  recipe(Waveform::Square, 800.0, 800.0, 0.0, 0.3, 0.7, 0.5),
  recipe(Waveform::Triangle, 180.0, 120.0, 0.2, 0.3, 0.1, 0.9),
  recipe(Waveform::Triangle, 140.0, 95.0, 0.2, 0.35, 0.1, 0.9),
  recipe(Waveform::Triangle, 100.0, 70.0, 0.25, 0.4, 0.1, 0.9),
  recipe(Waveform::Square, 3000.0, 3000.0, 0.0, 1.2, 0.9, 0.4),
  recipe(Waveform::Square, 3200.0, 3000.0, 0.1, 0.8, 0.5, 0.35),
  recipe(Waveform::Square, 800.0, 800.0, 0.0, 0.5, 0.7, 0.45),
  recipe(Waveform::Triangle, 1200.0, 900.0, 0.02, 0.15, 0.9, 0.8),
  recipe(Waveform::Sine, 520.0, 480.0, 0.05, 0.15, 0.2, 0.8),
];

pub fn fallback_recipe(drum_index: usize) -> DrumRecipe { FALLBACK[drum_index % DRUM_COUNT] }

/// Kit-wide tone knob (0..=1) mapped onto the per-hit low-pass.
pub fn tone_cutoff_hz(tone: f32) -> f32 {
  let t = tone.clamp(0.0, 1.0);
  200.0 + t * t * 21_850.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kit_returns_what_was_set() {
    let mut kit = SampleKit::new();
    kit.set(1, SampleBuffer::new(Arc::from(vec![0.1f32; 4]), 48_000.0));
    assert!(kit.sample_buffer(0).is_none());
    assert_eq!(kit.sample_buffer(1).map(|b| b.data.len()), Some(4));
    assert!(kit.sample_buffer(40).is_none());
    assert!(NoSamples.sample_buffer(1).is_none());
  }

  #[test]
  fn tone_knob_spans_the_audible_range() {
    assert_eq!(tone_cutoff_hz(0.0), 200.0);
    assert_eq!(tone_cutoff_hz(1.0), 22_050.0);
    assert_eq!(label(2), "Hat 1");
    assert_eq!(fallback_recipe(DRUM_COUNT).freq_start, 60.0);
  }
}
