use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::osc::{Osc, Waveform};

/// Shape of a synthesized drum hit, used when no sample is loaded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrumRecipe {
  pub tone: Waveform,
  pub freq_start: f32,
  pub freq_end: f32,
  pub sweep_secs: f32,
  pub decay_secs: f32,
  /// 0 = pure tone, 1 = pure noise.
  pub noise: f32,
  pub level: f32,
}

/// Pitch-swept oscillator plus noise under an exponential decay to -60 dB.
#[derive(Debug)]
pub struct DrumSynth {
  recipe: DrumRecipe,
  osc: Osc,
  rng: StdRng,
  n: u32,
  sr: f32,
}

impl DrumSynth {
  pub fn new(recipe: DrumRecipe, sr: f32, seed: u64) -> Self {
    Self { recipe, osc: Osc::new(recipe.freq_start, sr), rng: StdRng::seed_from_u64(seed), n: 0, sr }
  }

  pub fn duration_secs(&self) -> f32 { self.recipe.decay_secs }

  #[inline]
  pub fn next(&mut self) -> Option<f32> {
    let t = self.n as f32 / self.sr;
    let r = &self.recipe;
    if t >= r.decay_secs { return None; }
    self.n += 1;
    let sweep = if r.sweep_secs > 0.0 { (t / r.sweep_secs).min(1.0) } else { 1.0 };
    let freq = r.freq_start * (r.freq_end / r.freq_start.max(1e-3)).powf(sweep);
    self.osc.set_freq(freq);
    let env = 0.001f32.powf(t / r.decay_secs);
    let tone = self.osc.next(r.tone);
    let noise: f32 = self.rng.gen_range(-1.0..1.0);
    Some(r.level * env * (tone * (1.0 - r.noise) + noise * r.noise))
  }
}
