use std::f32::consts::PI;

/// Trapezoidal state-variable filter; only the low-pass tap is used by the engine.
#[derive(Clone, Debug)]
pub struct Svf {
  ic1eq: f32,
  ic2eq: f32,
  g: f32,
  k: f32,
}

impl Svf {
  pub fn new() -> Self { Self { ic1eq: 0.0, ic2eq: 0.0, g: 1.0, k: 1.0 } }

  pub fn set_params(&mut self, cutoff: f32, q: f32, sr: f32) {
    let fc = (cutoff / sr).clamp(1e-5, 0.49);
    self.g = (PI * fc).tan();
    self.k = 1.0 / q.max(0.05);
  }

  #[inline]
  pub fn lowpass(&mut self, x: f32) -> f32 {
    let g = self.g; let k = self.k;
    let v1 = (self.ic1eq + g * (x - self.ic2eq)) / (1.0 + g * (g + k));
    let v2 = self.ic2eq + g * v1;
    self.ic1eq = 2.0 * v1 - self.ic1eq;
    self.ic2eq = 2.0 * v2 - self.ic2eq;
    v2
  }

  pub fn reset(&mut self) { self.ic1eq = 0.0; self.ic2eq = 0.0; }
}

impl Default for Svf {
  fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::dsp::osc::{Osc, Waveform};

  fn rms_through(cutoff: f32, freq: f32) -> f32 {
    let sr = 44_100.0;
    let mut f = Svf::new();
    f.set_params(cutoff, 0.707, sr);
    let mut o = Osc::new(freq, sr);
    let mut acc = 0.0;
    for i in 0..8192 {
      let y = f.lowpass(o.next(Waveform::Sine));
      if i >= 4096 { acc += y * y; }
    }
    (acc / 4096.0).sqrt()
  }

  #[test]
  fn passes_lows_cuts_highs() {
    let low = rms_through(1000.0, 100.0);
    let high = rms_through(1000.0, 8000.0);
    assert!(low > 0.6, "low band {low}");
    assert!(high < 0.05, "high band {high}");
  }

  #[test]
  fn dc_gain_is_unity() {
    let mut f = Svf::new();
    f.set_params(500.0, 1.0, 48_000.0);
    let mut y = 0.0;
    for _ in 0..48_000 { y = f.lowpass(1.0); }
    assert!((y - 1.0).abs() < 1e-3);
  }
}
