use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform { Sine, Square, Sawtooth, Triangle }

#[inline]
pub fn midi_to_freq(m: f32) -> f32 { 440.0 * (2.0_f32).powf((m - 69.0) / 12.0) }

/// Phase-accumulator oscillator. Saw and square get a PolyBLEP correction
/// at their discontinuities.
#[derive(Clone, Debug)]
pub struct Osc {
  phase: f32,
  inc: f32,
  sr: f32,
}

impl Osc {
  pub fn new(freq: f32, sr: f32) -> Self { Self { phase: 0.0, inc: (freq / sr).clamp(0.0, 0.5), sr } }

  #[inline]
  pub fn set_freq(&mut self, freq: f32) { self.inc = (freq / self.sr).clamp(0.0, 0.5); }

  #[inline]
  pub fn next(&mut self, shape: Waveform) -> f32 {
    let p = self.phase;
    let dt = self.inc;
    self.phase += dt;
    if self.phase >= 1.0 { self.phase -= 1.0; }
    match shape {
      Waveform::Sine => (2.0 * PI * p).sin(),
      Waveform::Sawtooth => 2.0 * p - 1.0 - poly_blep(p, dt),
      Waveform::Square => {
        let naive = if p < 0.5 { 1.0 } else { -1.0 };
        naive + poly_blep(p, dt) - poly_blep((p + 0.5) % 1.0, dt)
      }
      Waveform::Triangle => 2.0 * (2.0 * ((p + 0.25) % 1.0) - 1.0).abs() - 1.0,
    }
  }
}

#[inline]
fn poly_blep(t: f32, dt: f32) -> f32 {
  if dt <= 0.0 { return 0.0; }
  if t < dt {
    let x = t / dt;
    x + x - x * x - 1.0
  } else if t > 1.0 - dt {
    let x = (t - 1.0) / dt;
    x * x + x + x + 1.0
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn a4_is_440() {
    assert_relative_eq!(midi_to_freq(69.0), 440.0);
    assert_relative_eq!(midi_to_freq(81.0), 880.0, epsilon = 1e-3);
  }

  #[test]
  fn shapes_stay_bounded() {
    for shape in [Waveform::Sine, Waveform::Square, Waveform::Sawtooth, Waveform::Triangle] {
      let mut o = Osc::new(1234.5, 44_100.0);
      for _ in 0..44_100 {
        let s = o.next(shape);
        assert!(s.abs() <= 1.01, "{shape:?} produced {s}");
      }
    }
  }

  #[test]
  fn sine_has_no_dc() {
    let mut o = Osc::new(441.0, 44_100.0);
    let sum: f32 = (0..44_100).map(|_| o.next(Waveform::Sine)).sum();
    assert!(sum.abs() / 44_100.0 < 1e-3);
  }
}
