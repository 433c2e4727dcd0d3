use std::f32::consts::PI;

pub const CURVE_LEN: usize = 44_100;
const OVERSAMPLE: usize = 4;

/// Soft-clipping transfer curve; larger `amount` bends harder.
pub fn saturation_curve(amount: f32) -> Vec<f32> {
  let k = amount.max(0.0);
  let deg = PI / 180.0;
  (0..CURVE_LEN)
    .map(|i| {
      let x = i as f32 * 2.0 / CURVE_LEN as f32 - 1.0;
      ((3.0 + k) * x * 20.0 * deg) / (PI + k * x.abs())
    })
    .collect()
}

#[inline]
fn lookup(curve: &[f32], x: f32) -> f32 {
  let n = curve.len();
  if n == 0 { return x; }
  let pos = (x.clamp(-1.0, 1.0) + 1.0) * 0.5 * (n - 1) as f32;
  let i0 = pos as usize;
  let i1 = (i0 + 1).min(n - 1);
  let frac = pos - i0 as f32;
  curve[i0] + (curve[i1] - curve[i0]) * frac
}

/// Curve lookup at 4x rate: linear-interpolated upsampling, shaping at the
/// high rate, box-filter decimation back down. New curves cross-fade in.
#[derive(Debug)]
pub struct Saturator {
  curve: Box<[f32]>,
  prev: Option<Box<[f32]>>,
  fade: f32,
  fade_step: f32,
  last_in: [f32; 2],
}

impl Saturator {
  pub fn new(amount: f32, sr: f32, fade_secs: f32) -> Self {
    Self {
      curve: saturation_curve(amount).into_boxed_slice(),
      prev: None,
      fade: 1.0,
      fade_step: 1.0 / (fade_secs * sr).max(1.0),
      last_in: [0.0; 2],
    }
  }

  /// Cross-fades to `curve`. Hands back the curve that is no longer needed.
  #[must_use]
  pub fn install_curve(&mut self, curve: Box<[f32]>) -> Option<Box<[f32]>> {
    let old = std::mem::replace(&mut self.curve, curve);
    self.fade = 0.0;
    self.prev.replace(old)
  }

  #[inline]
  fn shape(&self, x: f32) -> f32 {
    let y = lookup(&self.curve, x);
    match &self.prev {
      Some(p) if self.fade < 1.0 => lookup(p, x) * (1.0 - self.fade) + y * self.fade,
      _ => y,
    }
  }

  #[inline]
  fn oversampled(&mut self, ch: usize, x: f32) -> f32 {
    let from = self.last_in[ch];
    let mut acc = 0.0;
    for j in 1..=OVERSAMPLE {
      acc += self.shape(from + (x - from) * (j as f32 / OVERSAMPLE as f32));
    }
    self.last_in[ch] = x;
    acc / OVERSAMPLE as f32
  }

  #[inline]
  fn advance_fade(&mut self) {
    if self.fade < 1.0 { self.fade = (self.fade + self.fade_step).min(1.0); }
  }

  #[inline]
  pub fn process(&mut self, x: f32) -> f32 {
    let y = self.oversampled(0, x);
    self.advance_fade();
    y
  }

  #[inline]
  pub fn process_stereo(&mut self, l: f32, r: f32) -> (f32, f32) {
    let out = (self.oversampled(0, l), self.oversampled(1, r));
    self.advance_fade();
    out
  }
}
