use std::f32::consts::TAU;

/// Hard ceiling for loop gain; anything at or above 1.0 would run away.
pub const MAX_FEEDBACK: f32 = 0.95;

#[derive(Clone, Debug)]
pub struct OnePoleLP { a: f32, y: f32, cutoff: f32 }

impl OnePoleLP {
  pub fn new() -> Self { Self { a: 1.0, y: 0.0, cutoff: -1.0 } }

  #[inline]
  pub fn set_cutoff(&mut self, hz: f32, sr: f32) {
    if hz == self.cutoff { return; }
    self.cutoff = hz;
    self.a = 1.0 - (-TAU * (hz / sr).clamp(0.0, 0.5)).exp();
  }

  #[inline]
  pub fn tick(&mut self, x: f32) -> f32 { self.y += self.a * (x - self.y); self.y }
}

impl Default for OnePoleLP {
  fn default() -> Self { Self::new() }
}

/// Stereo feedback delay with a low-pass inside the loop, so each repeat
/// comes back darker than the last.
#[derive(Clone, Debug)]
pub struct FeedbackDelay {
  buf_l: Vec<f32>,
  buf_r: Vec<f32>,
  wr: usize,
  len: usize,
  damp_l: OnePoleLP,
  damp_r: OnePoleLP,
  sr: f32,
}

impl FeedbackDelay {
  pub fn new(max_secs: f32, sr: f32) -> Self {
    let len = ((max_secs * sr).ceil().max(64.0)) as usize + 2;
    Self {
      buf_l: vec![0.0; len],
      buf_r: vec![0.0; len],
      wr: 0,
      len,
      damp_l: OnePoleLP::new(),
      damp_r: OnePoleLP::new(),
      sr,
    }
  }

  #[inline]
  fn read(buf: &[f32], wr: usize, delay: f32) -> f32 {
    let len = buf.len();
    let pos = wr as f32 - delay + len as f32;
    let i0 = pos.floor() as usize % len;
    let i1 = (i0 + 1) % len;
    let frac = pos.fract();
    buf[i0] + (buf[i1] - buf[i0]) * frac
  }

  /// One stereo frame. `wet` is this unit's own dry/wet balance.
  #[inline]
  pub fn process(&mut self, l: f32, r: f32, time_secs: f32, feedback: f32, tone_hz: f32, wet: f32) -> (f32, f32) {
    let d = (time_secs * self.sr).clamp(1.0, (self.len - 2) as f32);
    let fb = feedback.clamp(0.0, MAX_FEEDBACK);
    let wet = wet.clamp(0.0, 1.0);
    self.damp_l.set_cutoff(tone_hz, self.sr);
    self.damp_r.set_cutoff(tone_hz, self.sr);
    // read before write so the loop never feeds back within one sample
    let yl = Self::read(&self.buf_l, self.wr, d);
    let yr = Self::read(&self.buf_r, self.wr, d);
    self.buf_l[self.wr] = l + self.damp_l.tick(yl) * fb;
    self.buf_r[self.wr] = r + self.damp_r.tick(yr) * fb;
    self.wr += 1; if self.wr >= self.len { self.wr = 0; }
    (l * (1.0 - wet) + yl * wet, r * (1.0 - wet) + yr * wet)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn impulse_returns_after_delay_time() {
    let sr = 1000.0;
    let mut d = FeedbackDelay::new(1.0, sr);
    let mut out = Vec::new();
    for i in 0..400 {
      let x = if i == 0 { 1.0 } else { 0.0 };
      out.push(d.process(x, x, 0.1, 0.5, 20_000.0, 1.0).0);
    }
    assert!(out[100] > 0.99);
    assert!(out[50].abs() < 1e-6);
    // second repeat scaled by the feedback gain (damping is wide open)
    assert!((out[200] - 0.5).abs() < 0.05, "second echo {}", out[200]);
  }

  #[test]
  fn feedback_is_clamped_below_unity() {
    let sr = 1000.0;
    let mut d = FeedbackDelay::new(0.05, sr);
    let mut peak: f32 = 0.0;
    for i in 0..20_000 {
      let x = if i == 0 { 1.0 } else { 0.0 };
      let (l, _) = d.process(x, x, 0.01, 4.0, 20_000.0, 1.0);
      if i > 15_000 { peak = peak.max(l.abs()); }
    }
    assert!(peak < 1e-3, "tail still at {peak}");
  }

  #[test]
  fn loop_filter_darkens_repeats() {
    let sr = 8000.0;
    let mut bright = FeedbackDelay::new(1.0, sr);
    let mut dark = FeedbackDelay::new(1.0, sr);
    let (mut eb, mut ed) = (0.0f32, 0.0f32);
    for i in 0..8000 {
      // alternating-sign burst is all high-frequency content
      let x = if i < 64 { if i % 2 == 0 { 1.0 } else { -1.0 } } else { 0.0 };
      let b = bright.process(x, x, 0.1, 0.8, 4000.0, 1.0).0;
      let k = dark.process(x, x, 0.1, 0.8, 300.0, 1.0).0;
      if i > 1600 { eb += b * b; ed += k * k; }
    }
    assert!(ed < eb * 0.1);
  }
}
