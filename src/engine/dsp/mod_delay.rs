use std::f32::consts::TAU;

/// Short stereo delay swept by a sine LFO; the chorus half of the filter unit.
/// Right channel LFO runs a third of a cycle ahead of the left.
#[derive(Clone, Debug)]
pub struct ModDelay {
  buf_l: Vec<f32>,
  buf_r: Vec<f32>,
  wr: usize,
  phase: f32,
  sr: f32,
}

/// Centre delay of the sweep, in milliseconds.
pub const BASE_MS: f32 = 7.0;

impl ModDelay {
  pub fn new(max_ms: f32, sr: f32) -> Self {
    let len = (((max_ms / 1000.0) * sr).ceil().max(64.0)) as usize;
    Self { buf_l: vec![0.0; len], buf_r: vec![0.0; len], wr: 0, phase: 0.0, sr }
  }

  #[inline]
  fn tap(buf: &[f32], wr: usize, delay: f32) -> f32 {
    let len = buf.len() as f32;
    let pos = (wr as f32 - delay).rem_euclid(len);
    let i0 = pos as usize % buf.len();
    let i1 = (i0 + 1) % buf.len();
    let frac = pos.fract();
    buf[i0] + (buf[i1] - buf[i0]) * frac
  }

  /// Returns only the swept (wet) signal; the caller decides the blend.
  #[inline]
  pub fn process(&mut self, l: f32, r: f32, rate_hz: f32, depth_ms: f32) -> (f32, f32) {
    self.buf_l[self.wr] = l;
    self.buf_r[self.wr] = r;
    let ms = self.sr / 1000.0;
    let max_d = (self.buf_l.len() - 2) as f32;
    let swing = depth_ms.max(0.0) * ms;
    let dl = (BASE_MS * ms + (TAU * self.phase).sin() * swing).clamp(1.0, max_d);
    let dr = (BASE_MS * ms + (TAU * (self.phase + 0.33)).sin() * swing).clamp(1.0, max_d);
    let yl = Self::tap(&self.buf_l, self.wr, dl);
    let yr = Self::tap(&self.buf_r, self.wr, dr);
    self.phase = (self.phase + rate_hz.max(0.0) / self.sr).fract();
    self.wr += 1; if self.wr >= self.buf_l.len() { self.wr = 0; }
    (yl, yr)
  }
}
