use crate::engine::drums::SampleBuffer;

/// One-shot playback of a decoded buffer, resampled by linear interpolation.
#[derive(Clone, Debug)]
pub struct SamplePlayer {
  buffer: SampleBuffer,
  pos: f64,
  step: f64,
}

impl SamplePlayer {
  pub fn new(buffer: SampleBuffer, out_sr: f32, pitch: f32) -> Self {
    let step = (buffer.sample_rate as f64 / out_sr.max(1.0) as f64) * pitch.max(0.01) as f64;
    Self { buffer, pos: 0.0, step }
  }

  pub fn duration_secs(&self, out_sr: f32) -> f32 {
    (self.buffer.data.len() as f64 / self.step / out_sr.max(1.0) as f64) as f32
  }

  /// `None` once the buffer has played out.
  #[inline]
  pub fn next(&mut self) -> Option<f32> {
    let data = &self.buffer.data;
    let idx = self.pos.floor() as usize;
    if idx >= data.len() { return None; }
    let next = (idx + 1).min(data.len() - 1);
    let frac = (self.pos - idx as f64) as f32;
    let a = data[idx];
    let b = data[next];
    self.pos += self.step;
    Some(a + (b - a) * frac)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn plays_out_and_stops() {
    let buf = SampleBuffer::new(Arc::from(vec![0.0, 1.0, 0.5, -0.5]), 44_100.0);
    let mut p = SamplePlayer::new(buf, 44_100.0, 1.0);
    let out: Vec<f32> = std::iter::from_fn(|| p.next()).collect();
    assert_eq!(out, vec![0.0, 1.0, 0.5, -0.5]);
  }

  #[test]
  fn half_rate_buffer_is_stretched() {
    let buf = SampleBuffer::new(Arc::from(vec![0.0, 1.0, 0.0, 0.0]), 22_050.0);
    let mut p = SamplePlayer::new(buf, 44_100.0, 1.0);
    assert!((p.duration_secs(44_100.0) - 8.0 / 44_100.0).abs() < 1e-9);
    let out: Vec<f32> = std::iter::from_fn(|| p.next()).collect();
    assert_eq!(out.len(), 8);
    assert_eq!(out[1], 0.5);
    assert_eq!(out[2], 1.0);
  }
}
