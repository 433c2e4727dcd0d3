//! Convolution reverb: a synthesized stereo impulse and a uniformly
//! partitioned overlap-save convolver built on `rustfft`.

use std::f32::consts::TAU;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use super::delay::OnePoleLP;
use crate::engine::config::ReverbConfig;

/// Early reflection offsets after the pre-delay, seconds.
pub const EARLY_TIMES: [f32; 10] = [0.005, 0.01, 0.015, 0.02, 0.025, 0.03, 0.04, 0.05, 0.07, 0.09];
pub const BLOCK: usize = 1024;
const TAIL_CUTOFF_HZ: f32 = 5000.0;
const MICRO_DELAY: usize = 5;

pub struct ImpulseResponse {
  pub left: Vec<f32>,
  pub right: Vec<f32>,
  pub pre_delay: usize,
}

pub fn synthesize_impulse(sr: f32, cfg: &ReverbConfig) -> ImpulseResponse {
  let mut rng = StdRng::seed_from_u64(cfg.seed);
  let len = ((cfg.length_secs * sr).round() as usize).max(MICRO_DELAY + 2);
  let pre = ((cfg.pre_delay_secs * sr).round() as usize).min(len - 1);
  let mut chans = [vec![0.0f32; len], vec![0.0f32; len]];
  for (ch, ir) in chans.iter_mut().enumerate() {
    for (i, &t) in EARLY_TIMES.iter().enumerate() {
      let idx = pre + (t * sr).round() as usize;
      if idx >= len { continue; }
      let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
      ir[idx] += 0.7 * 0.9f32.powi(i as i32) * sign;
    }
    let mut lp = OnePoleLP::new();
    lp.set_cutoff(TAIL_CUTOFF_HZ, sr);
    let tail_len = (len - pre) as f32;
    let onset_len = (0.02 * sr).max(1.0);
    let lfo_hz = 0.5 + 0.1 * ch as f32;
    for (i, s) in ir.iter_mut().enumerate().skip(pre) {
      let n = (i - pre) as f32;
      // -60 dB by the last sample
      let decay = (-6.9 * n / tail_len).exp();
      let onset = (n / onset_len).min(1.0);
      let wobble = 1.0 + 0.02 * (TAU * lfo_hz * i as f32 / sr).sin();
      *s += lp.tick(rng.gen_range(-1.0f32..1.0)) * 0.25 * decay * onset * wobble;
    }
  }
  let [mut left, mut right] = chans;
  for i in (MICRO_DELAY..len).rev() {
    right[i] = 0.7 * right[i] + 0.3 * right[i - MICRO_DELAY];
  }
  normalize(&mut left);
  normalize(&mut right);
  ImpulseResponse { left, right, pre_delay: pre }
}

fn normalize(ir: &mut [f32]) {
  let energy: f32 = ir.iter().map(|x| x * x).sum();
  if energy > 0.0 {
    let g = 1.0 / energy.sqrt();
    for x in ir.iter_mut() { *x *= g; }
  }
}

/// Output lags input by exactly `block` samples.
pub struct Convolver {
  block: usize,
  fwd: Arc<dyn Fft<f32>>,
  inv: Arc<dyn Fft<f32>>,
  parts: Vec<Vec<Complex32>>,
  fdl: Vec<Vec<Complex32>>,
  head: usize,
  input: Vec<f32>,
  fill: usize,
  out: Vec<f32>,
  spec: Vec<Complex32>,
  acc: Vec<Complex32>,
  scratch: Vec<Complex32>,
}

impl Convolver {
  pub fn new(ir: &[f32], block: usize) -> Self {
    let block = block.max(1);
    let n = 2 * block;
    let mut planner = FftPlanner::<f32>::new();
    let fwd = planner.plan_fft_forward(n);
    let inv = planner.plan_fft_inverse(n);
    let zero = Complex32::new(0.0, 0.0);
    let mut scratch = vec![zero; fwd.get_inplace_scratch_len().max(inv.get_inplace_scratch_len())];
    let mut parts: Vec<Vec<Complex32>> = ir
      .chunks(block)
      .map(|chunk| {
        let mut buf = vec![zero; n];
        for (c, &v) in buf.iter_mut().zip(chunk) { c.re = v; }
        fwd.process_with_scratch(&mut buf, &mut scratch);
        buf
      })
      .collect();
    if parts.is_empty() { parts.push(vec![zero; n]); }
    let fdl = vec![vec![zero; n]; parts.len()];
    Self {
      block,
      fwd,
      inv,
      parts,
      fdl,
      head: 0,
      input: vec![0.0; n],
      fill: 0,
      out: vec![0.0; block],
      spec: vec![zero; n],
      acc: vec![zero; n],
      scratch,
    }
  }

  #[inline]
  pub fn process(&mut self, x: f32) -> f32 {
    let y = self.out[self.fill];
    self.input[self.block + self.fill] = x;
    self.fill += 1;
    if self.fill == self.block {
      self.run_block();
      self.fill = 0;
    }
    y
  }

  fn run_block(&mut self) {
    let b = self.block;
    let n = 2 * b;
    for (c, &v) in self.spec.iter_mut().zip(self.input.iter()) { *c = Complex32::new(v, 0.0); }
    self.fwd.process_with_scratch(&mut self.spec, &mut self.scratch);
    let p = self.parts.len();
    self.head = (self.head + p - 1) % p;
    self.fdl[self.head].copy_from_slice(&self.spec);
    for a in self.acc.iter_mut() { *a = Complex32::new(0.0, 0.0); }
    for (k, h) in self.parts.iter().enumerate() {
      let x = &self.fdl[(self.head + k) % p];
      for ((a, xv), hv) in self.acc.iter_mut().zip(x.iter()).zip(h.iter()) { *a += xv * hv; }
    }
    self.inv.process_with_scratch(&mut self.acc, &mut self.scratch);
    let scale = 1.0 / n as f32;
    for (o, a) in self.out.iter_mut().zip(self.acc[b..].iter()) { *o = a.re * scale; }
    self.input.copy_within(b..n, 0);
  }
}

pub struct ConvolutionReverb {
  left: Convolver,
  right: Convolver,
}

impl ConvolutionReverb {
  /// The impulse is advanced by up to one block of its own pre-delay, which
  /// cancels the convolver latency whenever the pre-delay is long enough.
  pub fn new(ir: &ImpulseResponse) -> Self {
    let shift = BLOCK.min(ir.pre_delay);
    Self {
      left: Convolver::new(&ir.left[shift..], BLOCK),
      right: Convolver::new(&ir.right[shift..], BLOCK),
    }
  }

  #[inline]
  pub fn process(&mut self, l: f32, r: f32, wet: f32) -> (f32, f32) {
    let wet = wet.clamp(0.0, 1.0);
    let yl = self.left.process(l);
    let yr = self.right.process(r);
    (l * (1.0 - wet) + yl * wet, r * (1.0 - wet) + yr * wet)
  }
}
