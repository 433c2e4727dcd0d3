//! Render-side wet path: the four effect processors in series between the
//! chain input and the wet bus, plus the dry bus around them.

use super::automation::{AudioParam, ParamEvent};
use super::config::ReverbConfig;
use super::dsp::delay::FeedbackDelay;
use super::dsp::mod_delay::ModDelay;
use super::dsp::reverb::{synthesize_impulse, ConvolutionReverb};
use super::dsp::svf::Svf;
use super::dsp::waveshaper::Saturator;
use super::effects::{default_of, EffectKind, EffectParam};
use super::messages::{Bin, Bus, Garbage, GraphMsg};

/// Time taken to splice a unit in or out.
pub const SPLICE_FADE_SECS: f64 = 0.01;
const MAX_DELAY_SECS: f32 = 5.0;
const CHORUS_MAX_MS: f32 = 30.0;
const BYPASS_FLOOR: f32 = 1e-4;

fn param(kind: EffectKind, p: EffectParam) -> AudioParam { AudioParam::new(default_of(kind, p).unwrap_or(0.0)) }

struct DelayStage { dsp: FeedbackDelay, time: AudioParam, feedback: AudioParam, tone: AudioParam, wet: AudioParam }

struct ReverbStage { dsp: ConvolutionReverb, wet: AudioParam }

struct FilterStage {
  svf: [Svf; 2],
  chorus: ModDelay,
  freq: AudioParam,
  q: AudioParam,
  rate: AudioParam,
  depth: AudioParam,
  wet: AudioParam,
  coeffs: (f32, f32),
}

struct SaturationStage { dsp: Saturator, wet: AudioParam }

pub struct EffectRack {
  delay: DelayStage,
  reverb: ReverbStage,
  filter: FilterStage,
  saturation: SaturationStage,
  active: [bool; 4],
  engaged: [AudioParam; 4],
  wet_bus: AudioParam,
  dry_bus: AudioParam,
  sr: f32,
  bin: Bin,
}

impl EffectRack {
  pub fn new(sr: f32, reverb: &ReverbConfig) -> Self {
    use EffectKind::*;
    let ir = synthesize_impulse(sr, reverb);
    let amount = default_of(Saturation, EffectParam::Amount).unwrap_or(0.0);
    Self {
      delay: DelayStage {
        dsp: FeedbackDelay::new(MAX_DELAY_SECS, sr),
        time: param(Delay, EffectParam::Time),
        feedback: param(Delay, EffectParam::Feedback),
        tone: param(Delay, EffectParam::Tone),
        wet: param(Delay, EffectParam::Wetness),
      },
      reverb: ReverbStage { dsp: ConvolutionReverb::new(&ir), wet: param(Reverb, EffectParam::Wetness) },
      filter: FilterStage {
        svf: [Svf::new(), Svf::new()],
        chorus: ModDelay::new(CHORUS_MAX_MS, sr),
        freq: param(FilterChorus, EffectParam::Frequency),
        q: param(FilterChorus, EffectParam::Resonance),
        rate: param(FilterChorus, EffectParam::ChorusRate),
        depth: param(FilterChorus, EffectParam::ChorusDepth),
        wet: param(FilterChorus, EffectParam::Wetness),
        coeffs: (-1.0, -1.0),
      },
      saturation: SaturationStage { dsp: Saturator::new(amount, sr, SPLICE_FADE_SECS as f32), wet: param(Saturation, EffectParam::Wetness) },
      active: [false; 4],
      engaged: std::array::from_fn(|_| AudioParam::new(0.0)),
      wet_bus: AudioParam::new(0.0),
      dry_bus: AudioParam::new(1.0),
      sr,
      bin: Bin::default(),
    }
  }

  fn target(&mut self, kind: EffectKind, p: EffectParam) -> Option<&mut AudioParam> {
    use EffectParam::*;
    match (kind, p) {
      (EffectKind::Delay, Time) => Some(&mut self.delay.time),
      (EffectKind::Delay, Feedback) => Some(&mut self.delay.feedback),
      (EffectKind::Delay, Tone) => Some(&mut self.delay.tone),
      (EffectKind::Delay, Wetness) => Some(&mut self.delay.wet),
      (EffectKind::Reverb, Wetness) => Some(&mut self.reverb.wet),
      (EffectKind::FilterChorus, Frequency) => Some(&mut self.filter.freq),
      (EffectKind::FilterChorus, Resonance) => Some(&mut self.filter.q),
      (EffectKind::FilterChorus, ChorusRate) => Some(&mut self.filter.rate),
      (EffectKind::FilterChorus, ChorusDepth) => Some(&mut self.filter.depth),
      (EffectKind::FilterChorus, Wetness) => Some(&mut self.filter.wet),
      (EffectKind::Saturation, Wetness) => Some(&mut self.saturation.wet),
      _ => None,
    }
  }

  pub fn set_bin(&mut self, bin: Bin) { self.bin = bin; }

  /// Applies effect-level messages; anything else is handed back.
  pub fn apply(&mut self, msg: GraphMsg, now: f64) -> Option<GraphMsg> {
    match msg {
      GraphMsg::EffectParam { kind, param, event } => {
        if let Some(p) = self.target(kind, param) { p.schedule(event, now); }
      }
      GraphMsg::Splice { kind, engaged } => {
        let i = kind.slot();
        self.active[i] = engaged;
        let e = &mut self.engaged[i];
        e.schedule(ParamEvent::CancelAndHold, now);
        e.schedule(ParamEvent::LinearRamp { end: now + SPLICE_FADE_SECS, value: if engaged { 1.0 } else { 0.0 } }, now);
      }
      GraphMsg::Bus { bus: Bus::Wet, event } => self.wet_bus.schedule(event, now),
      GraphMsg::Bus { bus: Bus::Dry, event } => self.dry_bus.schedule(event, now),
      GraphMsg::SaturationCurve(curve) => {
        if let Some(old) = self.saturation.dsp.install_curve(curve) { self.bin.discard(Garbage::Curve(old)); }
      }
      other => return Some(other),
    }
    None
  }

  pub fn is_engaged(&self, kind: EffectKind) -> bool { self.active[kind.slot()] }

  /// One frame: mono chain input in, stereo dry + wet out.
  #[inline]
  pub fn process(&mut self, x: f32, t: f64) -> (f32, f32) {
    let (mut l, mut r) = (x, x);
    for kind in EffectKind::ORDER {
      let i = kind.slot();
      let e = self.engaged[i].value_at(t);
      if !self.active[i] && e < BYPASS_FLOOR { continue; }
      let (pl, pr) = self.run(kind, l, r, t);
      l += (pl - l) * e;
      r += (pr - r) * e;
    }
    let wet = self.wet_bus.value_at(t);
    let dry = self.dry_bus.value_at(t);
    (x * dry + l * wet, x * dry + r * wet)
  }

  #[inline]
  fn run(&mut self, kind: EffectKind, l: f32, r: f32, t: f64) -> (f32, f32) {
    match kind {
      EffectKind::Delay => {
        let d = &mut self.delay;
        let (time, fb, tone, wet) = (d.time.value_at(t), d.feedback.value_at(t), d.tone.value_at(t), d.wet.value_at(t));
        d.dsp.process(l, r, time, fb, tone, wet)
      }
      EffectKind::Reverb => {
        let wet = self.reverb.wet.value_at(t);
        self.reverb.dsp.process(l, r, wet)
      }
      EffectKind::FilterChorus => {
        let f = &mut self.filter;
        let c = (f.freq.value_at(t), f.q.value_at(t));
        if c != f.coeffs {
          for s in &mut f.svf { s.set_params(c.0, c.1, self.sr); }
          f.coeffs = c;
        }
        let (fl, fr) = (f.svf[0].lowpass(l), f.svf[1].lowpass(r));
        let (rate, depth, wet) = (f.rate.value_at(t), f.depth.value_at(t), f.wet.value_at(t));
        let (cl, cr) = f.chorus.process(fl, fr, rate, depth);
        (fl + (cl - fl) * wet, fr + (cr - fr) * wet)
      }
      EffectKind::Saturation => {
        let wet = self.saturation.wet.value_at(t);
        let (sl, sr) = self.saturation.dsp.process_stereo(l, r);
        (l + (sl - l) * wet, r + (sr - r) * wet)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SR: f32 = 8000.0;

  fn rack() -> EffectRack {
    EffectRack::new(SR, &ReverbConfig { length_secs: 0.2, pre_delay_secs: 0.01, seed: 1 })
  }

  fn at(n: usize) -> f64 { n as f64 / SR as f64 }

  #[test]
  fn idle_rack_passes_dry() {
    let mut r = rack();
    for n in 0..64 {
      let (l, rr) = r.process(0.25, at(n));
      assert_eq!((l, rr), (0.25, 0.25));
    }
  }

  #[test]
  fn splice_out_fades_without_jumps() {
    let mut r = rack();
    r.apply(GraphMsg::Bus { bus: Bus::Wet, event: ParamEvent::SetValue { at: 0.0, value: 1.0 } }, 0.0);
    r.apply(GraphMsg::Bus { bus: Bus::Dry, event: ParamEvent::SetValue { at: 0.0, value: 0.0 } }, 0.0);
    r.apply(GraphMsg::EffectParam { kind: EffectKind::Saturation, param: EffectParam::Wetness, event: ParamEvent::SetValue { at: 0.0, value: 1.0 } }, 0.0);
    r.apply(GraphMsg::Splice { kind: EffectKind::Saturation, engaged: true }, 0.0);
    let mut n = 0;
    while n < 400 { r.process(0.5, at(n)); n += 1; }
    assert!(r.is_engaged(EffectKind::Saturation));
    r.apply(GraphMsg::Splice { kind: EffectKind::Saturation, engaged: false }, at(n));
    let mut prev = r.process(0.5, at(n)).0;
    let fade_frames = (SPLICE_FADE_SECS * SR as f64) as usize;
    for k in 1..(fade_frames + 40) {
      let y = r.process(0.5, at(n + k)).0;
      assert!((y - prev).abs() < 0.1, "jump at {k}: {prev} -> {y}");
      prev = y;
    }
    // fully bypassed: the wet bus now carries the untouched input
    assert!((prev - 0.5).abs() < 1e-4);
  }

  #[test]
  fn unknown_param_targets_are_ignored() {
    let mut r = rack();
    let back = r.apply(GraphMsg::EffectParam { kind: EffectKind::Reverb, param: EffectParam::Amount, event: ParamEvent::Reset(1.0) }, 0.0);
    assert!(back.is_none());
    let back = r.apply(GraphMsg::Disconnect { id: crate::engine::messages::NodeId(0) }, 0.0);
    assert!(back.is_some());
  }

  #[test]
  fn engaged_delay_echoes_input() {
    let mut r = rack();
    r.apply(GraphMsg::Bus { bus: Bus::Wet, event: ParamEvent::SetValue { at: 0.0, value: 1.0 } }, 0.0);
    r.apply(GraphMsg::Bus { bus: Bus::Dry, event: ParamEvent::SetValue { at: 0.0, value: 0.0 } }, 0.0);
    r.apply(GraphMsg::EffectParam { kind: EffectKind::Delay, param: EffectParam::Time, event: ParamEvent::SetValue { at: 0.0, value: 0.1 } }, 0.0);
    r.apply(GraphMsg::EffectParam { kind: EffectKind::Delay, param: EffectParam::Wetness, event: ParamEvent::SetValue { at: 0.0, value: 1.0 } }, 0.0);
    r.apply(GraphMsg::EffectParam { kind: EffectKind::Delay, param: EffectParam::Tone, event: ParamEvent::SetValue { at: 0.0, value: 20_000.0 } }, 0.0);
    r.apply(GraphMsg::Splice { kind: EffectKind::Delay, engaged: true }, 0.0);
    // let the splice ramp settle, then send a single impulse
    let start = 200;
    for n in 0..start { r.process(0.0, at(n)); }
    let mut out = Vec::new();
    for n in 0..1000 { out.push(r.process(if n == 0 { 1.0 } else { 0.0 }, at(start + n)).0); }
    assert!(out[0].abs() < 1e-6);
    assert!(out[800] > 0.9, "echo {}", out[800]);
  }
}
