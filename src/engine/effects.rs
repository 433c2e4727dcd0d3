//! Control-side effect units and the chain that splices them.
//!
//! Each unit only records its state and tells the render side what changed;
//! the DSP lives in [`super::rack`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::automation::ParamEvent;
use super::dsp::waveshaper::saturation_curve;
use super::error::{EngineError, Result};
use super::messages::{Bus, GraphLink, GraphMsg};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
  Delay,
  Reverb,
  #[serde(rename = "filter", alias = "chorus")]
  FilterChorus,
  #[serde(alias = "distortion")]
  Saturation,
}

impl EffectKind {
  /// Series order of the wet path.
  pub const ORDER: [EffectKind; 4] = [EffectKind::Delay, EffectKind::Reverb, EffectKind::FilterChorus, EffectKind::Saturation];

  pub fn slot(self) -> usize {
    match self {
      EffectKind::Delay => 0,
      EffectKind::Reverb => 1,
      EffectKind::FilterChorus => 2,
      EffectKind::Saturation => 3,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      EffectKind::Delay => "delay",
      EffectKind::Reverb => "reverb",
      EffectKind::FilterChorus => "filter",
      EffectKind::Saturation => "saturation",
    }
  }
}

impl fmt::Display for EffectKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

impl FromStr for EffectKind {
  type Err = EngineError;
  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "delay" | "echo" => Ok(EffectKind::Delay),
      "reverb" => Ok(EffectKind::Reverb),
      "filter" | "chorus" => Ok(EffectKind::FilterChorus),
      "saturation" | "distortion" => Ok(EffectKind::Saturation),
      _ => Err(EngineError::UnknownEffect(s.to_string())),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectParam { Time, Feedback, Tone, Wetness, Frequency, Resonance, ChorusRate, ChorusDepth, Amount }

impl EffectParam {
  pub fn name(self) -> &'static str {
    match self {
      EffectParam::Time => "time",
      EffectParam::Feedback => "feedback",
      EffectParam::Tone => "tone",
      EffectParam::Wetness => "wetness",
      EffectParam::Frequency => "frequency",
      EffectParam::Resonance => "resonance",
      EffectParam::ChorusRate => "chorusRate",
      EffectParam::ChorusDepth => "chorusDepth",
      EffectParam::Amount => "amount",
    }
  }

  /// Parses a parameter name in the context of one effect, so errors can name both.
  pub fn parse_for(effect: EffectKind, s: &str) -> Result<Self> {
    let p = match s.to_ascii_lowercase().as_str() {
      "time" => EffectParam::Time,
      "feedback" => EffectParam::Feedback,
      "tone" | "damping" => EffectParam::Tone,
      "wetness" | "wet" | "mix" => EffectParam::Wetness,
      "frequency" | "cutoff" => EffectParam::Frequency,
      "resonance" | "q" => EffectParam::Resonance,
      "chorusrate" | "rate" => EffectParam::ChorusRate,
      "chorusdepth" | "depth" => EffectParam::ChorusDepth,
      "amount" | "drive" => EffectParam::Amount,
      _ => return Err(EngineError::UnknownParam { effect: effect.name().into(), param: s.to_string() }),
    };
    Ok(p)
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamSpec { pub param: EffectParam, pub min: f32, pub max: f32, pub default: f32 }

const fn spec(param: EffectParam, min: f32, max: f32, default: f32) -> ParamSpec { ParamSpec { param, min, max, default } }

pub const DELAY_PARAMS: [ParamSpec; 4] = [
  spec(EffectParam::Time, 0.01, 5.0, 0.375),
  spec(EffectParam::Feedback, 0.0, 0.95, 0.65),
  spec(EffectParam::Tone, 200.0, 20_000.0, 2500.0),
  spec(EffectParam::Wetness, 0.0, 1.0, 0.3),
];
pub const REVERB_PARAMS: [ParamSpec; 1] = [spec(EffectParam::Wetness, 0.0, 1.0, 0.3)];
pub const FILTER_PARAMS: [ParamSpec; 5] = [
  spec(EffectParam::Frequency, 20.0, 20_000.0, 2000.0),
  spec(EffectParam::Resonance, 0.1, 30.0, 1.0),
  spec(EffectParam::ChorusRate, 0.05, 8.0, 0.8),
  spec(EffectParam::ChorusDepth, 0.0, 10.0, 2.0),
  spec(EffectParam::Wetness, 0.0, 1.0, 0.5),
];
pub const SATURATION_PARAMS: [ParamSpec; 2] = [
  spec(EffectParam::Amount, 0.0, 100.0, 20.0),
  spec(EffectParam::Wetness, 0.0, 1.0, 0.5),
];

pub fn default_of(kind: EffectKind, param: EffectParam) -> Option<f32> {
  specs_for(kind).iter().find(|s| s.param == param).map(|s| s.default)
}

pub fn specs_for(kind: EffectKind) -> &'static [ParamSpec] {
  match kind {
    EffectKind::Delay => &DELAY_PARAMS,
    EffectKind::Reverb => &REVERB_PARAMS,
    EffectKind::FilterChorus => &FILTER_PARAMS,
    EffectKind::Saturation => &SATURATION_PARAMS,
  }
}

/// Parameter values of one unit, stored in the order of its parameter table.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitState { enabled: bool, values: Vec<f32> }

impl UnitState {
  fn defaults(kind: EffectKind) -> Self {
    Self { enabled: false, values: specs_for(kind).iter().map(|s| s.default).collect() }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DelayUnit(UnitState);
#[derive(Clone, Debug, PartialEq)]
pub struct ReverbUnit(UnitState);
#[derive(Clone, Debug, PartialEq)]
pub struct FilterChorusUnit(UnitState);
#[derive(Clone, Debug, PartialEq)]
pub struct SaturationUnit(UnitState);

#[derive(Clone, Debug, PartialEq)]
pub enum EffectUnit {
  Delay(DelayUnit),
  Reverb(ReverbUnit),
  FilterChorus(FilterChorusUnit),
  Saturation(SaturationUnit),
}

/// What every unit can do, whatever its kind.
pub trait EffectControl {
  fn kind(&self) -> EffectKind;
  fn is_enabled(&self) -> bool;
  fn enable(&mut self);
  fn disable(&mut self);
  fn param(&self, p: EffectParam) -> Option<f32>;
  /// Validates, forwards to the render side, then records. Rejected values change nothing.
  fn set_param(&mut self, p: EffectParam, value: f32, link: &GraphLink, now: f64, tau: f64) -> Result<()>;
  /// Splices the unit into the wet path.
  fn attach(&self, link: &GraphLink) -> Result<()>;
  /// Takes the unit out of the wet path.
  fn detach(&self, link: &GraphLink) -> Result<()>;
}

impl EffectUnit {
  pub fn new(kind: EffectKind) -> Self {
    let st = UnitState::defaults(kind);
    match kind {
      EffectKind::Delay => EffectUnit::Delay(DelayUnit(st)),
      EffectKind::Reverb => EffectUnit::Reverb(ReverbUnit(st)),
      EffectKind::FilterChorus => EffectUnit::FilterChorus(FilterChorusUnit(st)),
      EffectKind::Saturation => EffectUnit::Saturation(SaturationUnit(st)),
    }
  }

  fn state(&self) -> &UnitState {
    match self {
      EffectUnit::Delay(u) => &u.0,
      EffectUnit::Reverb(u) => &u.0,
      EffectUnit::FilterChorus(u) => &u.0,
      EffectUnit::Saturation(u) => &u.0,
    }
  }

  fn state_mut(&mut self) -> &mut UnitState {
    match self {
      EffectUnit::Delay(u) => &mut u.0,
      EffectUnit::Reverb(u) => &mut u.0,
      EffectUnit::FilterChorus(u) => &mut u.0,
      EffectUnit::Saturation(u) => &mut u.0,
    }
  }

  pub fn specs(&self) -> &'static [ParamSpec] { specs_for(self.kind()) }

  pub fn wetness(&self) -> f32 { self.param(EffectParam::Wetness).unwrap_or(0.0) }

  fn position(&self, p: EffectParam) -> Option<usize> { self.specs().iter().position(|s| s.param == p) }
}

impl EffectControl for EffectUnit {
  fn kind(&self) -> EffectKind {
    match self {
      EffectUnit::Delay(_) => EffectKind::Delay,
      EffectUnit::Reverb(_) => EffectKind::Reverb,
      EffectUnit::FilterChorus(_) => EffectKind::FilterChorus,
      EffectUnit::Saturation(_) => EffectKind::Saturation,
    }
  }

  fn is_enabled(&self) -> bool { self.state().enabled }

  fn enable(&mut self) { self.state_mut().enabled = true; }

  fn disable(&mut self) { self.state_mut().enabled = false; }

  fn param(&self, p: EffectParam) -> Option<f32> { self.position(p).map(|i| self.state().values[i]) }

  fn set_param(&mut self, p: EffectParam, value: f32, link: &GraphLink, now: f64, tau: f64) -> Result<()> {
    let kind = self.kind();
    let i = self
      .position(p)
      .ok_or_else(|| EngineError::UnknownParam { effect: kind.name().into(), param: p.name().into() })?;
    let s = self.specs()[i];
    let v = EngineError::check_range(p.name(), value, s.min, s.max)?;
    match (kind, p) {
      (EffectKind::Saturation, EffectParam::Amount) => {
        link.send(GraphMsg::SaturationCurve(saturation_curve(v).into_boxed_slice()))?
      }
      _ => link.send(GraphMsg::EffectParam { kind, param: p, event: ParamEvent::SetTarget { at: now, target: v, tau } })?,
    }
    self.state_mut().values[i] = v;
    Ok(())
  }

  fn attach(&self, link: &GraphLink) -> Result<()> { link.send(GraphMsg::Splice { kind: self.kind(), engaged: true }) }

  fn detach(&self, link: &GraphLink) -> Result<()> { link.send(GraphMsg::Splice { kind: self.kind(), engaged: false }) }
}

/// The four units in fixed series order behind a wet/dry pair of buses.
pub struct EffectChain {
  units: [EffectUnit; 4],
  tau: f64,
  wet: f32,
  dry: f32,
}

impl EffectChain {
  pub fn new(tau: f64) -> Self {
    Self { units: EffectKind::ORDER.map(EffectUnit::new), tau, wet: 0.0, dry: 1.0 }
  }

  pub fn unit(&self, kind: EffectKind) -> &EffectUnit { &self.units[kind.slot()] }

  pub fn wet_level(&self) -> f32 { self.wet }

  pub fn dry_level(&self) -> f32 { self.dry }

  pub fn spliced(&self) -> [bool; 4] { [0, 1, 2, 3].map(|i| self.units[i].is_enabled()) }

  pub fn set_enabled(&mut self, kind: EffectKind, on: bool, link: &GraphLink, now: f64) -> Result<()> {
    let unit = &mut self.units[kind.slot()];
    let was = unit.is_enabled();
    if on { unit.enable(); } else { unit.disable(); }
    if let Err(e) = self.rewire(link, now) {
      let unit = &mut self.units[kind.slot()];
      if was { unit.enable(); } else { unit.disable(); }
      return Err(e);
    }
    log::debug!("{kind} {}", if on { "enabled" } else { "disabled" });
    Ok(())
  }

  pub fn set_param(&mut self, kind: EffectKind, p: EffectParam, value: f32, link: &GraphLink, now: f64) -> Result<()> {
    self.units[kind.slot()].set_param(p, value, link, now, self.tau)?;
    if p == EffectParam::Wetness { self.update_buses(link, now)?; }
    Ok(())
  }

  /// Re-issues every splice point in series order, then the bus levels.
  pub fn rewire(&mut self, link: &GraphLink, now: f64) -> Result<()> {
    for u in &self.units {
      if u.is_enabled() { u.attach(link)?; } else { u.detach(link)?; }
    }
    self.update_buses(link, now)
  }

  fn update_buses(&mut self, link: &GraphLink, now: f64) -> Result<()> {
    let wet = self.units.iter().filter(|u| u.is_enabled()).map(|u| u.wetness()).fold(0.0f32, f32::max);
    let dry = 1.0 - wet * 0.5;
    link.send(GraphMsg::Bus { bus: Bus::Wet, event: ParamEvent::SetTarget { at: now, target: wet, tau: self.tau } })?;
    link.send(GraphMsg::Bus { bus: Bus::Dry, event: ParamEvent::SetTarget { at: now, target: dry, tau: self.tau } })?;
    self.wet = wet;
    self.dry = dry;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_and_aliases_parse() {
    assert_eq!("chorus".parse::<EffectKind>().unwrap(), EffectKind::FilterChorus);
    assert_eq!("Distortion".parse::<EffectKind>().unwrap(), EffectKind::Saturation);
    assert!(matches!("flanger".parse::<EffectKind>(), Err(EngineError::UnknownEffect(_))));
    assert_eq!(EffectParam::parse_for(EffectKind::Delay, "mix").unwrap(), EffectParam::Wetness);
    assert!(matches!(EffectParam::parse_for(EffectKind::Delay, "warp"), Err(EngineError::UnknownParam { .. })));
  }

  #[test]
  fn defaults_follow_tables() {
    let c = EffectChain::new(0.01);
    assert_eq!(c.unit(EffectKind::Delay).param(EffectParam::Time), Some(0.375));
    assert_eq!(c.unit(EffectKind::Saturation).param(EffectParam::Amount), Some(20.0));
    assert_eq!(c.unit(EffectKind::Reverb).param(EffectParam::Time), None);
    assert_eq!(c.spliced(), [false; 4]);
    assert_eq!((c.wet_level(), c.dry_level()), (0.0, 1.0));
  }

  #[test]
  fn wet_is_max_of_enabled_units() {
    let link = GraphLink::detached();
    let mut c = EffectChain::new(0.01);
    c.set_enabled(EffectKind::Delay, true, &link, 0.0).unwrap();
    assert_eq!(c.wet_level(), 0.3);
    c.set_enabled(EffectKind::Saturation, true, &link, 0.0).unwrap();
    assert_eq!(c.wet_level(), 0.5);
    assert_eq!(c.dry_level(), 0.75);
    c.set_param(EffectKind::Delay, EffectParam::Wetness, 0.9, &link, 0.0).unwrap();
    assert_eq!(c.wet_level(), 0.9);
    c.set_enabled(EffectKind::Delay, false, &link, 0.0).unwrap();
    assert_eq!(c.wet_level(), 0.5);
    assert_eq!(c.spliced(), [false, false, false, true]);
  }

  #[test]
  fn rejected_values_leave_state_alone() {
    let link = GraphLink::detached();
    let mut c = EffectChain::new(0.01);
    let err = c.set_param(EffectKind::Delay, EffectParam::Feedback, 1.2, &link, 0.0);
    assert!(matches!(err, Err(EngineError::OutOfRange { .. })));
    assert_eq!(c.unit(EffectKind::Delay).param(EffectParam::Feedback), Some(0.65));
    let err = c.set_param(EffectKind::Reverb, EffectParam::Amount, 3.0, &link, 0.0);
    assert!(matches!(err, Err(EngineError::UnknownParam { .. })));
  }

  #[test]
  fn toggling_sends_splices_in_series_order_then_ramps() {
    let (link, rx) = GraphLink::channel();
    let mut c = EffectChain::new(0.01);
    c.set_enabled(EffectKind::Reverb, true, &link, 1.5).unwrap();
    let msgs: Vec<GraphMsg> = rx.try_iter().collect();
    assert_eq!(msgs.len(), 6);
    let kinds: Vec<(EffectKind, bool)> = msgs
      .iter()
      .filter_map(|m| match m { GraphMsg::Splice { kind, engaged } => Some((*kind, *engaged)), _ => None })
      .collect();
    assert_eq!(kinds, vec![
      (EffectKind::Delay, false),
      (EffectKind::Reverb, true),
      (EffectKind::FilterChorus, false),
      (EffectKind::Saturation, false),
    ]);
    match &msgs[4] {
      GraphMsg::Bus { bus: Bus::Wet, event: ParamEvent::SetTarget { at, target, .. } } => {
        assert_eq!(*at, 1.5);
        assert_eq!(*target, 0.3);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn amount_change_ships_a_new_curve() {
    let (link, rx) = GraphLink::channel();
    let mut c = EffectChain::new(0.01);
    c.set_param(EffectKind::Saturation, EffectParam::Amount, 60.0, &link, 0.0).unwrap();
    assert!(matches!(rx.try_recv(), Ok(GraphMsg::SaturationCurve(_))));
  }

  #[test]
  fn failed_rewire_restores_flag() {
    let (link, rx) = GraphLink::channel();
    drop(rx);
    let mut c = EffectChain::new(0.01);
    assert!(c.set_enabled(EffectKind::Delay, true, &link, 0.0).is_err());
    assert!(!c.unit(EffectKind::Delay).is_enabled());
  }
}
