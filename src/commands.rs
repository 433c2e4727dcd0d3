//! The command boundary: UI-facing commands as serde values.
//!
//! Every error stops here. A rejected command is logged and leaves the
//! engine as it was; callers never see a failure.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::engine::core::Engine;
use crate::engine::dsp::osc::Waveform;
use crate::engine::effects::{EffectKind, EffectParam};
use crate::engine::error::Result;
use crate::engine::sequencer::Scale;
use crate::engine::voice::Instrument;

fn full() -> f32 { 1.0 }

/// `instrument: None` means the currently selected instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
  NoteOn {
    note: u8,
    #[serde(default)]
    instrument: Option<Instrument>,
    #[serde(default = "full")]
    velocity: f32,
  },
  NoteOff {
    note: u8,
    #[serde(default)]
    instrument: Option<Instrument>,
    #[serde(default)]
    force: bool,
  },
  SetInstrument { instrument: Instrument },
  SetAdsr {
    #[serde(default)]
    instrument: Option<Instrument>,
    attack: f32,
    decay: f32,
    sustain: f32,
    release: f32,
  },
  SetWaveform {
    #[serde(default)]
    instrument: Option<Instrument>,
    waveform: Waveform,
  },
  SetInstrumentVolume {
    #[serde(default)]
    instrument: Option<Instrument>,
    volume: f32,
  },
  SetEffectEnabled { effect: String, enabled: bool },
  SetEffectParam { effect: String, param: String, value: f32 },
  ToggleArpeggiator {
    #[serde(default)]
    instrument: Option<Instrument>,
    enabled: bool,
    #[serde(default)]
    hold: bool,
  },
  AddArpNote {
    #[serde(default)]
    instrument: Option<Instrument>,
    note: u8,
  },
  RemoveArpNote {
    #[serde(default)]
    instrument: Option<Instrument>,
    note: u8,
  },
  SetTempo { bpm: f32 },
  StartPlayback,
  StopPlayback,
  ToggleStep {
    #[serde(default)]
    pattern: u32,
    #[serde(default)]
    instrument: Option<Instrument>,
    row: usize,
    step: usize,
    #[serde(default = "full")]
    velocity: f32,
  },
  /// `instrument: None` clears every track of the pattern.
  ClearPattern {
    #[serde(default)]
    pattern: u32,
    #[serde(default)]
    instrument: Option<Instrument>,
  },
  RandomizePattern {
    #[serde(default)]
    pattern: u32,
    #[serde(default)]
    instrument: Option<Instrument>,
  },
  SelectPattern { pattern: u32 },
  /// Grids and mixer settings of `from` replace pattern `to`.
  CopyPattern { from: u32, to: u32 },
  SetScale { scale: Scale },
  SetTrackVolume { instrument: Instrument, volume: f32 },
  SetTrackMuted { instrument: Instrument, muted: bool },
  SetTrackOctave { instrument: Instrument, octave: i32 },
  SetDrumLevel { drum: usize, level: f32 },
  SetDrumTone { tone: f32 },
  Panic,
  ResumeDevice,
  SuspendDevice,
}

pub fn parse(json: &str) -> anyhow::Result<Command> {
  serde_json::from_str(json).with_context(|| format!("bad command: {json}"))
}

/// Applies `cmd`; failures are logged and dropped.
pub fn dispatch(engine: &mut Engine, cmd: Command) {
  let label = format!("{cmd:?}");
  if let Err(e) = apply(engine, cmd) {
    log::warn!("{label} rejected: {e}");
  }
}

fn apply(engine: &mut Engine, cmd: Command) -> Result<()> {
  let cur = engine.current_instrument();
  match cmd {
    Command::NoteOn { note, instrument, velocity } => engine.note_on(note, instrument.unwrap_or(cur), velocity),
    Command::NoteOff { note, instrument, force } => engine.note_off(note, instrument.unwrap_or(cur), force),
    Command::SetInstrument { instrument } => {
      engine.set_instrument(instrument);
      Ok(())
    }
    Command::SetAdsr { instrument, attack, decay, sustain, release } => {
      engine.set_adsr(instrument.unwrap_or(cur), attack, decay, sustain, release)
    }
    Command::SetWaveform { instrument, waveform } => {
      engine.set_waveform(instrument.unwrap_or(cur), waveform);
      Ok(())
    }
    Command::SetInstrumentVolume { instrument, volume } => engine.set_instrument_volume(instrument.unwrap_or(cur), volume),
    Command::SetEffectEnabled { effect, enabled } => engine.set_effect_enabled(effect.parse()?, enabled),
    Command::SetEffectParam { effect, param, value } => {
      let kind: EffectKind = effect.parse()?;
      engine.set_effect_param(kind, EffectParam::parse_for(kind, &param)?, value)
    }
    Command::ToggleArpeggiator { instrument, enabled, hold } => engine.toggle_arpeggiator(instrument.unwrap_or(cur), enabled, hold),
    Command::AddArpNote { instrument, note } => engine.add_arp_note(instrument.unwrap_or(cur), note).map(|_| ()),
    Command::RemoveArpNote { instrument, note } => engine.remove_arp_note(instrument.unwrap_or(cur), note).map(|_| ()),
    Command::SetTempo { bpm } => engine.set_tempo(bpm).map(|_| ()),
    Command::StartPlayback => engine.start_playback(),
    Command::StopPlayback => {
      engine.stop_playback();
      Ok(())
    }
    Command::ToggleStep { pattern, instrument, row, step, velocity } => {
      engine.toggle_step(pattern, instrument.unwrap_or(cur), row, step, velocity).map(|_| ())
    }
    Command::ClearPattern { pattern, instrument } => {
      engine.clear_pattern(pattern, instrument);
      Ok(())
    }
    Command::RandomizePattern { pattern, instrument } => {
      engine.randomize_pattern(pattern, instrument.unwrap_or(cur));
      Ok(())
    }
    Command::SelectPattern { pattern } => {
      engine.select_pattern(pattern);
      Ok(())
    }
    Command::CopyPattern { from, to } => engine.copy_pattern(from, to),
    Command::SetScale { scale } => {
      engine.set_scale(scale);
      Ok(())
    }
    Command::SetTrackVolume { instrument, volume } => engine.set_track_volume(instrument, volume),
    Command::SetTrackMuted { instrument, muted } => {
      engine.set_track_muted(instrument, muted);
      Ok(())
    }
    Command::SetTrackOctave { instrument, octave } => engine.set_track_octave(instrument, octave),
    Command::SetDrumLevel { drum, level } => engine.set_drum_level(drum, level),
    Command::SetDrumTone { tone } => engine.set_drum_tone(tone),
    Command::Panic => {
      engine.panic();
      Ok(())
    }
    Command::ResumeDevice => engine.resume_device(),
    Command::SuspendDevice => engine.suspend_device(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::audio::NullOutput;
  use crate::engine::config::EngineConfig;
  use crate::engine::drums::NoSamples;
  use crate::engine::effects::EffectControl;
  use crate::engine::scheduler::ManualClock;

  fn engine() -> Engine {
    let cfg = EngineConfig::default();
    let sr = cfg.sample_rate;
    Engine::new(cfg, Box::new(NullOutput::new(sr)), Box::new(ManualClock::new()), Box::new(NoSamples)).unwrap()
  }

  #[test]
  fn parses_ui_json() {
    let c = parse(r#"{"cmd":"noteOn","note":60,"instrument":"bass","velocity":0.5}"#).unwrap();
    assert_eq!(c, Command::NoteOn { note: 60, instrument: Some(Instrument::Bass), velocity: 0.5 });
    let c = parse(r#"{"cmd":"noteOn","note":61}"#).unwrap();
    assert_eq!(c, Command::NoteOn { note: 61, instrument: None, velocity: 1.0 });
    let c = parse(r#"{"cmd":"setEffectParam","effect":"chorus","param":"chorusDepth","value":4}"#).unwrap();
    assert!(matches!(c, Command::SetEffectParam { ref effect, .. } if effect == "chorus"));
    assert!(parse(r#"{"cmd":"explode"}"#).is_err());
  }

  #[test]
  fn missing_instrument_uses_the_current_one() {
    let mut e = engine();
    dispatch(&mut e, Command::SetInstrument { instrument: Instrument::Keys });
    dispatch(&mut e, Command::NoteOn { note: 62, instrument: None, velocity: 1.0 });
    assert_eq!(e.voices().keys_for(Instrument::Keys).len(), 1);
  }

  #[test]
  fn rejected_commands_leave_state_alone() {
    let mut e = engine();
    dispatch(&mut e, Command::SetEffectEnabled { effect: "flanger".into(), enabled: true });
    dispatch(&mut e, Command::SetEffectParam { effect: "reverb".into(), param: "time".into(), value: 1.0 });
    dispatch(&mut e, Command::SetEffectParam { effect: "delay".into(), param: "feedback".into(), value: 1.5 });
    dispatch(&mut e, Command::NoteOn { note: 60, instrument: None, velocity: -1.0 });
    assert!(e.effects().spliced().iter().all(|on| !on));
    assert_eq!(e.effects().unit(EffectKind::Delay).param(EffectParam::Feedback), Some(0.65));
    assert_eq!(e.voice_count(), 0);
  }

  #[test]
  fn effect_aliases_resolve() {
    let mut e = engine();
    dispatch(&mut e, Command::SetEffectEnabled { effect: "distortion".into(), enabled: true });
    dispatch(&mut e, Command::SetEffectParam { effect: "filter".into(), param: "cutoff".into(), value: 800.0 });
    assert!(e.effects().unit(EffectKind::Saturation).is_enabled());
    assert_eq!(e.effects().unit(EffectKind::FilterChorus).param(EffectParam::Frequency), Some(800.0));
    assert_eq!(e.effects().wet_level(), 0.5);
  }

  #[test]
  fn pattern_commands() {
    let mut e = engine();
    dispatch(&mut e, Command::ToggleStep { pattern: 2, instrument: Some(Instrument::Drums), row: 0, step: 0, velocity: 1.0 });
    assert_eq!(e.patterns().get(2).map(|p| p.active_count(Instrument::Drums)), Some(1));
    dispatch(&mut e, Command::ClearPattern { pattern: 2, instrument: None });
    assert_eq!(e.patterns().get(2).map(|p| p.active_count(Instrument::Drums)), Some(0));
    dispatch(&mut e, Command::SetTempo { bpm: 999.0 });
    assert_eq!(e.tempo(), 300.0);
  }

  #[test]
  fn copy_and_drum_level_commands() {
    let mut e = engine();
    let c = parse(r#"{"cmd":"copyPattern","from":0,"to":3}"#).unwrap();
    assert_eq!(c, Command::CopyPattern { from: 0, to: 3 });
    dispatch(&mut e, Command::ToggleStep { pattern: 0, instrument: Some(Instrument::Bass), row: 2, step: 5, velocity: 1.0 });
    dispatch(&mut e, Command::SetDrumLevel { drum: 4, level: 0.25 });
    dispatch(&mut e, Command::SetDrumLevel { drum: 4, level: 3.0 });
    dispatch(&mut e, c);
    let copy = e.patterns().get(3).unwrap();
    assert!(copy.cell(Instrument::Bass, 2, 5).active);
    assert_eq!(copy.drum_level(4), 0.25);
    dispatch(&mut e, Command::CopyPattern { from: 7, to: 8 });
    assert!(e.patterns().get(8).is_none());
  }
}
