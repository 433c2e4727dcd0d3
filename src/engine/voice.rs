//! Instrument presets and the registry of sounding voices.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::automation::ParamEvent;
use super::dsp::osc::{midi_to_freq, Waveform};
use super::error::{EngineError, Result};
use super::graph::Source;
use super::messages::{Dest, GraphHandle, NodeId, NodeKind, NodeParam};
use super::pool::NodePool;

/// Fade used for every immediate stop.
pub const FORCE_FADE_SECS: f64 = 0.01;
/// Gap between the end of a fade and the oscillator stop / cleanup.
const STOP_PAD_SECS: f64 = 0.01;
const MAX_STAGE_SECS: f32 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument { Synth, Bass, Keys, Drums }

impl Instrument {
  pub const ALL: [Instrument; 4] = [Instrument::Synth, Instrument::Bass, Instrument::Keys, Instrument::Drums];
  pub const MELODIC: [Instrument; 3] = [Instrument::Synth, Instrument::Bass, Instrument::Keys];

  pub fn is_melodic(self) -> bool { self != Instrument::Drums }

  pub fn name(self) -> &'static str {
    match self {
      Instrument::Synth => "synth",
      Instrument::Bass => "bass",
      Instrument::Keys => "keys",
      Instrument::Drums => "drums",
    }
  }
}

impl fmt::Display for Instrument {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adsr { pub attack: f32, pub decay: f32, pub sustain: f32, pub release: f32 }

impl Adsr {
  pub fn validated(self) -> Result<Self> {
    Ok(Self {
      attack: EngineError::check_range("attack", self.attack, 0.0, MAX_STAGE_SECS)?,
      decay: EngineError::check_range("decay", self.decay, 0.0, MAX_STAGE_SECS)?,
      sustain: EngineError::check_range("sustain", self.sustain, 0.0, 1.0)?,
      release: EngineError::check_range("release", self.release, 0.0, MAX_STAGE_SECS)?,
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentPreset {
  pub waveform: Waveform,
  pub octave: i32,
  pub adsr: Adsr,
  pub volume: f32,
}

impl InstrumentPreset {
  pub fn default_for(instrument: Instrument) -> Self {
    let (waveform, octave, attack, decay, sustain, release, volume) = match instrument {
      Instrument::Synth => (Waveform::Square, 0, 0.1, 0.2, 0.5, 0.5, 0.6),
      Instrument::Bass => (Waveform::Sawtooth, -1, 0.05, 0.1, 0.5, 0.3, 0.6),
      Instrument::Keys => (Waveform::Sine, 0, 0.02, 0.1, 0.5, 0.5, 0.6),
      Instrument::Drums => (Waveform::Square, 0, 0.01, 0.1, 0.0, 0.1, 1.0),
    };
    Self { waveform, octave, adsr: Adsr { attack, decay, sustain, release }, volume }
  }

  /// Frequency of `note` after the preset's octave shift (plus any extra shift).
  pub fn frequency(&self, note: u8, extra_octaves: i32) -> f32 {
    midi_to_freq(note as f32 + 12.0 * (self.octave + extra_octaves) as f32)
  }
}

/// Identity of a sounding note.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NoteKey { pub instrument: Instrument, pub note: u8 }

impl NoteKey {
  pub fn new(instrument: Instrument, note: u8) -> Self { Self { instrument, note } }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase { Sounding, Releasing, Stopping }

#[derive(Debug)]
pub struct Voice {
  pub key: NoteKey,
  pub osc: NodeId,
  pub gain: NodeId,
  pub started_ms: f64,
  pub phase: Phase,
  release: f32,
  // audio time by which the fade and source stop have played out
  silent_at: Option<f64>,
}

/// What a note-on needs beyond the pitch.
#[derive(Clone, Copy, Debug)]
pub struct VoiceParams { pub waveform: Waveform, pub freq: f32, pub peak: f32, pub adsr: Adsr }

/// Voice teardown still to be finished: retire `voice` after `retire_in_ms`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StopPlan { pub voice: VoiceId, pub retire_in_ms: f64 }

#[derive(Debug)]
pub struct Started { pub id: VoiceId, pub replaced: Option<StopPlan> }

/// Audio-clock and control-clock readings taken together.
#[derive(Clone, Copy, Debug)]
pub struct Now { pub audio_s: f64, pub control_ms: f64, pub sr: f32 }

#[derive(Default)]
pub struct VoiceRegistry {
  by_key: HashMap<NoteKey, VoiceId>,
  voices: BTreeMap<VoiceId, Voice>,
  next: u64,
}

impl VoiceRegistry {
  pub fn new() -> Self { Self::default() }

  pub fn len(&self) -> usize { self.voices.len() }

  pub fn is_empty(&self) -> bool { self.voices.is_empty() }

  pub fn get(&self, id: VoiceId) -> Option<&Voice> { self.voices.get(&id) }

  pub fn voice_for(&self, key: NoteKey) -> Option<VoiceId> { self.by_key.get(&key).copied() }

  pub fn is_sounding(&self, key: NoteKey) -> bool {
    self.voice_for(key).and_then(|id| self.voices.get(&id)).is_some_and(|v| v.phase == Phase::Sounding)
  }

  /// Starts a voice for `key`, force-stopping whatever held it first. If the
  /// new voice cannot be built the replaced one is retired on the spot.
  pub fn start(&mut self, key: NoteKey, p: VoiceParams, now: Now, pool: &mut NodePool, graph: &mut GraphHandle) -> Result<Started> {
    let replaced = match self.by_key.remove(&key) {
      Some(old) => self.stop_voice(old, true, now.audio_s, graph),
      None => None,
    };
    let (osc, gain) = match build_nodes(p, now, pool, graph) {
      Ok(nodes) => nodes,
      Err(e) => {
        if let Some(plan) = replaced { self.retire(plan.voice, pool, graph); }
        return Err(e);
      }
    };
    let id = VoiceId(self.next);
    self.next += 1;
    self.voices.insert(id, Voice { key, osc, gain, started_ms: now.control_ms, phase: Phase::Sounding, release: p.adsr.release, silent_at: None });
    self.by_key.insert(key, id);
    Ok(Started { id, replaced })
  }

  /// Begins the fade-out of the voice held by `key`.
  pub fn stop(&mut self, key: NoteKey, force: bool, audio_now: f64, graph: &GraphHandle) -> Option<StopPlan> {
    let id = self.voice_for(key)?;
    self.stop_voice(id, force, audio_now, graph)
  }

  /// Schedules the fade and oscillator stop. A voice already fading is left
  /// alone unless a forced stop overtakes a release. Graph errors are logged;
  /// the returned plan still retires the voice.
  pub fn stop_voice(&mut self, id: VoiceId, force: bool, audio_now: f64, graph: &GraphHandle) -> Option<StopPlan> {
    let v = self.voices.get_mut(&id)?;
    let immediate = force || v.release <= 0.0;
    match (v.phase, immediate) {
      (Phase::Stopping, _) | (Phase::Releasing, false) => return None,
      _ => {}
    }
    let (fade, stop_at, retire) = if immediate {
      (FORCE_FADE_SECS, FORCE_FADE_SECS, FORCE_FADE_SECS + STOP_PAD_SECS)
    } else {
      let r = v.release as f64;
      (r, r + STOP_PAD_SECS, r + 2.0 * STOP_PAD_SECS)
    };
    v.phase = if immediate { Phase::Stopping } else { Phase::Releasing };
    v.silent_at = Some(audio_now + stop_at);
    let sent = graph
      .automate(v.gain, NodeParam::Gain, ParamEvent::CancelAndHold)
      .and_then(|_| graph.automate(v.gain, NodeParam::Gain, ParamEvent::LinearRamp { end: audio_now + fade, value: 0.0 }))
      .and_then(|_| graph.stop_source(v.osc, audio_now + stop_at));
    if let Err(e) = sent { log::warn!("voice {:?} stop: {e}", v.key); }
    Some(StopPlan { voice: id, retire_in_ms: retire * 1000.0 })
  }

  /// Final teardown: drops the oscillator, returns the gain node and forgets
  /// the voice. Idempotent.
  pub fn retire(&mut self, id: VoiceId, pool: &mut NodePool, graph: &mut GraphHandle) -> bool {
    let Some(v) = self.voices.remove(&id) else { return false };
    if self.by_key.get(&v.key) == Some(&id) { self.by_key.remove(&v.key); }
    if let Err(e) = graph.destroy(v.osc) { log::warn!("voice {:?} osc teardown: {e}", v.key); }
    pool.release(v.gain, graph);
    true
  }

  /// Audio time after which a stopped voice can be torn down without a click.
  pub fn silent_at(&self, id: VoiceId) -> Option<f64> { self.voices.get(&id).and_then(|v| v.silent_at) }

  /// Voices started at or before `now_ms - ceiling_ms`.
  pub fn stale(&self, now_ms: f64, ceiling_ms: f64) -> Vec<VoiceId> {
    self.voices.iter().filter(|(_, v)| now_ms - v.started_ms >= ceiling_ms).map(|(id, _)| *id).collect()
  }

  pub fn keys_for(&self, instrument: Instrument) -> Vec<NoteKey> {
    let mut keys: Vec<NoteKey> = self.by_key.keys().filter(|k| k.instrument == instrument).copied().collect();
    keys.sort();
    keys
  }

  pub fn ids(&self) -> Vec<VoiceId> { self.voices.keys().copied().collect() }

  /// Force-stops every voice, returning the teardown plans.
  pub fn stop_all(&mut self, audio_now: f64, graph: &GraphHandle) -> Vec<StopPlan> {
    self.ids().into_iter().filter_map(|id| self.stop_voice(id, true, audio_now, graph)).collect()
  }
}

/// Oscillator and pooled gain stage for one voice, wired and enveloped.
/// Nothing stays allocated when a step fails.
fn build_nodes(p: VoiceParams, now: Now, pool: &mut NodePool, graph: &mut GraphHandle) -> Result<(NodeId, NodeId)> {
  let t = now.audio_s;
  let osc = graph.create_source(Source::oscillator(p.waveform, p.freq, now.sr, t))?;
  let gain = match pool.acquire(NodeKind::Gain, graph) {
    Ok(lease) => lease.id,
    Err(e) => {
      if let Err(d) = graph.destroy(osc) { log::warn!("voice osc teardown: {d}"); }
      return Err(e);
    }
  };
  let wired = graph
    .connect(osc, Dest::Node(gain))
    .and_then(|_| graph.connect(gain, Dest::ChainInput))
    .and_then(|_| graph.automate(gain, NodeParam::Gain, ParamEvent::SetValue { at: t, value: 0.0 }))
    .and_then(|_| {
      let a = t + p.adsr.attack as f64;
      graph.automate(gain, NodeParam::Gain, ParamEvent::LinearRamp { end: a, value: p.peak })?;
      graph.automate(gain, NodeParam::Gain, ParamEvent::LinearRamp { end: a + p.adsr.decay as f64, value: p.peak * p.adsr.sustain })
    });
  if let Err(e) = wired {
    if let Err(d) = graph.destroy(osc) { log::warn!("voice osc teardown: {d}"); }
    pool.release(gain, graph);
    return Err(e);
  }
  Ok((osc, gain))
}
