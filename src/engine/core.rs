//! The engine: owns every subsystem and exposes the command surface.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::arpeggiator::Arpeggiator;
use super::audio::{AudioOutput, CpalOutput, DeviceState, NullOutput};
use super::automation::ParamEvent;
use super::config::EngineConfig;
use super::drums::{fallback_recipe, tone_cutoff_hz, DrumSampleProvider, DRUM_COUNT};
use super::dsp::drum_voice::DrumSynth;
use super::dsp::osc::Waveform;
use super::dsp::sample_player::SamplePlayer;
use super::effects::{EffectChain, EffectKind, EffectParam};
use super::error::{EngineError, Result};
use super::graph::Source;
use super::messages::{Dest, GraphHandle, NodeId, NodeKind, NodeParam};
use super::pool::{NodePool, PoolStats};
use super::scheduler::{Clock, Scheduler, SystemClock, TaskHandle};
use super::sequencer::{Hit, PatternBank, Scale, SequencerClock, NOTE_GATE_MS};
use super::voice::{Adsr, Instrument, InstrumentPreset, Now, NoteKey, StopPlan, VoiceId, VoiceParams, VoiceRegistry};

const TASK_CAPACITY: usize = 4096;
const ARP_VELOCITY: f32 = 0.8;
/// Extra time a drum hit keeps its nodes after the sound has played out.
const DRUM_TAIL_MS: f64 = 50.0;
/// How often a teardown waiting on the audio clock looks again.
const RENDER_RECHECK_MS: f64 = 5.0;

fn no_arp(instrument: Instrument) -> EngineError { EngineError::invalid(format!("{instrument} has no arpeggiator")) }

/// Deferred work, run by [`Engine::poll`].
#[derive(Clone, Debug, PartialEq)]
pub enum Task {
  ArpTick(Instrument),
  SequencerTick,
  GateOff { key: NoteKey, voice: VoiceId },
  RetireVoice(VoiceId),
  ReleaseDrumHit(u64),
  StuckSweep,
}

struct DrumHit { source: NodeId, filter: NodeId, gain: NodeId, ends_at: f64 }

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
  pub device: DeviceState,
  pub sample_rate: f32,
  pub voices: usize,
  pub drum_hits: usize,
  pub gain_pool: PoolStats,
  pub filter_pool: PoolStats,
  pub pending_tasks: usize,
  pub playing: bool,
  pub step: usize,
  pub bpm: f32,
  pub wet: f32,
  pub dry: f32,
}

pub struct Engine {
  config: EngineConfig,
  output: Box<dyn AudioOutput>,
  clock: Box<dyn Clock>,
  drums: Box<dyn DrumSampleProvider>,
  graph: GraphHandle,
  pool: NodePool,
  chain: EffectChain,
  voices: VoiceRegistry,
  presets: BTreeMap<Instrument, InstrumentPreset>,
  current: Instrument,
  arps: BTreeMap<Instrument, Arpeggiator<Task>>,
  seq: SequencerClock<Task>,
  sched: Scheduler<Task>,
  hits: HashMap<u64, DrumHit>,
  next_hit: u64,
  drum_tone: f32,
  rng: StdRng,
}

impl Engine {
  pub fn new(config: EngineConfig, output: Box<dyn AudioOutput>, clock: Box<dyn Clock>, drums: Box<dyn DrumSampleProvider>) -> Result<Self> {
    config.validate()?;
    let mut graph = GraphHandle::new(output.link());
    let mut pool = NodePool::new(config.pool_capacity);
    pool.prepopulate(NodeKind::Gain, config.gain_prepopulate, &mut graph)?;
    pool.prepopulate(NodeKind::Filter, config.filter_prepopulate, &mut graph)?;
    let mut chain = EffectChain::new(config.ramp_tau);
    chain.rewire(graph.link(), output.current_time())?;

    let mut sched = Scheduler::new(TASK_CAPACITY);
    let period = config.stuck_sweep_interval_ms;
    sched.every(clock.now_ms(), period, period, Task::StuckSweep)?;

    let arps = Instrument::MELODIC
      .iter()
      .map(|&i| (i, Arpeggiator::new(i, config.tempo_bpm, Task::ArpTick(i))))
      .collect();
    let seq = SequencerClock::new(config.tempo_bpm, Task::SequencerTick);
    let presets = Instrument::ALL.iter().map(|&i| (i, InstrumentPreset::default_for(i))).collect();
    log::info!("engine ready: {} Hz, device {:?}", output.sample_rate(), output.state());
    Ok(Self {
      config,
      output,
      clock,
      drums,
      graph,
      pool,
      chain,
      voices: VoiceRegistry::new(),
      presets,
      current: Instrument::Synth,
      arps,
      seq,
      sched,
      hits: HashMap::new(),
      next_hit: 0,
      drum_tone: 1.0,
      rng: StdRng::from_entropy(),
    })
  }

  /// Opens the default device, falling back to a silent output when that fails.
  pub fn with_default_device(config: EngineConfig, drums: Box<dyn DrumSampleProvider>) -> Result<Self> {
    let output: Box<dyn AudioOutput> = match CpalOutput::open(&config) {
      Ok(out) => Box::new(out),
      Err(e) => {
        log::warn!("{e}; continuing without audio output");
        Box::new(NullOutput::new(config.sample_rate))
      }
    };
    Self::new(config, output, Box::new(SystemClock::new()), drums)
  }

  pub fn config(&self) -> &EngineConfig { &self.config }

  fn now_ms(&self) -> f64 { self.clock.now_ms() }

  fn stamp(&self) -> Now {
    Now { audio_s: self.output.current_time(), control_ms: self.now_ms(), sr: self.output.sample_rate() }
  }

  /// Suspension is recoverable: try to resume, carry on regardless.
  fn ensure_running(&mut self) {
    if self.output.state() == DeviceState::Suspended {
      if let Err(e) = self.output.resume() { log::warn!("resume failed: {e}"); }
    }
  }

  fn schedule_retire(&mut self, plan: StopPlan) {
    let now = self.now_ms();
    if let Err(e) = self.sched.once(now, plan.retire_in_ms, Task::RetireVoice(plan.voice)) {
      log::warn!("cleanup not scheduled ({e}); retiring voice now");
      self.voices.retire(plan.voice, &mut self.pool, &mut self.graph);
    }
  }

  /// True once the audio at `at` has been rendered. A device that is not
  /// running renders nothing, so there is nothing left to wait for.
  fn rendered_past(&self, at: f64) -> bool {
    self.output.state() != DeviceState::Running || self.output.current_time() >= at
  }

  /// Re-queues a teardown until the audio clock catches up. Returns false
  /// when the task could not be queued and the caller must tear down now.
  fn defer_teardown(&mut self, task: Task) -> bool {
    let now = self.now_ms();
    match self.sched.once(now, RENDER_RECHECK_MS, task) {
      Ok(_) => true,
      Err(e) => {
        log::warn!("teardown recheck not scheduled: {e}");
        false
      }
    }
  }

  fn retire_voice(&mut self, id: VoiceId) {
    let pending = self.voices.silent_at(id).is_some_and(|at| !self.rendered_past(at));
    if pending && self.defer_teardown(Task::RetireVoice(id)) { return; }
    self.voices.retire(id, &mut self.pool, &mut self.graph);
  }

  fn preset(&self, instrument: Instrument) -> InstrumentPreset {
    self.presets.get(&instrument).copied().unwrap_or_else(|| InstrumentPreset::default_for(instrument))
  }

  fn preset_mut(&mut self, instrument: Instrument) -> &mut InstrumentPreset {
    self.presets.entry(instrument).or_insert_with(|| InstrumentPreset::default_for(instrument))
  }

  fn start_voice(&mut self, instrument: Instrument, note: u8, velocity: f32) -> Result<VoiceId> {
    let preset = self.preset(instrument);
    let params = VoiceParams {
      waveform: preset.waveform,
      freq: preset.frequency(note, 0),
      peak: velocity * preset.volume,
      adsr: preset.adsr,
    };
    let now = self.stamp();
    let started = self.voices.start(NoteKey::new(instrument, note), params, now, &mut self.pool, &mut self.graph)?;
    if let Some(plan) = started.replaced { self.schedule_retire(plan); }
    Ok(started.id)
  }

  /// Schedules the note-off for a timed note; stops it right away if that fails.
  fn gate(&mut self, key: NoteKey, voice: VoiceId, after_ms: f64) -> Option<TaskHandle> {
    let now = self.now_ms();
    match self.sched.once(now, after_ms, Task::GateOff { key, voice }) {
      Ok(h) => Some(h),
      Err(e) => {
        log::warn!("gate for {key:?} not scheduled: {e}");
        let audio = self.output.current_time();
        if let Some(plan) = self.voices.stop_voice(voice, true, audio, &self.graph) { self.schedule_retire(plan); }
        None
      }
    }
  }

  fn stop_instrument(&mut self, instrument: Instrument) {
    let audio = self.output.current_time();
    for key in self.voices.keys_for(instrument) {
      if let Some(plan) = self.voices.stop(key, true, audio, &self.graph) { self.schedule_retire(plan); }
    }
  }

  fn stop_all_voices(&mut self) {
    let audio = self.output.current_time();
    for plan in self.voices.stop_all(audio, &self.graph) { self.schedule_retire(plan); }
  }

  // ---- notes ----

  pub fn note_on(&mut self, note: u8, instrument: Instrument, velocity: f32) -> Result<()> {
    let velocity = EngineError::check_range("velocity", velocity, 0.0, 1.0)?;
    self.ensure_running();
    if instrument == Instrument::Drums {
      return self.trigger_drum(note as usize % DRUM_COUNT, velocity);
    }
    self.start_voice(instrument, note, velocity).map(|_| ())
  }

  /// `force` skips the release stage and fades out over 10 ms.
  pub fn note_off(&mut self, note: u8, instrument: Instrument, force: bool) -> Result<()> {
    if instrument == Instrument::Drums { return Ok(()); }
    let audio = self.output.current_time();
    if let Some(plan) = self.voices.stop(NoteKey::new(instrument, note), force, audio, &self.graph) {
      self.schedule_retire(plan);
    }
    Ok(())
  }

  pub fn current_instrument(&self) -> Instrument { self.current }

  pub fn set_instrument(&mut self, instrument: Instrument) {
    self.current = instrument;
    log::debug!("instrument: {instrument}");
  }

  pub fn instrument_preset(&self, instrument: Instrument) -> InstrumentPreset { self.preset(instrument) }

  pub fn set_adsr(&mut self, instrument: Instrument, attack: f32, decay: f32, sustain: f32, release: f32) -> Result<()> {
    let adsr = Adsr { attack, decay, sustain, release }.validated()?;
    self.preset_mut(instrument).adsr = adsr;
    Ok(())
  }

  pub fn set_waveform(&mut self, instrument: Instrument, waveform: Waveform) { self.preset_mut(instrument).waveform = waveform; }

  pub fn set_instrument_volume(&mut self, instrument: Instrument, volume: f32) -> Result<()> {
    self.preset_mut(instrument).volume = EngineError::check_range("volume", volume, 0.0, 1.0)?;
    Ok(())
  }

  // ---- drums ----

  pub fn set_drum_tone(&mut self, tone: f32) -> Result<()> {
    self.drum_tone = EngineError::check_range("tone", tone, 0.0, 1.0)?;
    Ok(())
  }

  pub fn set_drum_provider(&mut self, drums: Box<dyn DrumSampleProvider>) { self.drums = drums; }

  /// One-shot drum: sample (or synthesized fallback) → pooled filter → pooled gain → chain.
  fn trigger_drum(&mut self, index: usize, velocity: f32) -> Result<()> {
    let t = self.output.current_time();
    let sr = self.output.sample_rate();
    let (source, secs) = match self.drums.sample_buffer(index) {
      Some(buf) => {
        let p = SamplePlayer::new(buf, sr, 1.0);
        let secs = p.duration_secs(sr);
        (Source::sample(p, t), secs)
      }
      None => {
        let synth = DrumSynth::new(fallback_recipe(index), sr, self.rng.gen());
        let secs = synth.duration_secs();
        (Source::drum(synth, t), secs)
      }
    };
    let source = self.graph.create_source(source)?;
    let filter = match self.pool.acquire(NodeKind::Filter, &mut self.graph) {
      Ok(l) => l.id,
      Err(e) => {
        if let Err(d) = self.graph.destroy(source) { log::warn!("drum source teardown: {d}"); }
        return Err(e);
      }
    };
    let gain = match self.pool.acquire(NodeKind::Gain, &mut self.graph) {
      Ok(l) => l.id,
      Err(e) => {
        if let Err(d) = self.graph.destroy(source) { log::warn!("drum source teardown: {d}"); }
        self.pool.release(filter, &mut self.graph);
        return Err(e);
      }
    };
    let hit = DrumHit { source, filter, gain, ends_at: t + secs as f64 };
    let id = self.next_hit;
    self.next_hit += 1;
    self.hits.insert(id, hit);

    let peak = velocity * self.preset(Instrument::Drums).volume;
    let g = &self.graph;
    let wired = g
      .connect(source, Dest::Node(filter))
      .and_then(|_| g.connect(filter, Dest::Node(gain)))
      .and_then(|_| g.connect(gain, Dest::ChainInput))
      .and_then(|_| g.automate(filter, NodeParam::Frequency, ParamEvent::SetValue { at: t, value: tone_cutoff_hz(self.drum_tone) }))
      .and_then(|_| g.automate(gain, NodeParam::Gain, ParamEvent::SetValue { at: t, value: peak }));
    if let Err(e) = wired {
      self.release_drum_hit(id);
      return Err(e);
    }
    let now = self.now_ms();
    if let Err(e) = self.sched.once(now, secs as f64 * 1000.0 + DRUM_TAIL_MS, Task::ReleaseDrumHit(id)) {
      log::warn!("drum cleanup not scheduled: {e}");
      self.release_drum_hit(id);
    }
    Ok(())
  }

  fn release_drum_hit(&mut self, id: u64) {
    let Some(hit) = self.hits.remove(&id) else { return };
    if let Err(e) = self.graph.destroy(hit.source) { log::warn!("drum source teardown: {e}"); }
    for node in [hit.filter, hit.gain] { self.pool.release(node, &mut self.graph); }
  }

  fn finish_drum_hit(&mut self, id: u64) {
    let pending = self.hits.get(&id).is_some_and(|h| !self.rendered_past(h.ends_at));
    if pending && self.defer_teardown(Task::ReleaseDrumHit(id)) { return; }
    self.release_drum_hit(id);
  }

  // ---- effects ----

  pub fn set_effect_enabled(&mut self, kind: EffectKind, enabled: bool) -> Result<()> {
    let now = self.output.current_time();
    self.chain.set_enabled(kind, enabled, self.graph.link(), now)
  }

  pub fn set_effect_param(&mut self, kind: EffectKind, param: EffectParam, value: f32) -> Result<()> {
    let now = self.output.current_time();
    self.chain.set_param(kind, param, value, self.graph.link(), now)
  }

  pub fn effects(&self) -> &EffectChain { &self.chain }

  // ---- arpeggiator ----

  pub fn arpeggiator(&self, instrument: Instrument) -> Option<&Arpeggiator<Task>> { self.arps.get(&instrument) }

  /// Voices left behind by an arpeggiator that just went idle are cut.
  fn settle_arp(&mut self, instrument: Instrument, was_running: bool) {
    let running = self.arps.get(&instrument).is_some_and(|a| a.is_running());
    if was_running && !running { self.stop_instrument(instrument); }
  }

  pub fn toggle_arpeggiator(&mut self, instrument: Instrument, enabled: bool, hold: bool) -> Result<()> {
    let now = self.now_ms();
    let sched = &mut self.sched;
    let arp = self.arps.get_mut(&instrument).ok_or_else(|| no_arp(instrument))?;
    let was = arp.is_running();
    let res = arp.enable(enabled, hold, sched, now);
    self.settle_arp(instrument, was);
    if !enabled { self.stop_instrument(instrument); }
    res
  }

  pub fn add_arp_note(&mut self, instrument: Instrument, note: u8) -> Result<bool> {
    self.ensure_running();
    let now = self.now_ms();
    let sched = &mut self.sched;
    let arp = self.arps.get_mut(&instrument).ok_or_else(|| no_arp(instrument))?;
    arp.add_note(note, sched, now)
  }

  pub fn remove_arp_note(&mut self, instrument: Instrument, note: u8) -> Result<bool> {
    let now = self.now_ms();
    let sched = &mut self.sched;
    let arp = self.arps.get_mut(&instrument).ok_or_else(|| no_arp(instrument))?;
    let was = arp.is_running();
    let res = arp.remove_note(note, sched, now);
    self.settle_arp(instrument, was);
    res
  }

  // ---- sequencer ----

  /// Returns the tempo actually applied after clamping.
  pub fn set_tempo(&mut self, bpm: f32) -> Result<f32> {
    let now = self.now_ms();
    let bpm = self.seq.set_tempo(bpm, &mut self.sched, now)?;
    for arp in self.arps.values_mut() {
      if let Err(e) = arp.set_tempo(bpm, &mut self.sched, now) { log::warn!("arp {}: {e}", arp.instrument()); }
    }
    Ok(bpm)
  }

  pub fn tempo(&self) -> f32 { self.seq.bpm() }

  pub fn start_playback(&mut self) -> Result<()> {
    self.ensure_running();
    let now = self.now_ms();
    self.seq.start(&mut self.sched, now)
  }

  pub fn stop_playback(&mut self) {
    self.seq.stop(&mut self.sched);
    self.stop_all_voices();
    log::info!("sequencer: stopped");
  }

  pub fn is_playing(&self) -> bool { self.seq.is_playing() }

  pub fn current_step(&self) -> usize { self.seq.current_step() }

  pub fn toggle_step(&mut self, pattern: u32, instrument: Instrument, row: usize, step: usize, velocity: f32) -> Result<bool> {
    self.seq.bank.toggle_step(pattern, instrument, row, step, velocity)
  }

  pub fn clear_pattern(&mut self, pattern: u32, instrument: Option<Instrument>) { self.seq.bank.clear(pattern, instrument); }

  pub fn randomize_pattern(&mut self, pattern: u32, instrument: Instrument) -> Option<&'static str> {
    let groove = self.seq.bank.randomize(pattern, instrument, &mut self.rng);
    if let Some(name) = groove { log::debug!("pattern {pattern}: {name} groove"); }
    groove
  }

  pub fn select_pattern(&mut self, pattern: u32) { self.seq.select_pattern(pattern); }

  pub fn copy_pattern(&mut self, from: u32, to: u32) -> Result<()> { self.seq.bank.copy(from, to) }

  pub fn set_scale(&mut self, scale: Scale) { self.seq.set_scale(scale); }

  pub fn set_track_volume(&mut self, instrument: Instrument, volume: f32) -> Result<()> { self.seq.set_track_volume(instrument, volume) }

  pub fn set_track_muted(&mut self, instrument: Instrument, muted: bool) { self.seq.set_track_muted(instrument, muted); }

  pub fn set_track_octave(&mut self, instrument: Instrument, octave: i32) -> Result<()> { self.seq.set_track_octave(instrument, octave) }

  /// Level of one drum voice in the selected pattern.
  pub fn set_drum_level(&mut self, drum: usize, level: f32) -> Result<()> { self.seq.set_drum_level(drum, level) }

  pub fn patterns(&self) -> &PatternBank { &self.seq.bank }

  pub fn replace_patterns(&mut self, bank: PatternBank) { self.seq.bank = bank; }

  // ---- lifecycle ----

  /// Cancels every timer of every feature and cuts all sound.
  pub fn panic(&mut self) {
    self.seq.stop(&mut self.sched);
    for arp in self.arps.values_mut() {
      let hold = arp.is_hold();
      if let Err(e) = arp.enable(false, hold, &mut self.sched, 0.0) { log::warn!("arp {}: {e}", arp.instrument()); }
    }
    self.stop_all_voices();
    let hits: Vec<u64> = self.hits.keys().copied().collect();
    for id in hits { self.release_drum_hit(id); }
    log::warn!("panic: all voices stopped");
  }

  /// Drops the pool's idle nodes. Leased nodes are untouched.
  pub fn release_idle_nodes(&mut self) { self.pool.cleanup(&mut self.graph); }

  pub fn resume_device(&mut self) -> Result<()> { self.output.resume() }

  pub fn suspend_device(&mut self) -> Result<()> { self.output.suspend() }

  pub fn device_state(&self) -> DeviceState { self.output.state() }

  pub fn voice_count(&self) -> usize { self.voices.len() }

  pub fn voices(&self) -> &VoiceRegistry { &self.voices }

  pub fn stats(&self) -> EngineStats {
    EngineStats {
      device: self.output.state(),
      sample_rate: self.output.sample_rate(),
      voices: self.voices.len(),
      drum_hits: self.hits.len(),
      gain_pool: self.pool.stats(NodeKind::Gain),
      filter_pool: self.pool.stats(NodeKind::Filter),
      pending_tasks: self.sched.len(),
      playing: self.seq.is_playing(),
      step: self.seq.current_step(),
      bpm: self.seq.bpm(),
      wet: self.chain.wet_level(),
      dry: self.chain.dry_level(),
    }
  }

  /// Time until the next task is due, if any.
  pub fn next_due_in(&self) -> Option<Duration> {
    let due = self.sched.next_due()?;
    Some(Duration::from_secs_f64(((due - self.now_ms()) / 1000.0).max(0.0)))
  }

  /// Runs every task that is due. Returns how many ran.
  pub fn poll(&mut self) -> usize {
    self.graph.link().collect_garbage();
    let now = self.now_ms();
    let due = self.sched.poll(now);
    let n = due.len();
    for (handle, task) in due { self.run(handle, task); }
    n
  }

  fn run(&mut self, handle: TaskHandle, task: Task) {
    match task {
      Task::ArpTick(instrument) => self.arp_tick(instrument),
      Task::SequencerTick => self.sequencer_tick(),
      Task::GateOff { key, voice } => {
        if let Some(arp) = self.arps.get_mut(&key.instrument) { arp.forget_gate(handle); }
        if self.voices.voice_for(key) == Some(voice) {
          let audio = self.output.current_time();
          if let Some(plan) = self.voices.stop(key, false, audio, &self.graph) { self.schedule_retire(plan); }
        }
      }
      Task::RetireVoice(id) => self.retire_voice(id),
      Task::ReleaseDrumHit(id) => self.finish_drum_hit(id),
      Task::StuckSweep => self.sweep(),
    }
  }

  fn arp_tick(&mut self, instrument: Instrument) {
    let Some(arp) = self.arps.get_mut(&instrument) else { return };
    let Some(note) = arp.next_note() else { return };
    let gate_ms = arp.gate_ms();
    match self.start_voice(instrument, note, ARP_VELOCITY) {
      Ok(voice) => {
        if let Some(h) = self.gate(NoteKey::new(instrument, note), voice, gate_ms) {
          if let Some(arp) = self.arps.get_mut(&instrument) { arp.track_gate(h); }
        }
      }
      Err(e) => log::warn!("arp {instrument} tick: {e}"),
    }
  }

  fn sequencer_tick(&mut self) {
    for trig in self.seq.tick() {
      let res = match trig.hit {
        Hit::Note(note) => self.start_voice(trig.instrument, note, trig.velocity).map(|voice| {
          self.gate(NoteKey::new(trig.instrument, note), voice, NOTE_GATE_MS);
        }),
        Hit::Drum(index) => self.trigger_drum(index, trig.velocity),
      };
      if let Err(e) = res { log::warn!("step trigger {:?}: {e}", trig.instrument); }
    }
  }

  /// Force-stops voices that outlived the ceiling; skipped while the device is not running.
  fn sweep(&mut self) {
    if self.output.state() != DeviceState::Running {
      log::debug!("sweep skipped: device {:?}", self.output.state());
      return;
    }
    let now = self.now_ms();
    let stale = self.voices.stale(now, self.config.stuck_voice_ceiling_ms);
    if stale.is_empty() { return; }
    log::warn!("sweep: stopping {} stuck voice(s)", stale.len());
    let audio = self.output.current_time();
    for id in stale {
      if let Some(plan) = self.voices.stop_voice(id, true, audio, &self.graph) { self.schedule_retire(plan); }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::audio::{offline, OfflineRender};
  use crate::engine::drums::{NoSamples, SampleBuffer, SampleKit};
  use crate::engine::effects::EffectControl;
  use crate::engine::scheduler::ManualClock;
  use std::sync::Arc;

  fn cfg() -> EngineConfig {
    let mut c = EngineConfig { sample_rate: 8000.0, ..EngineConfig::default() };
    c.reverb.length_secs = 0.5;
    c
  }

  fn engine() -> (Engine, ManualClock, OfflineRender) {
    let config = cfg();
    let (out, render) = offline(&config);
    let clock = ManualClock::new();
    let e = Engine::new(config, Box::new(out), Box::new(clock.clone()), Box::new(NoSamples)).unwrap();
    (e, clock, render)
  }

  /// Steps control time and rendered audio together, 1 ms at a time.
  fn run_for(e: &mut Engine, clock: &ManualClock, render: &mut OfflineRender, ms: u32) {
    let frames = (e.config().sample_rate / 1000.0) as usize;
    for _ in 0..ms {
      clock.advance(1.0);
      render.render(frames);
      e.poll();
    }
  }

  #[test]
  fn invalid_config_is_rejected() {
    let config = EngineConfig { pool_capacity: 0, ..cfg() };
    let r = Engine::new(config, Box::new(NullOutput::new(8000.0)), Box::new(ManualClock::new()), Box::new(NoSamples));
    assert!(matches!(r, Err(EngineError::InvalidConfig(_))));
  }

  #[test]
  fn note_off_clears_registry_after_release() {
    let (mut e, clock, mut r) = engine();
    e.note_on(60, Instrument::Keys, 1.0).unwrap();
    assert_eq!(e.voice_count(), 1);
    assert_eq!(e.stats().gain_pool.in_use, 1);
    e.note_off(60, Instrument::Keys, false).unwrap();
    // keys release is 0.5 s; cleanup lands 20 ms after it
    run_for(&mut e, &clock, &mut r, 500);
    assert_eq!(e.voice_count(), 1);
    run_for(&mut e, &clock, &mut r, 30);
    assert_eq!(e.voice_count(), 0);
    let g = e.stats().gain_pool;
    assert_eq!(g.in_use, 0);
    assert_eq!(g.available + g.discarded, g.constructed);
  }

  #[test]
  fn retrigger_keeps_one_voice_per_note() {
    let (mut e, clock, mut r) = engine();
    e.note_on(64, Instrument::Synth, 0.9).unwrap();
    e.note_on(64, Instrument::Synth, 0.9).unwrap();
    let key = NoteKey::new(Instrument::Synth, 64);
    assert!(e.voices().is_sounding(key));
    run_for(&mut e, &clock, &mut r, 25);
    assert_eq!(e.voice_count(), 1);
  }

  #[test]
  fn bad_values_change_nothing() {
    let (mut e, _clock, _r) = engine();
    assert!(e.note_on(60, Instrument::Synth, 1.5).is_err());
    assert_eq!(e.voice_count(), 0);
    assert!(e.set_effect_param(EffectKind::Delay, EffectParam::Time, 9.0).is_err());
    assert_eq!(e.effects().unit(EffectKind::Delay).param(EffectParam::Time), Some(0.375));
    assert!(e.set_adsr(Instrument::Synth, 0.1, 0.1, 2.0, 0.1).is_err());
    assert_eq!(e.instrument_preset(Instrument::Synth).adsr.sustain, 0.5);
    assert!(e.toggle_arpeggiator(Instrument::Drums, true, false).is_err());
  }

  #[test]
  fn sequencer_plays_and_stops_cleanly() {
    let (mut e, clock, mut r) = engine();
    e.toggle_step(0, Instrument::Synth, 7, 0, 1.0).unwrap();
    e.toggle_step(0, Instrument::Drums, 0, 4, 1.0).unwrap();
    e.start_playback().unwrap();
    e.poll();
    assert_eq!(e.current_step(), 1);
    assert_eq!(e.voice_count(), 1);
    run_for(&mut e, &clock, &mut r, 500);
    assert_eq!(e.current_step(), 5);
    assert_eq!(e.stats().filter_pool.in_use, 1);
    e.stop_playback();
    assert_eq!(e.current_step(), 0);
    assert!(!e.is_playing());
    run_for(&mut e, &clock, &mut r, 2000);
    assert_eq!(e.voice_count(), 0);
    assert_eq!(e.stats().drum_hits, 0);
    assert_eq!(e.stats().filter_pool.in_use, 0);
  }

  #[test]
  fn tempo_change_keeps_the_step() {
    let (mut e, clock, mut r) = engine();
    e.start_playback().unwrap();
    e.poll();
    run_for(&mut e, &clock, &mut r, 260);
    let step = e.current_step();
    assert_eq!(e.set_tempo(60.0).unwrap(), 60.0);
    assert_eq!(e.current_step(), step);
    assert_eq!(e.arpeggiator(Instrument::Synth).map(|a| a.interval_ms()), Some(250.0));
  }

  #[test]
  fn arpeggiator_cycles_voices() {
    let (mut e, clock, mut r) = engine();
    e.toggle_arpeggiator(Instrument::Synth, true, false).unwrap();
    assert!(e.add_arp_note(Instrument::Synth, 60).unwrap());
    assert!(e.add_arp_note(Instrument::Synth, 67).unwrap());
    e.poll();
    assert!(e.voices().is_sounding(NoteKey::new(Instrument::Synth, 60)));
    run_for(&mut e, &clock, &mut r, 1000);
    assert!(e.voice_count() <= 3);
    e.remove_arp_note(Instrument::Synth, 60).unwrap();
    e.remove_arp_note(Instrument::Synth, 67).unwrap();
    assert!(!e.arpeggiator(Instrument::Synth).is_some_and(|a| a.is_running()));
    run_for(&mut e, &clock, &mut r, 700);
    assert_eq!(e.voice_count(), 0);
  }

  #[test]
  fn sweep_stops_stuck_voices_only_while_running() {
    let (mut e, clock, mut r) = engine();
    e.note_on(50, Instrument::Bass, 1.0).unwrap();
    e.suspend_device().unwrap();
    run_for(&mut e, &clock, &mut r, 20_100);
    assert_eq!(e.voice_count(), 1);
    e.resume_device().unwrap();
    run_for(&mut e, &clock, &mut r, 20_100);
    assert_eq!(e.voice_count(), 0);
  }

  #[test]
  fn note_on_resumes_a_suspended_device() {
    let (mut e, _clock, _r) = engine();
    e.suspend_device().unwrap();
    e.note_on(60, Instrument::Synth, 0.5).unwrap();
    assert_eq!(e.device_state(), DeviceState::Running);
  }

  #[test]
  fn drum_hits_use_samples_when_available() {
    let config = cfg();
    let (out, mut render) = offline(&config);
    let clock = ManualClock::new();
    let mut kit = SampleKit::new();
    kit.set(1, SampleBuffer::new(Arc::from(vec![0.5f32; 800]), 8000.0));
    let mut e = Engine::new(config, Box::new(out), Box::new(clock.clone()), Box::new(kit)).unwrap();
    e.note_on(1, Instrument::Drums, 1.0).unwrap();
    assert_eq!(e.stats().drum_hits, 1);
    assert_eq!(e.voice_count(), 0);
    let audio = render.render(400);
    assert!(audio.iter().any(|s| s.abs() > 0.01));
    run_for(&mut e, &clock, &mut render, 160);
    assert_eq!(e.stats().drum_hits, 0);
    assert_eq!(e.stats().gain_pool.in_use, 0);
  }

  #[test]
  fn panic_cancels_everything() {
    let (mut e, clock, mut r) = engine();
    e.toggle_step(0, Instrument::Keys, 3, 0, 1.0).unwrap();
    e.start_playback().unwrap();
    e.toggle_arpeggiator(Instrument::Bass, true, true).unwrap();
    e.add_arp_note(Instrument::Bass, 40).unwrap();
    e.note_on(2, Instrument::Drums, 1.0).unwrap();
    e.poll();
    e.panic();
    assert!(!e.is_playing());
    assert_eq!(e.stats().drum_hits, 0);
    run_for(&mut e, &clock, &mut r, 30);
    assert_eq!(e.voice_count(), 0);
    // leftover note-offs and drum cleanups fire as no-ops; then only the sweep is left
    run_for(&mut e, &clock, &mut r, 2000);
    assert_eq!(e.stats().pending_tasks, 1);
    assert_eq!(e.stats().gain_pool.in_use, 0);
  }

  #[test]
  fn silent_output_accepts_every_command() {
    let config = cfg();
    let mut e = Engine::new(config, Box::new(NullOutput::new(8000.0)), Box::new(ManualClock::new()), Box::new(NoSamples)).unwrap();
    e.note_on(60, Instrument::Synth, 1.0).unwrap();
    e.note_off(60, Instrument::Synth, true).unwrap();
    e.set_effect_enabled(EffectKind::Reverb, true).unwrap();
    e.start_playback().unwrap();
    e.stop_playback();
    assert!(e.resume_device().is_err());
    assert_eq!(e.stats().device, DeviceState::Closed);
  }

  #[test]
  fn rendered_note_reaches_the_output() {
    let (mut e, _clock, mut render) = engine();
    e.set_effect_enabled(EffectKind::Delay, true).unwrap();
    e.note_on(69, Instrument::Keys, 1.0).unwrap();
    let audio = render.render(2000);
    let peak = audio.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!(peak > 0.1 && peak < 1.0, "peak {peak}");
    assert_eq!(render.live_sources(), 1);
  }

  #[test]
  fn forced_stop_fade_renders_before_teardown() {
    let (mut e, clock, mut r) = engine();
    e.note_on(69, Instrument::Keys, 1.0).unwrap();
    r.render(1600);
    e.note_off(69, Instrument::Keys, true).unwrap();
    // the control clock runs ahead of the audio callback
    clock.advance(21.0);
    e.poll();
    assert_eq!(e.voice_count(), 1);
    let tail = r.render(80);
    let energy: f32 = tail.iter().map(|s| s * s).sum();
    assert!(energy > 0.0, "fade tail was cut");
    run_for(&mut e, &clock, &mut r, 30);
    assert_eq!(e.voice_count(), 0);
    assert_eq!(e.stats().gain_pool.in_use, 0);
  }

  #[test]
  fn drum_nodes_wait_for_the_hit_to_render() {
    let (mut e, clock, mut r) = engine();
    e.note_on(0, Instrument::Drums, 1.0).unwrap();
    clock.advance(3000.0);
    e.poll();
    assert_eq!(e.stats().drum_hits, 1);
    assert_eq!(e.stats().filter_pool.in_use, 1);
    run_for(&mut e, &clock, &mut r, 3000);
    assert_eq!(e.stats().drum_hits, 0);
    assert_eq!(e.stats().filter_pool.in_use, 0);
  }
}
