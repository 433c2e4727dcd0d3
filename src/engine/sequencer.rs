//! 16-step sequencer: pattern bank, per-track mixer settings and the tempo clock.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::drums::DRUM_COUNT;
use super::error::{EngineError, Result};
use super::scheduler::{Scheduler, TaskHandle};
use super::voice::Instrument;

pub const STEPS: usize = 16;
pub const ROWS: usize = 8;
pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 300.0;
/// Length of a sequenced melodic note.
pub const NOTE_GATE_MS: f64 = 350.0;
const BASE_NOTE: i32 = 60;
const DRUM_SET_STRIDE: usize = 4;
const RANDOM_DENSITY: f64 = 0.4;
const RANDOM_VELOCITY: f32 = 0.8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell { pub active: bool, pub velocity: f32 }

pub type Grid = [[Cell; STEPS]; ROWS];

/// One bank slot: a grid per instrument plus the mixer state saved with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pattern {
  pub tracks: BTreeMap<Instrument, Grid>,
  pub settings: BTreeMap<Instrument, TrackSettings>,
  /// Per-drum level on top of the drum track volume.
  pub drum_levels: Vec<f32>,
}

impl Default for Pattern {
  fn default() -> Self {
    Self {
      tracks: Instrument::ALL.iter().map(|&i| (i, [[Cell::default(); STEPS]; ROWS])).collect(),
      settings: Instrument::ALL.iter().map(|&i| (i, TrackSettings::default_for(i))).collect(),
      drum_levels: vec![1.0; DRUM_COUNT],
    }
  }
}

impl Pattern {
  pub fn track(&self, instrument: Instrument) -> TrackSettings {
    self.settings.get(&instrument).copied().unwrap_or_else(|| TrackSettings::default_for(instrument))
  }

  fn track_mut(&mut self, instrument: Instrument) -> &mut TrackSettings {
    self.settings.entry(instrument).or_insert_with(|| TrackSettings::default_for(instrument))
  }

  pub fn drum_level(&self, drum: usize) -> f32 { self.drum_levels.get(drum).copied().unwrap_or(1.0) }

  pub fn grid(&self, instrument: Instrument) -> Option<&Grid> { self.tracks.get(&instrument) }

  fn grid_mut(&mut self, instrument: Instrument) -> &mut Grid {
    self.tracks.entry(instrument).or_insert([[Cell::default(); STEPS]; ROWS])
  }

  pub fn cell(&self, instrument: Instrument, row: usize, step: usize) -> Cell {
    self.grid(instrument).and_then(|g| g.get(row)).and_then(|r| r.get(step)).copied().unwrap_or_default()
  }

  pub fn active_count(&self, instrument: Instrument) -> usize {
    self.grid(instrument).map(|g| g.iter().flatten().filter(|c| c.active).count()).unwrap_or(0)
  }
}

/// Every stored pattern, keyed by pattern id. Persisted verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternBank { pub patterns: BTreeMap<u32, Pattern> }

impl PatternBank {
  pub fn get(&self, id: u32) -> Option<&Pattern> { self.patterns.get(&id) }

  pub fn entry(&mut self, id: u32) -> &mut Pattern { self.patterns.entry(id).or_default() }

  /// Flips one cell. Turning a cell on stores `velocity`. Returns the new state.
  pub fn toggle_step(&mut self, id: u32, instrument: Instrument, row: usize, step: usize, velocity: f32) -> Result<bool> {
    if row >= ROWS { return Err(EngineError::invalid(format!("row {row} out of 0..{ROWS}"))); }
    if step >= STEPS { return Err(EngineError::invalid(format!("step {step} out of 0..{STEPS}"))); }
    let velocity = EngineError::check_range("velocity", velocity, 0.0, 1.0)?;
    let cell = &mut self.entry(id).grid_mut(instrument)[row][step];
    cell.active = !cell.active;
    if cell.active { cell.velocity = velocity; }
    Ok(cell.active)
  }

  /// Clears one instrument's grid, or every grid. Mixer settings stay.
  pub fn clear(&mut self, id: u32, instrument: Option<Instrument>) {
    let p = self.entry(id);
    match instrument {
      Some(i) => *p.grid_mut(i) = [[Cell::default(); STEPS]; ROWS],
      None => {
        for i in Instrument::ALL { *p.grid_mut(i) = [[Cell::default(); STEPS]; ROWS]; }
      }
    }
  }

  /// Overwrites pattern `to` with a copy of `from`, settings included.
  pub fn copy(&mut self, from: u32, to: u32) -> Result<()> {
    let p = self.get(from).cloned().ok_or_else(|| EngineError::invalid(format!("pattern {from} does not exist")))?;
    self.patterns.insert(to, p);
    Ok(())
  }

  /// Drums get one of the classic grooves; melodic tracks get a sparse random line.
  pub fn randomize(&mut self, id: u32, instrument: Instrument, rng: &mut impl Rng) -> Option<&'static str> {
    let grid = self.entry(id).grid_mut(instrument);
    *grid = [[Cell::default(); STEPS]; ROWS];
    if instrument == Instrument::Drums {
      let groove = &GROOVES[rng.gen_range(0..GROOVES.len())];
      for (row, (hits, velocity)) in groove.rows.iter().zip(GROOVE_VELOCITY).enumerate() {
        for &h in *hits {
          for bar in [0, 8] { grid[row][h + bar] = Cell { active: true, velocity }; }
        }
      }
      return Some(groove.name);
    }
    for step in 0..STEPS {
      if rng.gen_bool(RANDOM_DENSITY) {
        grid[rng.gen_range(0..ROWS)][step] = Cell { active: true, velocity: RANDOM_VELOCITY };
      }
    }
    None
  }
}

struct Groove { name: &'static str, rows: [&'static [usize]; 4] }

// kick, snare, closed hat, second hat over one 8-step bar
static GROOVES: [Groove; 5] = [
  Groove { name: "rock", rows: [&[0, 4], &[2, 6], &[0, 1, 2, 3, 4, 5, 6, 7], &[1, 3, 5, 7]] },
  Groove { name: "funk", rows: [&[0, 3, 6], &[2, 6], &[1, 4, 5, 7], &[0, 2, 4, 6]] },
  Groove { name: "disco", rows: [&[0, 2, 4, 6], &[2, 6], &[1, 3, 5, 7], &[0, 1, 2, 3, 4, 5, 6, 7]] },
  Groove { name: "breakbeat", rows: [&[0, 5], &[2, 3, 6], &[1, 4, 7], &[0, 2, 4, 6]] },
  Groove { name: "latin", rows: [&[0, 3, 5], &[2, 7], &[0, 1, 3, 4, 6, 7], &[1, 2, 5, 6]] },
];
const GROOVE_VELOCITY: [f32; 4] = [1.0, 0.9, 0.7, 0.6];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale { #[default] Major, Minor }

impl Scale {
  pub fn intervals(self) -> [i32; 7] {
    match self {
      Scale::Major => [0, 2, 4, 5, 7, 9, 11],
      Scale::Minor => [0, 2, 3, 5, 7, 8, 10],
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSettings { pub volume: f32, pub muted: bool, pub octave: i32 }

impl TrackSettings {
  pub fn default_for(instrument: Instrument) -> Self {
    let volume = if instrument == Instrument::Drums { 0.8 } else { 0.6 };
    Self { volume, muted: false, octave: 0 }
  }

  pub fn octave_range(instrument: Instrument) -> (i32, i32) {
    if instrument == Instrument::Drums { (0, 2) } else { (-2, 2) }
  }
}

/// MIDI note for a grid row; row 0 is the top of the grid.
pub fn row_to_note(row: usize, scale: Scale, octave: i32) -> u8 {
  let idx = (ROWS - 1 - row.min(ROWS - 1)) as i32;
  let midi = BASE_NOTE + 12 * (idx / 7 + octave) + scale.intervals()[(idx % 7) as usize];
  midi.clamp(0, 127) as u8
}

/// Drum voice for a grid row; the drum track's octave selects the set.
pub fn row_to_drum(row: usize, set: i32) -> usize { (row + DRUM_SET_STRIDE * set.max(0) as usize) % DRUM_COUNT }

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Hit { Note(u8), Drum(usize) }

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepTrigger { pub instrument: Instrument, pub hit: Hit, pub velocity: f32 }

pub fn period_ms(bpm: f32) -> f64 { 60_000.0 / (bpm as f64 * 4.0) }

pub struct SequencerClock<T> {
  bpm: f32,
  step: usize,
  tick: Option<TaskHandle>,
  tick_task: T,
  pub bank: PatternBank,
  current: u32,
  scale: Scale,
}

impl<T: Clone> SequencerClock<T> {
  pub fn new(bpm: f32, tick_task: T) -> Self {
    Self {
      bpm: bpm.clamp(MIN_BPM, MAX_BPM),
      step: 0,
      tick: None,
      tick_task,
      bank: PatternBank::default(),
      current: 0,
      scale: Scale::default(),
    }
  }

  pub fn bpm(&self) -> f32 { self.bpm }
  pub fn current_step(&self) -> usize { self.step }
  pub fn is_playing(&self) -> bool { self.tick.is_some() }
  pub fn period_ms(&self) -> f64 { period_ms(self.bpm) }
  pub fn current_pattern(&self) -> u32 { self.current }
  pub fn scale(&self) -> Scale { self.scale }
  pub fn set_scale(&mut self, scale: Scale) { self.scale = scale; }

  pub fn select_pattern(&mut self, id: u32) {
    self.bank.entry(id);
    self.current = id;
  }

  /// Track settings of the selected pattern.
  pub fn track(&self, instrument: Instrument) -> TrackSettings {
    self.bank.get(self.current).map(|p| p.track(instrument)).unwrap_or_else(|| TrackSettings::default_for(instrument))
  }

  fn track_mut(&mut self, instrument: Instrument) -> &mut TrackSettings {
    let id = self.current;
    self.bank.entry(id).track_mut(instrument)
  }

  pub fn drum_level(&self, drum: usize) -> f32 { self.bank.get(self.current).map_or(1.0, |p| p.drum_level(drum)) }

  pub fn set_drum_level(&mut self, drum: usize, level: f32) -> Result<()> {
    if drum >= DRUM_COUNT { return Err(EngineError::invalid(format!("drum {drum} out of 0..{DRUM_COUNT}"))); }
    let level = EngineError::check_range("level", level, 0.0, 1.0)?;
    let id = self.current;
    let levels = &mut self.bank.entry(id).drum_levels;
    if levels.len() < DRUM_COUNT { levels.resize(DRUM_COUNT, 1.0); }
    levels[drum] = level;
    Ok(())
  }

  pub fn set_track_volume(&mut self, instrument: Instrument, volume: f32) -> Result<()> {
    self.track_mut(instrument).volume = EngineError::check_range("volume", volume, 0.0, 1.0)?;
    Ok(())
  }

  pub fn set_track_muted(&mut self, instrument: Instrument, muted: bool) { self.track_mut(instrument).muted = muted; }

  pub fn set_track_octave(&mut self, instrument: Instrument, octave: i32) -> Result<()> {
    let (lo, hi) = TrackSettings::octave_range(instrument);
    if !(lo..=hi).contains(&octave) {
      return Err(EngineError::invalid(format!("{instrument} octave {octave} outside {lo}..={hi}")));
    }
    self.track_mut(instrument).octave = octave;
    Ok(())
  }

  /// Starts playback; the first tick is due immediately.
  pub fn start(&mut self, sched: &mut Scheduler<T>, now: f64) -> Result<()> {
    if self.tick.is_some() { return Ok(()); }
    self.tick = Some(sched.every(now, 0.0, self.period_ms(), self.tick_task.clone())?);
    log::info!("sequencer: playing at {} bpm", self.bpm);
    Ok(())
  }

  pub fn stop(&mut self, sched: &mut Scheduler<T>) {
    if let Some(h) = self.tick.take() { sched.cancel(h); }
    self.step = 0;
  }

  /// Clamps to 40..=300 bpm. A running clock restarts one period from now
  /// and keeps its step. If the restart fails playback is stopped.
  pub fn set_tempo(&mut self, bpm: f32, sched: &mut Scheduler<T>, now: f64) -> Result<f32> {
    if !bpm.is_finite() { return Err(EngineError::invalid(format!("tempo {bpm}"))); }
    self.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
    if let Some(h) = self.tick.take() {
      sched.cancel(h);
      let p = self.period_ms();
      match sched.every(now, p, p, self.tick_task.clone()) {
        Ok(h) => self.tick = Some(h),
        Err(e) => {
          log::error!("sequencer: tick not rescheduled, stopping: {e}");
          self.step = 0;
          return Err(EngineError::from(e));
        }
      }
    }
    Ok(self.bpm)
  }

  /// Everything the current step triggers; then the step advances.
  pub fn tick(&mut self) -> Vec<StepTrigger> {
    let step = self.step;
    let mut out = Vec::new();
    if let Some(pattern) = self.bank.get(self.current) {
      for instrument in Instrument::ALL {
        let track = pattern.track(instrument);
        if track.muted { continue; }
        for row in 0..ROWS {
          let cell = pattern.cell(instrument, row, step);
          if !cell.active { continue; }
          let (hit, level) = if instrument.is_melodic() {
            (Hit::Note(row_to_note(row, self.scale, track.octave)), 1.0)
          } else {
            let drum = row_to_drum(row, track.octave);
            (Hit::Drum(drum), pattern.drum_level(drum))
          };
          out.push(StepTrigger { instrument, hit, velocity: cell.velocity * track.volume * level });
        }
      }
    }
    self.step = (step + 1) % STEPS;
    out
  }
}
