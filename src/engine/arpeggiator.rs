//! Per-instrument arpeggiator: replays the held notes in a fixed index pattern
//! on a tempo-derived tick.

use std::collections::VecDeque;

use super::error::{EngineError, Result};
use super::scheduler::{Scheduler, TaskHandle};
use super::voice::Instrument;

pub const MIN_INTERVAL_MS: f64 = 50.0;
const GATE_RATIO: f64 = 0.8;
const KEPT_GATES: usize = 10;

pub fn pattern_for(instrument: Instrument) -> &'static [usize] {
  match instrument {
    Instrument::Synth => &[0, 2, 1, 2],
    Instrument::Bass => &[0, 1, 2, 3],
    Instrument::Keys => &[2, 1, 0, 1],
    Instrument::Drums => &[0],
  }
}

/// Sixteenth-note interval at `bpm`, never shorter than 50 ms.
pub fn interval_ms(bpm: f32) -> f64 { (60_000.0 / bpm.max(1.0) as f64 / 4.0).max(MIN_INTERVAL_MS) }

pub fn gate_ms(bpm: f32) -> f64 { (interval_ms(bpm) * GATE_RATIO).max(MIN_INTERVAL_MS) }

pub struct Arpeggiator<T> {
  instrument: Instrument,
  enabled: bool,
  hold: bool,
  held: Vec<u8>,
  last_held: Vec<u8>,
  pattern: &'static [usize],
  cursor: usize,
  bpm: f32,
  tick: Option<TaskHandle>,
  gates: VecDeque<TaskHandle>,
  tick_task: T,
}

impl<T: Clone> Arpeggiator<T> {
  /// `tick_task` is what gets scheduled for every tick of this arpeggiator.
  pub fn new(instrument: Instrument, bpm: f32, tick_task: T) -> Self {
    Self {
      instrument,
      enabled: false,
      hold: false,
      held: Vec::new(),
      last_held: Vec::new(),
      pattern: pattern_for(instrument),
      cursor: 0,
      bpm,
      tick: None,
      gates: VecDeque::with_capacity(KEPT_GATES + 1),
      tick_task,
    }
  }

  pub fn instrument(&self) -> Instrument { self.instrument }
  pub fn is_enabled(&self) -> bool { self.enabled }
  pub fn is_hold(&self) -> bool { self.hold }
  pub fn is_running(&self) -> bool { self.tick.is_some() }
  pub fn held(&self) -> &[u8] { &self.held }
  pub fn cursor(&self) -> usize { self.cursor }
  pub fn interval_ms(&self) -> f64 { interval_ms(self.bpm) }
  pub fn gate_ms(&self) -> f64 { gate_ms(self.bpm) }

  fn should_run(&self) -> bool {
    self.enabled && (!self.held.is_empty() || (self.hold && !self.last_held.is_empty()))
  }

  /// Starts or stops the tick so it matches the current state. A new tick
  /// first fires after `first_ms`.
  fn sync(&mut self, sched: &mut Scheduler<T>, now: f64, first_ms: f64) -> Result<()> {
    match (self.should_run(), self.tick) {
      (true, None) => {
        match sched.every(now, first_ms, self.interval_ms(), self.tick_task.clone()) {
          Ok(h) => self.tick = Some(h),
          Err(e) => {
            log::error!("arp {}: cannot schedule tick: {e}", self.instrument);
            self.enabled = false;
            return Err(EngineError::from(e));
          }
        }
      }
      (false, Some(_)) => self.halt(sched),
      _ => {}
    }
    Ok(())
  }

  fn halt(&mut self, sched: &mut Scheduler<T>) {
    if let Some(h) = self.tick.take() { sched.cancel(h); }
    for h in self.gates.drain(..) { sched.cancel(h); }
    self.cursor = 0;
  }

  pub fn enable(&mut self, enabled: bool, hold: bool, sched: &mut Scheduler<T>, now: f64) -> Result<()> {
    self.enabled = enabled;
    self.hold = hold;
    if !enabled { self.held.clear(); }
    log::debug!("arp {}: enabled={enabled} hold={hold}", self.instrument);
    self.sync(sched, now, 0.0)
  }

  /// Ignored unless enabled. Returns whether the note was added.
  pub fn add_note(&mut self, note: u8, sched: &mut Scheduler<T>, now: f64) -> Result<bool> {
    if !self.enabled || self.held.contains(&note) { return Ok(false); }
    self.held.push(note);
    self.last_held = self.held.clone();
    self.sync(sched, now, 0.0)?;
    Ok(true)
  }

  pub fn remove_note(&mut self, note: u8, sched: &mut Scheduler<T>, now: f64) -> Result<bool> {
    let Some(i) = self.held.iter().position(|&n| n == note) else { return Ok(false) };
    self.held.remove(i);
    self.sync(sched, now, 0.0)?;
    Ok(true)
  }

  /// Note for the current tick; advances the cursor.
  pub fn next_note(&mut self) -> Option<u8> {
    let notes = if !self.held.is_empty() {
      &self.held
    } else if self.hold && !self.last_held.is_empty() {
      &self.last_held
    } else {
      return None;
    };
    let idx = self.pattern[self.cursor % self.pattern.len()] % notes.len();
    let note = notes[idx];
    self.cursor = (self.cursor + 1) % self.pattern.len();
    Some(note)
  }

  /// Remembers a pending note-off so `stop` can cancel it.
  pub fn track_gate(&mut self, handle: TaskHandle) {
    self.gates.push_back(handle);
    while self.gates.len() > KEPT_GATES { self.gates.pop_front(); }
  }

  pub fn forget_gate(&mut self, handle: TaskHandle) { self.gates.retain(|&h| h != handle); }

  /// New tempo; a running tick restarts one new period from now with the
  /// cursor kept.
  pub fn set_tempo(&mut self, bpm: f32, sched: &mut Scheduler<T>, now: f64) -> Result<()> {
    self.bpm = bpm;
    let Some(h) = self.tick.take() else { return Ok(()) };
    sched.cancel(h);
    let cursor = self.cursor;
    self.sync(sched, now, self.interval_ms())?;
    self.cursor = cursor;
    Ok(())
  }

  /// Cancels the tick and pending note-offs; the held set is kept.
  pub fn stop(&mut self, sched: &mut Scheduler<T>) { self.halt(sched); }
}
