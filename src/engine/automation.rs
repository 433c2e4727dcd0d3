//! Sample-rate automation timeline for node parameters.
//!
//! Control code never writes a live value directly; it queues timestamped
//! events (absolute audio-clock seconds) and the render thread evaluates the
//! timeline once per frame.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamEvent {
  SetValue { at: f64, value: f32 },
  /// Linear ramp from the previous event's end point, reaching `value` at `end`.
  LinearRamp { end: f64, value: f32 },
  /// Exponential approach toward `target` starting at `at`.
  SetTarget { at: f64, target: f32, tau: f64 },
  /// Drop every queued event and freeze at the current value.
  CancelAndHold,
  /// Back to an idle value with an empty timeline.
  Reset(f32),
}

#[derive(Clone, Copy, Debug)]
struct Approach { start: f64, from: f32, to: f32, tau: f64 }

#[derive(Clone, Debug)]
pub struct AudioParam {
  value: f32,
  events: VecDeque<ParamEvent>,
  last_t: f64,
  last_v: f32,
  approach: Option<Approach>,
}

impl AudioParam {
  pub fn new(value: f32) -> Self {
    Self { value, events: VecDeque::with_capacity(8), last_t: 0.0, last_v: value, approach: None }
  }

  pub fn value(&self) -> f32 { self.value }

  pub fn is_idle(&self) -> bool { self.events.is_empty() && self.approach.is_none() }

  pub fn schedule(&mut self, ev: ParamEvent, now: f64) {
    match ev {
      ParamEvent::CancelAndHold => {
        let held = self.value_at(now);
        self.events.clear();
        self.approach = None;
        self.value = held;
        self.last_t = now;
        self.last_v = held;
      }
      ParamEvent::Reset(v) => {
        self.events.clear();
        self.approach = None;
        self.value = v;
        self.last_t = now;
        self.last_v = v;
      }
      _ => {
        let t = event_time(&ev);
        let pos = self.events.iter().position(|e| event_time(e) > t).unwrap_or(self.events.len());
        self.events.insert(pos, ev);
      }
    }
  }

  /// Advance to time `t` (seconds) and return the parameter value there.
  /// Calling twice with the same `t` returns the same value.
  pub fn value_at(&mut self, t: f64) -> f32 {
    while let Some(front) = self.events.front().copied() {
      match front {
        ParamEvent::SetValue { at, value } => {
          if t < at { break; }
          self.settle(at, value);
          self.events.pop_front();
        }
        ParamEvent::LinearRamp { end, value } => {
          if let Some(a) = self.approach.take() {
            // freeze the running approach as the ramp's start point
            let v = approach_value(&a, t);
            self.last_t = t;
            self.last_v = v;
          }
          if t >= end {
            self.settle(end, value);
            self.events.pop_front();
            continue;
          }
          let span = end - self.last_t;
          if span > 0.0 && t >= self.last_t {
            let f = ((t - self.last_t) / span) as f32;
            self.value = self.last_v + (value - self.last_v) * f;
          }
          return self.value;
        }
        ParamEvent::SetTarget { at, target, tau } => {
          if t < at { break; }
          let from = match self.approach { Some(a) => approach_value(&a, at), None => self.value };
          self.approach = Some(Approach { start: at, from, to: target, tau: tau.max(1e-6) });
          self.last_t = at;
          self.events.pop_front();
        }
        ParamEvent::CancelAndHold | ParamEvent::Reset(_) => { self.events.pop_front(); }
      }
    }
    if let Some(a) = self.approach {
      self.value = approach_value(&a, t);
      self.last_v = self.value;
    }
    self.value
  }

  fn settle(&mut self, at: f64, value: f32) {
    self.approach = None;
    self.value = value;
    self.last_t = at;
    self.last_v = value;
  }
}

#[inline]
fn approach_value(a: &Approach, t: f64) -> f32 {
  if t <= a.start { return a.from; }
  let k = (-(t - a.start) / a.tau).exp() as f32;
  a.to + (a.from - a.to) * k
}

fn event_time(ev: &ParamEvent) -> f64 {
  match *ev {
    ParamEvent::SetValue { at, .. } => at,
    ParamEvent::LinearRamp { end, .. } => end,
    ParamEvent::SetTarget { at, .. } => at,
    ParamEvent::CancelAndHold | ParamEvent::Reset(_) => f64::NEG_INFINITY,
  }
}
