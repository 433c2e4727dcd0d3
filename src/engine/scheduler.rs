//! Cooperative millisecond scheduler for control-side timers.
//!
//! Tasks are plain values handed back from [`Scheduler::poll`]; the owner
//! decides what they mean. Nothing here sleeps or spawns threads, so timer
//! ordering and cancellation can be exercised with a [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

pub trait Clock: Send {
  fn now_ms(&self) -> f64;
}

pub struct SystemClock { origin: Instant }

impl SystemClock {
  pub fn new() -> Self { Self { origin: Instant::now() } }
}

impl Default for SystemClock {
  fn default() -> Self { Self::new() }
}

impl Clock for SystemClock {
  fn now_ms(&self) -> f64 { self.origin.elapsed().as_secs_f64() * 1000.0 }
}

/// Hand-advanced clock; clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock { bits: Arc<AtomicU64> }

impl ManualClock {
  pub fn new() -> Self { Self::default() }
  pub fn set(&self, ms: f64) { self.bits.store(ms.to_bits(), Ordering::Release); }
  pub fn advance(&self, ms: f64) { self.set(self.now_ms() + ms); }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> f64 { f64::from_bits(self.bits.load(Ordering::Acquire)) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
  #[error("period must be positive and finite, got {0} ms")]
  InvalidPeriod(f64),
  #[error("delay must be non-negative and finite, got {0} ms")]
  InvalidDelay(f64),
  #[error("task table full ({0} tasks)")]
  Full(usize),
}

struct Entry<T> {
  handle: TaskHandle,
  due: f64,
  period: Option<f64>,
  task: T,
}

pub struct Scheduler<T> {
  entries: Vec<Entry<T>>,
  next_id: u64,
  capacity: usize,
}

impl<T: Clone> Scheduler<T> {
  pub fn new(capacity: usize) -> Self {
    Self { entries: Vec::with_capacity(capacity.min(256)), next_id: 1, capacity }
  }

  pub fn once(&mut self, now: f64, delay_ms: f64, task: T) -> Result<TaskHandle, SchedulerError> {
    if !(delay_ms.is_finite() && delay_ms >= 0.0) { return Err(SchedulerError::InvalidDelay(delay_ms)); }
    self.push(now + delay_ms, None, task)
  }

  /// Repeating task; first run after `first_delay_ms`, then every `period_ms`.
  pub fn every(&mut self, now: f64, first_delay_ms: f64, period_ms: f64, task: T) -> Result<TaskHandle, SchedulerError> {
    if !(period_ms.is_finite() && period_ms > 0.0) { return Err(SchedulerError::InvalidPeriod(period_ms)); }
    if !(first_delay_ms.is_finite() && first_delay_ms >= 0.0) { return Err(SchedulerError::InvalidDelay(first_delay_ms)); }
    self.push(now + first_delay_ms, Some(period_ms), task)
  }

  fn push(&mut self, due: f64, period: Option<f64>, task: T) -> Result<TaskHandle, SchedulerError> {
    if self.entries.len() >= self.capacity { return Err(SchedulerError::Full(self.capacity)); }
    let handle = TaskHandle(self.next_id);
    self.next_id += 1;
    self.entries.push(Entry { handle, due, period, task });
    Ok(handle)
  }

  pub fn cancel(&mut self, handle: TaskHandle) -> bool {
    let before = self.entries.len();
    self.entries.retain(|e| e.handle != handle);
    before != self.entries.len()
  }

  pub fn is_pending(&self, handle: TaskHandle) -> bool { self.entries.iter().any(|e| e.handle == handle) }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn next_due(&self) -> Option<f64> { self.entries.iter().map(|e| e.due).reduce(f64::min) }

  /// Every task due at `now`, earliest first (ties keep scheduling order).
  /// A repeating task fires at most once per poll; if the poller fell more
  /// than a whole period behind, the missed ticks are dropped.
  pub fn poll(&mut self, now: f64) -> Vec<(TaskHandle, T)> {
    let mut due: Vec<(f64, TaskHandle, T)> = Vec::new();
    let mut i = 0;
    while i < self.entries.len() {
      if self.entries[i].due > now { i += 1; continue; }
      match self.entries[i].period {
        Some(p) => {
          let e = &mut self.entries[i];
          due.push((e.due, e.handle, e.task.clone()));
          e.due += p;
          if e.due <= now { e.due = now + p; }
          i += 1;
        }
        None => {
          let e = self.entries.remove(i);
          due.push((e.due, e.handle, e.task));
        }
      }
    }
    due.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1 .0.cmp(&b.1 .0)));
    due.into_iter().map(|(_, h, t)| (h, t)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn one_shot_fires_once() {
    let mut s = Scheduler::new(16);
    s.once(0.0, 10.0, "a").unwrap();
    assert!(s.poll(9.9).is_empty());
    let fired: Vec<_> = s.poll(10.0).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec!["a"]);
    assert!(s.poll(100.0).is_empty());
    assert!(s.is_empty());
  }

  #[test]
  fn periodic_keeps_its_grid() {
    let mut s = Scheduler::new(16);
    s.every(0.0, 0.0, 125.0, 1u8).unwrap();
    let mut hits = Vec::new();
    let mut t = 0.0;
    while t <= 1000.0 {
      for _ in s.poll(t) { hits.push(t); }
      t += 1.0;
    }
    assert_eq!(hits, vec![0.0, 125.0, 250.0, 375.0, 500.0, 625.0, 750.0, 875.0, 1000.0]);
  }

  #[test]
  fn cancel_stops_future_runs() {
    let mut s = Scheduler::new(16);
    let h = s.every(0.0, 5.0, 5.0, ()).unwrap();
    assert_eq!(s.poll(5.0).len(), 1);
    assert!(s.cancel(h));
    assert!(!s.is_pending(h));
    assert!(s.poll(50.0).is_empty());
    assert!(!s.cancel(h));
  }

  #[test]
  fn due_tasks_come_out_in_time_order() {
    let mut s = Scheduler::new(16);
    s.once(0.0, 30.0, 'c').unwrap();
    s.once(0.0, 10.0, 'a').unwrap();
    s.once(0.0, 20.0, 'b').unwrap();
    let order: String = s.poll(40.0).into_iter().map(|(_, t)| t).collect();
    assert_eq!(order, "abc");
  }

  #[test]
  fn setup_errors_are_reported() {
    let mut s = Scheduler::new(1);
    assert_eq!(s.every(0.0, 0.0, 0.0, ()), Err(SchedulerError::InvalidPeriod(0.0)));
    assert!(matches!(s.once(0.0, f64::NAN, ()), Err(SchedulerError::InvalidDelay(_))));
    s.once(0.0, 1.0, ()).unwrap();
    assert_eq!(s.once(0.0, 1.0, ()), Err(SchedulerError::Full(1)));
  }

  #[test]
  fn lagging_poll_drops_missed_periods() {
    let mut s = Scheduler::new(4);
    s.every(0.0, 10.0, 10.0, ()).unwrap();
    assert_eq!(s.poll(55.0).len(), 1);
    assert_eq!(s.next_due(), Some(65.0));
  }

  #[test]
  fn manual_clock_is_shared() {
    let c = ManualClock::new();
    let c2 = c.clone();
    c.advance(12.5);
    assert_eq!(c2.now_ms(), 12.5);
  }
}
