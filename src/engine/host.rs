//! Runs an [`Engine`] on its own control thread so timers fire without the
//! caller having to poll.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, unbounded, Receiver, Sender};

use super::core::{Engine, EngineStats};
use super::error::{EngineError, Result};
use crate::commands::{dispatch, Command};

/// Longest the control thread sleeps with nothing due.
const IDLE_WAIT: Duration = Duration::from_millis(100);

enum HostMsg {
  Command(Command),
  Stats(Sender<EngineStats>),
  Shutdown,
}

pub struct EngineHost {
  tx: Sender<HostMsg>,
  thread: Option<JoinHandle<()>>,
}

impl EngineHost {
  /// `build` runs on the control thread; the audio stream is opened there and never crosses threads.
  pub fn spawn<F>(build: F) -> Result<Self>
  where
    F: FnOnce() -> Result<Engine> + Send + 'static,
  {
    let (tx, rx) = unbounded();
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let thread = std::thread::Builder::new()
      .name("stepsynth-control".into())
      .spawn(move || match build() {
        Ok(engine) => {
          let _ = ready_tx.send(Ok(()));
          control_loop(engine, rx);
        }
        Err(e) => { let _ = ready_tx.send(Err(e)); }
      })
      .map_err(|e| EngineError::invalid(format!("control thread: {e}")))?;
    match ready_rx.recv() {
      Ok(Ok(())) => Ok(Self { tx, thread: Some(thread) }),
      Ok(Err(e)) => {
        let _ = thread.join();
        Err(e)
      }
      Err(_) => Err(EngineError::GraphDisconnected),
    }
  }

  pub fn send(&self, cmd: Command) -> Result<()> {
    self.tx.send(HostMsg::Command(cmd)).map_err(|_| EngineError::GraphDisconnected)
  }

  pub fn stats(&self) -> Result<EngineStats> {
    let (reply, rx) = bounded(1);
    self.tx.send(HostMsg::Stats(reply)).map_err(|_| EngineError::GraphDisconnected)?;
    rx.recv().map_err(|_| EngineError::GraphDisconnected)
  }
}

impl Drop for EngineHost {
  fn drop(&mut self) {
    let _ = self.tx.send(HostMsg::Shutdown);
    if let Some(t) = self.thread.take() {
      if t.join().is_err() { log::error!("control thread panicked"); }
    }
  }
}

fn control_loop(mut engine: Engine, rx: Receiver<HostMsg>) {
  loop {
    engine.poll();
    let wait = engine.next_due_in().map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT));
    select! {
      recv(rx) -> msg => match msg {
        Ok(HostMsg::Command(cmd)) => dispatch(&mut engine, cmd),
        Ok(HostMsg::Stats(reply)) => { let _ = reply.send(engine.stats()); }
        Ok(HostMsg::Shutdown) | Err(_) => break,
      },
      recv(after(wait)) -> _ => {}
    }
  }
  engine.panic();
  engine.release_idle_nodes();
  log::info!("control thread stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::audio::NullOutput;
  use crate::engine::config::EngineConfig;
  use crate::engine::drums::NoSamples;
  use crate::engine::scheduler::SystemClock;
  use crate::engine::voice::Instrument;

  fn silent() -> Result<Engine> {
    let cfg = EngineConfig::default();
    let sr = cfg.sample_rate;
    Engine::new(cfg, Box::new(NullOutput::new(sr)), Box::new(SystemClock::new()), Box::new(NoSamples))
  }

  #[test]
  fn commands_reach_the_engine() {
    let host = EngineHost::spawn(silent).unwrap();
    host.send(Command::NoteOn { note: 60, instrument: Some(Instrument::Keys), velocity: 1.0 }).unwrap();
    host.send(Command::SetTempo { bpm: 90.0 }).unwrap();
    let stats = host.stats().unwrap();
    assert_eq!(stats.voices, 1);
    assert_eq!(stats.bpm, 90.0);
  }

  #[test]
  fn build_failure_is_reported() {
    let r = EngineHost::spawn(|| Err(EngineError::InvalidConfig("nope".into())));
    assert!(matches!(r, Err(EngineError::InvalidConfig(_))));
  }

  #[test]
  fn sequencer_runs_on_its_own() {
    let host = EngineHost::spawn(silent).unwrap();
    host.send(Command::StartPlayback).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let stats = host.stats().unwrap();
    assert!(stats.playing);
    assert!(stats.step >= 1);
  }
}
