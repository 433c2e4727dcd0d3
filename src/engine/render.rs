//! Audio-thread side of the engine: drains the graph queue and renders frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};

use super::automation::AudioParam;
use super::config::EngineConfig;
use super::graph::VoiceGraph;
use super::messages::{Bin, Bus, GraphMsg};
use super::rack::EffectRack;

/// Frames rendered so far, shared with the control side as the audio clock.
#[derive(Clone, Debug)]
pub struct AudioClock { frames: Arc<AtomicU64>, sr: f32 }

impl AudioClock {
  pub fn new(sr: f32) -> Self { Self { frames: Arc::new(AtomicU64::new(0)), sr } }

  pub fn sample_rate(&self) -> f32 { self.sr }

  pub fn frames(&self) -> u64 { self.frames.load(Ordering::Acquire) }

  /// Seconds of audio rendered.
  pub fn now(&self) -> f64 { self.frames() as f64 / self.sr as f64 }

  fn advance(&self, n: u64) { self.frames.fetch_add(n, Ordering::AcqRel); }
}

pub struct Renderer {
  rx: Receiver<GraphMsg>,
  graph: VoiceGraph,
  rack: EffectRack,
  master: AudioParam,
  clock: AudioClock,
  max_msgs: usize,
}

impl Renderer {
  pub fn new(sr: f32, rx: Receiver<GraphMsg>, cfg: &EngineConfig) -> Self {
    Self {
      rx,
      graph: VoiceGraph::new(sr),
      rack: EffectRack::new(sr, &cfg.reverb),
      master: AudioParam::new(cfg.master_gain),
      clock: AudioClock::new(sr),
      max_msgs: cfg.max_messages_per_block,
    }
  }

  /// Routes retired nodes and curves back to the control side instead of
  /// freeing them in the callback.
  pub fn with_bin(mut self, bin: Bin) -> Self {
    self.graph.set_bin(bin.clone());
    self.rack.set_bin(bin);
    self
  }

  pub fn clock(&self) -> AudioClock { self.clock.clone() }

  pub fn live_sources(&self) -> usize { self.graph.live_sources() }

  fn drain(&mut self, now: f64) {
    let mut drained = 0usize;
    while drained < self.max_msgs {
      let msg = match self.rx.try_recv() {
        Ok(m) => m,
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
      };
      drained += 1;
      let Some(msg) = self.graph.apply(msg, now) else { continue };
      let Some(msg) = self.rack.apply(msg, now) else { continue };
      if let GraphMsg::Bus { bus: Bus::Master, event } = msg { self.master.schedule(event, now); }
    }
  }

  /// Fills an interleaved buffer. Extra channels beyond two get the left signal.
  pub fn render(&mut self, out: &mut [f32], channels: usize) {
    let channels = channels.max(1);
    let sr = self.clock.sr as f64;
    let start = self.clock.frames();
    self.drain(start as f64 / sr);
    let mut n = 0u64;
    for frame in out.chunks_mut(channels) {
      let t = (start + n) as f64 / sr;
      let x = self.graph.tick(t);
      let (l, r) = self.rack.process(x, t);
      let g = self.master.value_at(t);
      let (l, r) = ((l * g).tanh(), (r * g).tanh());
      frame[0] = l;
      if frame.len() > 1 { frame[1] = r; }
      for s in frame.iter_mut().skip(2) { *s = l; }
      n += 1;
    }
    self.clock.advance(n);
  }
}
