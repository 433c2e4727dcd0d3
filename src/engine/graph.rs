//! Render-side node slab: sources, gain stages and filters, wired by id.
//! Only the audio thread touches this; the control side speaks to it through
//! [`GraphMsg`].

use super::automation::AudioParam;
use super::dsp::{drum_voice::DrumSynth, osc::{Osc, Waveform}, sample_player::SamplePlayer, svf::Svf};
use super::messages::{Bin, Dest, Garbage, GraphMsg, NodeId, NodeKind, NodeParam};

pub const FILTER_DEFAULT_HZ: f32 = 22_050.0;
pub const FILTER_DEFAULT_Q: f32 = 1.0;
pub const GAIN_DEFAULT: f32 = 1.0;
// guards against accidental connection loops
const MAX_HOPS: usize = 8;

#[derive(Debug)]
enum Generator {
  Osc { osc: Osc, shape: Waveform },
  Sample(SamplePlayer),
  Drum(DrumSynth),
}

/// Single-use signal generator. Finished sources drop out of the graph on their own.
#[derive(Debug)]
pub struct Source {
  gen: Generator,
  start: f64,
  stop: Option<f64>,
  output: Option<Dest>,
  done: bool,
}

impl Source {
  fn with(gen: Generator, start: f64) -> Self { Self { gen, start, stop: None, output: None, done: false } }

  pub fn oscillator(shape: Waveform, freq: f32, sr: f32, start: f64) -> Self {
    Self::with(Generator::Osc { osc: Osc::new(freq, sr), shape }, start)
  }

  pub fn sample(player: SamplePlayer, start: f64) -> Self { Self::with(Generator::Sample(player), start) }

  pub fn drum(synth: DrumSynth, start: f64) -> Self { Self::with(Generator::Drum(synth), start) }

  #[inline]
  fn next(&mut self, t: f64) -> f32 {
    if self.done || t < self.start { return 0.0; }
    if matches!(self.stop, Some(stop) if t >= stop) {
      self.done = true;
      return 0.0;
    }
    let s = match &mut self.gen {
      Generator::Osc { osc, shape } => Some(osc.next(*shape)),
      Generator::Sample(p) => p.next(),
      Generator::Drum(d) => d.next(),
    };
    s.unwrap_or_else(|| { self.done = true; 0.0 })
  }
}

struct GainNode { gain: AudioParam, output: Option<Dest> }

struct FilterNode {
  svf: Svf,
  freq: AudioParam,
  q: AudioParam,
  coeffs: (f32, f32),
  output: Option<Dest>,
}

impl FilterNode {
  fn new() -> Self {
    Self {
      svf: Svf::new(),
      freq: AudioParam::new(FILTER_DEFAULT_HZ),
      q: AudioParam::new(FILTER_DEFAULT_Q),
      coeffs: (-1.0, -1.0),
      output: None,
    }
  }

  #[inline]
  fn process(&mut self, x: f32, t: f64, sr: f32) -> f32 {
    let c = (self.freq.value_at(t), self.q.value_at(t));
    if c != self.coeffs {
      self.svf.set_params(c.0, c.1, sr);
      self.coeffs = c;
    }
    self.svf.lowpass(x)
  }
}

enum Node {
  Gain(GainNode),
  Filter(FilterNode),
  Source(Box<Source>),
}

/// A node taken out of the graph, on its way to be freed off the audio thread.
pub struct Retired(#[allow(dead_code)] Node);

impl Node {
  fn output_mut(&mut self) -> &mut Option<Dest> {
    match self {
      Node::Gain(g) => &mut g.output,
      Node::Filter(f) => &mut f.output,
      Node::Source(s) => &mut s.output,
    }
  }

  fn param_mut(&mut self, p: NodeParam) -> Option<&mut AudioParam> {
    match (self, p) {
      (Node::Gain(g), NodeParam::Gain) => Some(&mut g.gain),
      (Node::Filter(f), NodeParam::Frequency) => Some(&mut f.freq),
      (Node::Filter(f), NodeParam::Q) => Some(&mut f.q),
      _ => None,
    }
  }
}

pub struct VoiceGraph {
  nodes: Vec<Option<Node>>,
  live: Vec<NodeId>,
  sr: f32,
  bin: Bin,
}

impl VoiceGraph {
  pub fn new(sr: f32) -> Self {
    let mut nodes = Vec::with_capacity(512);
    nodes.resize_with(128, || None);
    Self { nodes, live: Vec::with_capacity(256), sr, bin: Bin::default() }
  }

  pub fn set_bin(&mut self, bin: Bin) { self.bin = bin; }

  fn put(&mut self, id: NodeId, node: Node) {
    if let Some(old) = self.slot(id).replace(node) { self.bin.discard(Garbage::Node(Retired(old))); }
  }

  fn slot(&mut self, id: NodeId) -> &mut Option<Node> {
    let i = id.0 as usize;
    if i >= self.nodes.len() { self.nodes.resize_with(i + 1, || None); }
    &mut self.nodes[i]
  }

  fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
    self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
  }

  /// Applies node-level messages. Anything addressed elsewhere is handed back.
  pub fn apply(&mut self, msg: GraphMsg, now: f64) -> Option<GraphMsg> {
    match msg {
      GraphMsg::CreateNode { id, kind } => {
        let node = match kind {
          NodeKind::Gain => Node::Gain(GainNode { gain: AudioParam::new(GAIN_DEFAULT), output: None }),
          NodeKind::Filter => Node::Filter(FilterNode::new()),
        };
        self.put(id, node);
      }
      GraphMsg::CreateSource { id, source } => {
        self.put(id, Node::Source(source));
        self.live.push(id);
      }
      GraphMsg::Connect { from, to } => {
        if let Some(n) = self.node_mut(from) { *n.output_mut() = Some(to); }
      }
      GraphMsg::Disconnect { id } => {
        if let Some(n) = self.node_mut(id) {
          *n.output_mut() = None;
          if let Node::Filter(f) = n { f.svf.reset(); }
        }
      }
      GraphMsg::Automate { id, param, event } => {
        if let Some(p) = self.node_mut(id).and_then(|n| n.param_mut(param)) { p.schedule(event, now); }
      }
      GraphMsg::StopSource { id, at } => {
        if let Some(Node::Source(s)) = self.node_mut(id) { s.stop = Some(at); }
      }
      GraphMsg::Destroy { id } => {
        if let Some(old) = self.nodes.get_mut(id.0 as usize).and_then(Option::take) {
          self.bin.discard(Garbage::Node(Retired(old)));
        }
        self.live.retain(|&l| l != id);
      }
      other => return Some(other),
    }
    None
  }

  /// Mono sum of every live source that reaches the chain input at time `t`.
  pub fn tick(&mut self, t: f64) -> f32 {
    let mut sum = 0.0;
    let mut i = 0;
    while i < self.live.len() {
      let id = self.live[i];
      let step = match self.nodes.get_mut(id.0 as usize) {
        Some(Some(Node::Source(src))) => {
          let s = src.next(t);
          (!src.done).then_some((s, src.output))
        }
        _ => None,
      };
      let Some((mut x, mut dest)) = step else {
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
          if matches!(slot, Some(Node::Source(_))) {
            if let Some(done) = slot.take() { self.bin.discard(Garbage::Node(Retired(done))); }
          }
        }
        self.live.swap_remove(i);
        continue;
      };
      let mut hops = 0;
      while let Some(Dest::Node(next)) = dest {
        hops += 1;
        if hops > MAX_HOPS { dest = None; break; }
        match self.nodes.get_mut(next.0 as usize) {
          Some(Some(Node::Gain(g))) => { x *= g.gain.value_at(t); dest = g.output; }
          Some(Some(Node::Filter(f))) => { x = f.process(x, t, self.sr); dest = f.output; }
          _ => dest = None,
        }
      }
      if dest == Some(Dest::ChainInput) && x.is_finite() { sum += x; }
      i += 1;
    }
    sum
  }

  pub fn live_sources(&self) -> usize { self.live.len() }

  pub fn contains(&self, id: NodeId) -> bool { matches!(self.nodes.get(id.0 as usize), Some(Some(_))) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::automation::ParamEvent;

  const SR: f32 = 1000.0;

  fn wire_voice(g: &mut VoiceGraph, src: NodeId, gain: NodeId) {
    g.apply(GraphMsg::CreateNode { id: gain, kind: NodeKind::Gain }, 0.0);
    let s = Source::oscillator(Waveform::Square, 10.0, SR, 0.0);
    g.apply(GraphMsg::CreateSource { id: src, source: Box::new(s) }, 0.0);
    g.apply(GraphMsg::Connect { from: src, to: Dest::Node(gain) }, 0.0);
    g.apply(GraphMsg::Connect { from: gain, to: Dest::ChainInput }, 0.0);
  }

  #[test]
  fn source_through_gain_reaches_chain() {
    let mut g = VoiceGraph::new(SR);
    wire_voice(&mut g, NodeId(1), NodeId(0));
    g.apply(GraphMsg::Automate { id: NodeId(0), param: NodeParam::Gain, event: ParamEvent::SetValue { at: 0.0, value: 0.5 } }, 0.0);
    let peak = (0..100).map(|n| g.tick(n as f64 / SR as f64).abs()).fold(0.0f32, f32::max);
    assert!((peak - 0.5).abs() < 0.01, "peak {peak}");
  }

  #[test]
  fn disconnected_gain_is_silent() {
    let mut g = VoiceGraph::new(SR);
    wire_voice(&mut g, NodeId(1), NodeId(0));
    g.apply(GraphMsg::Disconnect { id: NodeId(0) }, 0.0);
    assert!((0..50).all(|n| g.tick(n as f64 / SR as f64) == 0.0));
  }

  #[test]
  fn stopped_source_leaves_the_graph() {
    let mut g = VoiceGraph::new(SR);
    wire_voice(&mut g, NodeId(1), NodeId(0));
    g.apply(GraphMsg::StopSource { id: NodeId(1), at: 0.02 }, 0.0);
    for n in 0..40 { g.tick(n as f64 / SR as f64); }
    assert_eq!(g.live_sources(), 0);
    assert!(!g.contains(NodeId(1)));
    // the pooled gain stays
    assert!(g.contains(NodeId(0)));
  }

  #[test]
  fn unknown_messages_are_returned() {
    let mut g = VoiceGraph::new(SR);
    let back = g.apply(GraphMsg::Splice { kind: crate::engine::effects::EffectKind::Delay, engaged: true }, 0.0);
    assert!(matches!(back, Some(GraphMsg::Splice { .. })));
  }

  #[test]
  fn filter_node_in_series() {
    let mut g = VoiceGraph::new(SR);
    g.apply(GraphMsg::CreateNode { id: NodeId(2), kind: NodeKind::Filter }, 0.0);
    wire_voice(&mut g, NodeId(1), NodeId(0));
    g.apply(GraphMsg::Connect { from: NodeId(1), to: Dest::Node(NodeId(2)) }, 0.0);
    g.apply(GraphMsg::Connect { from: NodeId(2), to: Dest::Node(NodeId(0)) }, 0.0);
    g.apply(GraphMsg::Automate { id: NodeId(2), param: NodeParam::Frequency, event: ParamEvent::SetValue { at: 0.0, value: 1.0 } }, 0.0);
    // 1 Hz low-pass on a 10 Hz square: heavily attenuated
    let peak = (200..400).map(|n| g.tick(n as f64 / SR as f64).abs()).fold(0.0f32, f32::max);
    assert!(peak < 0.2, "peak {peak}");
  }
}
