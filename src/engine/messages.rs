use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::automation::ParamEvent;
use super::effects::{EffectKind, EffectParam};
use super::error::{EngineError, Result};
use super::graph::{Retired, Source};

// retired allocations in flight back to the control side
const RETURN_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Reusable processing node kinds; sources are not listed since they are never pooled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind { Gain, Filter }

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Dest { Node(NodeId), ChainInput }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeParam { Gain, Frequency, Q }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bus { Wet, Dry, Master }

/// Control → render instructions. Everything that allocates is built before sending.
#[derive(Debug)]
pub enum GraphMsg {
  CreateNode { id: NodeId, kind: NodeKind },
  CreateSource { id: NodeId, source: Box<Source> },
  Connect { from: NodeId, to: Dest },
  Disconnect { id: NodeId },
  Automate { id: NodeId, param: NodeParam, event: ParamEvent },
  StopSource { id: NodeId, at: f64 },
  Destroy { id: NodeId },
  EffectParam { kind: EffectKind, param: EffectParam, event: ParamEvent },
  /// Engages or bypasses one unit of the wet path.
  Splice { kind: EffectKind, engaged: bool },
  Bus { bus: Bus, event: ParamEvent },
  SaturationCurve(Box<[f32]>),
}

/// Render → control: allocations the audio thread is done with. They are
/// only ever dropped, on the control side.
#[allow(dead_code)]
pub enum Garbage {
  Node(Retired),
  Curve(Box<[f32]>),
}

/// Render-side end of the return path. Anything it cannot hand back is
/// freed in place.
#[derive(Clone, Default)]
pub struct Bin { tx: Option<Sender<Garbage>> }

impl Bin {
  pub fn discard(&self, g: Garbage) {
    if let Some(tx) = &self.tx {
      // full or closed: dropped here
      let _ = tx.try_send(g);
    }
  }
}

/// Sending half of the render queue. A detached link swallows messages,
/// which is how the no-op output keeps every command path alive.
#[derive(Clone)]
pub struct GraphLink {
  tx: Option<Sender<GraphMsg>>,
  returned: Option<Receiver<Garbage>>,
}

impl GraphLink {
  pub fn channel() -> (Self, Receiver<GraphMsg>) {
    let (tx, rx) = unbounded();
    (Self { tx: Some(tx), returned: None }, rx)
  }

  /// A render queue plus the return path for what the renderer retires.
  pub fn duplex() -> (Self, Receiver<GraphMsg>, Bin) {
    let (tx, rx) = unbounded();
    let (bin, returned) = bounded(RETURN_CAPACITY);
    (Self { tx: Some(tx), returned: Some(returned) }, rx, Bin { tx: Some(bin) })
  }

  pub fn detached() -> Self { Self { tx: None, returned: None } }

  /// Frees whatever the renderer handed back. Returns how many items.
  pub fn collect_garbage(&self) -> usize { self.returned.as_ref().map_or(0, |rx| rx.try_iter().count()) }

  pub fn is_detached(&self) -> bool { self.tx.is_none() }

  pub fn send(&self, msg: GraphMsg) -> Result<()> {
    match &self.tx {
      Some(tx) => tx.send(msg).map_err(|_| EngineError::GraphDisconnected),
      None => Ok(()),
    }
  }

  pub fn automate(&self, id: NodeId, param: NodeParam, event: ParamEvent) -> Result<()> {
    self.send(GraphMsg::Automate { id, param, event })
  }
}

/// Hands out node ids and recycles them once the render side has been told to drop them.
#[derive(Default)]
pub struct IdAllocator { next: u32, free: Vec<NodeId> }

impl IdAllocator {
  pub fn new() -> Self { Self::default() }

  pub fn alloc(&mut self) -> NodeId {
    if let Some(id) = self.free.pop() { return id; }
    let id = NodeId(self.next);
    self.next += 1;
    id
  }

  pub fn free(&mut self, id: NodeId) { self.free.push(id); }

  pub fn high_water(&self) -> u32 { self.next }
}

/// Control-side view of the render graph: the link plus id bookkeeping.
pub struct GraphHandle {
  link: GraphLink,
  ids: IdAllocator,
}

impl GraphHandle {
  pub fn new(link: GraphLink) -> Self { Self { link, ids: IdAllocator::new() } }

  pub fn link(&self) -> &GraphLink { &self.link }

  pub fn create_node(&mut self, kind: NodeKind) -> Result<NodeId> {
    let id = self.ids.alloc();
    if let Err(e) = self.link.send(GraphMsg::CreateNode { id, kind }) {
      self.ids.free(id);
      return Err(e);
    }
    Ok(id)
  }

  pub fn create_source(&mut self, source: Source) -> Result<NodeId> {
    let id = self.ids.alloc();
    if let Err(e) = self.link.send(GraphMsg::CreateSource { id, source: Box::new(source) }) {
      self.ids.free(id);
      return Err(e);
    }
    Ok(id)
  }

  pub fn connect(&self, from: NodeId, to: Dest) -> Result<()> { self.link.send(GraphMsg::Connect { from, to }) }

  pub fn disconnect(&self, id: NodeId) -> Result<()> { self.link.send(GraphMsg::Disconnect { id }) }

  pub fn automate(&self, id: NodeId, param: NodeParam, event: ParamEvent) -> Result<()> { self.link.automate(id, param, event) }

  pub fn stop_source(&self, id: NodeId, at: f64) -> Result<()> { self.link.send(GraphMsg::StopSource { id, at }) }

  /// Drops the node on the render side. The id is recycled even when the link is gone.
  pub fn destroy(&mut self, id: NodeId) -> Result<()> {
    let sent = self.link.send(GraphMsg::Destroy { id });
    self.ids.free(id);
    sent
  }

  pub fn ids_issued(&self) -> u32 { self.ids.high_water() }
}
