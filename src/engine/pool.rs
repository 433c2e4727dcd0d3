//! Reusable gain and filter nodes, so note-on never has to wait for the
//! render side to build a fresh node.

use std::collections::HashSet;

use serde::Serialize;

use super::automation::ParamEvent;
use super::error::Result;
use super::graph::{FILTER_DEFAULT_HZ, FILTER_DEFAULT_Q, GAIN_DEFAULT};
use super::messages::{GraphHandle, NodeId, NodeKind, NodeParam};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
  pub available: usize,
  pub in_use: usize,
  pub total: usize,
  pub constructed: usize,
  pub discarded: usize,
}

#[derive(Default)]
struct Partition {
  available: Vec<NodeId>,
  in_use: HashSet<NodeId>,
  constructed: usize,
  discarded: usize,
}

impl Partition {
  fn stats(&self) -> PoolStats {
    PoolStats {
      available: self.available.len(),
      in_use: self.in_use.len(),
      total: self.available.len() + self.in_use.len(),
      constructed: self.constructed,
      discarded: self.discarded,
    }
  }
}

/// A node handed out by [`NodePool::acquire`]. `grown` marks a node built on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease { pub id: NodeId, pub grown: bool }

pub struct NodePool {
  gain: Partition,
  filter: Partition,
  capacity: usize,
}

impl NodePool {
  pub fn new(capacity: usize) -> Self {
    Self { gain: Partition::default(), filter: Partition::default(), capacity }
  }

  fn part(&self, kind: NodeKind) -> &Partition {
    match kind { NodeKind::Gain => &self.gain, NodeKind::Filter => &self.filter }
  }

  fn part_mut(&mut self, kind: NodeKind) -> &mut Partition {
    match kind { NodeKind::Gain => &mut self.gain, NodeKind::Filter => &mut self.filter }
  }

  pub fn capacity(&self) -> usize { self.capacity }

  /// Builds idle nodes up front, never past capacity.
  pub fn prepopulate(&mut self, kind: NodeKind, count: usize, graph: &mut GraphHandle) -> Result<()> {
    let cap = self.capacity;
    let p = self.part_mut(kind);
    let want = count.min(cap).saturating_sub(p.available.len() + p.in_use.len());
    for _ in 0..want {
      let id = graph.create_node(kind)?;
      p.constructed += 1;
      p.available.push(id);
    }
    log::debug!("pool: {:?} prepopulated to {}", kind, p.available.len());
    Ok(())
  }

  /// Hands out an idle node, or builds one when the partition is dry.
  pub fn acquire(&mut self, kind: NodeKind, graph: &mut GraphHandle) -> Result<Lease> {
    let p = self.part_mut(kind);
    if let Some(id) = p.available.pop() {
      p.in_use.insert(id);
      return Ok(Lease { id, grown: false });
    }
    let id = graph.create_node(kind)?;
    p.constructed += 1;
    p.in_use.insert(id);
    log::warn!("pool: {:?} exhausted, built node {} ({} in use)", kind, id.0, p.in_use.len());
    Ok(Lease { id, grown: true })
  }

  /// Returns a leased node: disconnected and reset to idle values, then either
  /// parked or dropped when the partition already holds `capacity` idle nodes.
  /// Releasing a node that is not leased does nothing and returns `false`.
  /// A node whose messages cannot be sent is counted as discarded.
  pub fn release(&mut self, id: NodeId, graph: &mut GraphHandle) -> bool {
    let kind = if self.gain.in_use.contains(&id) {
      NodeKind::Gain
    } else if self.filter.in_use.contains(&id) {
      NodeKind::Filter
    } else {
      return false;
    };
    let cap = self.capacity;
    let p = self.part_mut(kind);
    p.in_use.remove(&id);
    let park = p.available.len() < cap;
    let sent = graph.disconnect(id).and_then(|_| if park { reset(kind, id, graph) } else { graph.destroy(id) });
    match sent {
      Ok(()) if park => p.available.push(id),
      Ok(()) => p.discarded += 1,
      Err(e) => {
        log::warn!("pool: {:?} node {} dropped on release: {e}", kind, id.0);
        p.discarded += 1;
      }
    }
    true
  }

  pub fn is_leased(&self, id: NodeId) -> bool { self.gain.in_use.contains(&id) || self.filter.in_use.contains(&id) }

  pub fn stats(&self, kind: NodeKind) -> PoolStats { self.part(kind).stats() }

  /// Drops every idle node; leased nodes stay with their owners.
  pub fn cleanup(&mut self, graph: &mut GraphHandle) {
    for kind in [NodeKind::Gain, NodeKind::Filter] {
      let idle = std::mem::take(&mut self.part_mut(kind).available);
      self.part_mut(kind).discarded += idle.len();
      for id in idle {
        if let Err(e) = graph.destroy(id) { log::warn!("pool: {:?} node {} teardown: {e}", kind, id.0); }
      }
    }
  }
}

fn reset(kind: NodeKind, id: NodeId, graph: &GraphHandle) -> Result<()> {
  match kind {
    NodeKind::Gain => graph.automate(id, NodeParam::Gain, ParamEvent::Reset(GAIN_DEFAULT)),
    NodeKind::Filter => {
      graph.automate(id, NodeParam::Frequency, ParamEvent::Reset(FILTER_DEFAULT_HZ))?;
      graph.automate(id, NodeParam::Q, ParamEvent::Reset(FILTER_DEFAULT_Q))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::messages::{GraphLink, GraphMsg};

  fn handle() -> GraphHandle { GraphHandle::new(GraphLink::detached()) }

  fn balanced(s: PoolStats) -> bool { s.available + s.in_use + s.discarded == s.constructed }

  #[test]
  fn sixty_acquires_on_a_full_pool() {
    let mut g = handle();
    let mut pool = NodePool::new(50);
    pool.prepopulate(NodeKind::Gain, 50, &mut g).unwrap();
    let leases: Vec<Lease> = (0..60).map(|_| pool.acquire(NodeKind::Gain, &mut g).unwrap()).collect();
    assert_eq!(leases.iter().filter(|l| l.grown).count(), 10);
    let s = pool.stats(NodeKind::Gain);
    assert_eq!((s.available, s.in_use, s.constructed), (0, 60, 60));
    for l in &leases { assert!(pool.release(l.id, &mut g)); }
    let s = pool.stats(NodeKind::Gain);
    assert_eq!((s.available, s.in_use, s.discarded), (50, 0, 10));
    assert!(balanced(s));
  }

  #[test]
  fn double_release_is_a_no_op() {
    let mut g = handle();
    let mut pool = NodePool::new(4);
    let l = pool.acquire(NodeKind::Filter, &mut g).unwrap();
    assert!(l.grown);
    assert!(pool.release(l.id, &mut g));
    assert!(!pool.release(l.id, &mut g));
    assert!(!pool.release(NodeId(999), &mut g));
    let s = pool.stats(NodeKind::Filter);
    assert_eq!((s.available, s.in_use), (1, 0));
    assert!(balanced(s));
  }

  #[test]
  fn release_resets_and_disconnects() {
    let (link, rx) = GraphLink::channel();
    let mut g = GraphHandle::new(link);
    let mut pool = NodePool::new(4);
    let l = pool.acquire(NodeKind::Filter, &mut g).unwrap();
    let _ = rx.try_iter().count();
    pool.release(l.id, &mut g);
    let msgs: Vec<GraphMsg> = rx.try_iter().collect();
    assert!(matches!(msgs[0], GraphMsg::Disconnect { id } if id == l.id));
    assert!(matches!(msgs[1], GraphMsg::Automate { param: NodeParam::Frequency, event: ParamEvent::Reset(f), .. } if f == FILTER_DEFAULT_HZ));
    assert!(matches!(msgs[2], GraphMsg::Automate { param: NodeParam::Q, .. }));
  }

  #[test]
  fn partitions_are_independent_and_cleanup_drops_idle() {
    let mut g = handle();
    let mut pool = NodePool::new(8);
    pool.prepopulate(NodeKind::Gain, 5, &mut g).unwrap();
    pool.prepopulate(NodeKind::Filter, 3, &mut g).unwrap();
    let held = pool.acquire(NodeKind::Gain, &mut g).unwrap();
    assert_eq!(pool.stats(NodeKind::Filter).total, 3);
    pool.cleanup(&mut g);
    let s = pool.stats(NodeKind::Gain);
    assert_eq!((s.available, s.in_use, s.discarded), (0, 1, 4));
    assert!(balanced(s));
    assert!(pool.is_leased(held.id));
  }

  #[test]
  fn prepopulate_respects_capacity() {
    let mut g = handle();
    let mut pool = NodePool::new(3);
    pool.prepopulate(NodeKind::Gain, 10, &mut g).unwrap();
    assert_eq!(pool.stats(NodeKind::Gain).available, 3);
  }

  #[test]
  fn lost_render_side_keeps_counts_balanced() {
    let (link, rx) = GraphLink::channel();
    let mut g = GraphHandle::new(link);
    let mut pool = NodePool::new(1);
    pool.prepopulate(NodeKind::Gain, 1, &mut g).unwrap();
    let a = pool.acquire(NodeKind::Gain, &mut g).unwrap();
    let b = pool.acquire(NodeKind::Filter, &mut g).unwrap();
    let c = pool.acquire(NodeKind::Filter, &mut g).unwrap();
    assert!(pool.release(c.id, &mut g));
    drop(rx);
    assert!(pool.release(a.id, &mut g));
    assert!(pool.release(b.id, &mut g));
    let (gs, fs) = (pool.stats(NodeKind::Gain), pool.stats(NodeKind::Filter));
    assert_eq!((gs.in_use, gs.discarded), (0, 1));
    assert_eq!((fs.available, fs.in_use, fs.discarded), (1, 0, 1));
    assert!(balanced(gs) && balanced(fs));
    pool.cleanup(&mut g);
    let fs = pool.stats(NodeKind::Filter);
    assert_eq!((fs.available, fs.discarded), (0, 2));
    assert!(balanced(fs));
  }
}
