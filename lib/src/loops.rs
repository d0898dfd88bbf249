/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The loop nest: natural loops found from back edges, nested by block-set
//! inclusion.  The nest can be updated in place when blocks are split or
//! cloned, so that loop indices handed out earlier stay valid.

#![allow(non_snake_case)]

use log::debug;

use crate::cfg::{CFGInfo, DomTree};
use crate::data_structures::{BlockIx, LoopIx, Map, Set, TypedIxVec};
use crate::ir::Func;

#[derive(Clone, Debug)]
pub struct Loop {
  pub header: BlockIx,
  pub blocks: Set<BlockIx>,
  pub parent: Option<LoopIx>,
  /// 1 for outermost loops.
  pub depth: u32,
}

#[derive(Clone, Debug)]
pub struct LoopInfo {
  pub loops: TypedIxVec<LoopIx, Loop>,
}

impl LoopInfo {
  #[inline(never)]
  pub fn create(func: &Func, cfg: &CFGInfo, dt: &DomTree) -> Self {
    // === BEGIN find back edges ===
    //
    // A "back edge" m->n is some edge m->n where n dominates m.  'n' is
    // the loop header node.
    let mut back_edges = Vec::<(BlockIx, BlockIx)>::new();
    for bixM in &func.layout {
      for bixN in cfg.succ_map[*bixM].to_vec() {
        if dt.dominates(bixN, *bixM) {
          back_edges.push((*bixM, bixN));
        }
      }
    }
    //
    // === END find back edges ===

    // === BEGIN collect natural loops ===
    //
    // Per Fig 7.21 of Muchnick 1997.  Loops sharing a header are merged.
    let mut by_header = Map::<BlockIx, Set<BlockIx>>::default();
    for (bixM, bixN) in &back_edges {
      let mut Loop = Set::<BlockIx>::unit(*bixM);
      Loop.insert(*bixN);
      let mut Stack = Vec::<BlockIx>::new();
      if bixM != bixN {
        Stack.push(*bixM);
        while let Some(bixP) = Stack.pop() {
          for bixQ in cfg.pred_map[bixP].iter() {
            if !Loop.contains(*bixQ) {
              Loop.insert(*bixQ);
              Stack.push(*bixQ);
            }
          }
        }
      }
      by_header
        .entry(*bixN)
        .and_modify(|s| s.union(&Loop))
        .or_insert(Loop);
    }
    //
    // === END collect natural loops ===

    // Outer loops first.  A loop's parent is the smallest enclosing loop,
    // which then has a smaller index.
    let mut natural_loops: Vec<(BlockIx, Set<BlockIx>)> =
      by_header.into_iter().collect();
    natural_loops.sort_by(|(h1, s1), (h2, s2)| {
      s2.card().cmp(&s1.card()).then(h1.cmp(h2))
    });

    let mut loops = TypedIxVec::<LoopIx, Loop>::new();
    for (i, (header, blocks)) in natural_loops.iter().enumerate() {
      let mut parent = None;
      for j in (0..i).rev() {
        if natural_loops[j].1.contains(*header)
          && blocks.is_subset_of(&natural_loops[j].1)
        {
          parent = Some(LoopIx::new(j as u32));
          break;
        }
      }
      let depth = match parent {
        Some(p) => loops[p].depth + 1,
        None => 1,
      };
      debug!(
        "LoopInfo: loop L{} header {:?} depth {} blocks {:?}",
        i, header, depth, blocks
      );
      loops.push(Loop { header: *header, blocks: blocks.clone(), parent, depth });
    }
    LoopInfo { loops }
  }

  pub fn num_loops(&self) -> usize {
    self.loops.len() as usize
  }

  pub fn header(&self, l: LoopIx) -> BlockIx {
    self.loops[l].header
  }

  pub fn parent(&self, l: LoopIx) -> Option<LoopIx> {
    self.loops[l].parent
  }

  pub fn contains_block(&self, l: LoopIx, b: BlockIx) -> bool {
    self.loops[l].blocks.contains(b)
  }

  /// Is `inner` equal to or nested inside `outer`?
  pub fn contains_loop(&self, outer: LoopIx, inner: LoopIx) -> bool {
    let mut cur = Some(inner);
    while let Some(c) = cur {
      if c == outer {
        return true;
      }
      cur = self.loops[c].parent;
    }
    false
  }

  /// The innermost loop containing `b`.
  pub fn loop_for(&self, b: BlockIx) -> Option<LoopIx> {
    let mut best: Option<LoopIx> = None;
    for l in self.loops.range() {
      if self.loops[l].blocks.contains(b) {
        match best {
          Some(cur) if self.loops[cur].depth >= self.loops[l].depth => {}
          _ => best = Some(l),
        }
      }
    }
    best
  }

  pub fn children(&self, l: LoopIx) -> Vec<LoopIx> {
    self.loops.range().into_iter().filter(|c| self.loops[*c].parent == Some(l)).collect()
  }

  /// Loops ordered so that every loop comes after the loops nested in it.
  pub fn innermost_first(&self) -> Vec<LoopIx> {
    let mut res: Vec<LoopIx> = self.loops.range().into_iter().collect();
    res.sort_by(|a, b| {
      self.loops[*b].depth.cmp(&self.loops[*a].depth).then(a.cmp(b))
    });
    res
  }

  /// Blocks of the loop in layout order.
  pub fn blocks_in_layout(&self, func: &Func, l: LoopIx) -> Vec<BlockIx> {
    func.layout.iter().cloned().filter(|b| self.loops[l].blocks.contains(*b)).collect()
  }

  /// The unique out-of-loop predecessor of the header, provided its only
  /// successor is the header.
  pub fn preheader(&self, func: &Func, l: LoopIx) -> Option<BlockIx> {
    let header = self.loops[l].header;
    let outside: Vec<BlockIx> = func
      .preds(header)
      .into_iter()
      .filter(|p| !self.loops[l].blocks.contains(*p))
      .collect();
    match outside.as_slice() {
      [p] if func.succs(*p).len() == 1 => Some(*p),
      _ => None,
    }
  }

  /// Blocks inside the loop with a successor outside it, in layout order.
  pub fn exiting_blocks(&self, func: &Func, l: LoopIx) -> Vec<BlockIx> {
    self
      .blocks_in_layout(func, l)
      .into_iter()
      .filter(|b| {
        func.succs(*b).iter().any(|s| !self.loops[l].blocks.contains(*s))
      })
      .collect()
  }

  /// In-loop predecessors of the header.
  pub fn latches(&self, func: &Func, l: LoopIx) -> Vec<BlockIx> {
    let header = self.loops[l].header;
    func
      .preds(header)
      .into_iter()
      .filter(|p| self.loops[l].blocks.contains(*p))
      .collect()
  }

  //---------------------------------------------------------------------------
  // Incremental updates

  fn add_block_where(&mut self, new: BlockIx, pred: impl Fn(&Loop) -> bool) {
    for l in self.loops.iter_mut() {
      if pred(l) {
        l.blocks.insert(new);
      }
    }
  }

  /// `new` holds the tail of `old`.
  pub fn update_after_split_block(&mut self, old: BlockIx, new: BlockIx) {
    self.add_block_where(new, |l| l.blocks.contains(old));
  }

  /// `new` sits on the edge `src -> dst`.
  pub fn update_after_split_edge(
    &mut self, src: BlockIx, new: BlockIx, dst: BlockIx,
  ) {
    self.add_block_where(new, |l| {
      l.blocks.contains(src) && l.blocks.contains(dst)
    });
  }

  /// `new` was split off `bb` to receive the edges from `preds`.
  pub fn update_after_split_preds(
    &mut self, bb: BlockIx, preds: &[BlockIx], new: BlockIx,
  ) {
    self.add_block_where(new, |l| {
      l.blocks.contains(bb) && preds.iter().all(|p| l.blocks.contains(*p))
    });
  }

  /// Registers clones of `blocks`, mapped through `bmap`.  Loops lying
  /// entirely inside `blocks` are duplicated; loops enclosing `blocks` gain
  /// the cloned blocks.  Returns the new loops.
  pub fn clone_loops_within(
    &mut self, blocks: &Set<BlockIx>, bmap: &Map<BlockIx, BlockIx>,
  ) -> Vec<LoopIx> {
    let nLoops = self.loops.len();
    let mut lmap = Map::<LoopIx, LoopIx>::default();
    let mut new_loops = vec![];

    // Parents come before their children, so the parent's clone (if any)
    // already exists.
    for l in LoopIx::new(0).dotdot(LoopIx::new(nLoops)) {
      let orig = self.loops[l].clone();
      if orig.blocks.is_subset_of(blocks) {
        let parent = orig.parent.map(|p| *lmap.get(&p).unwrap_or(&p));
        let depth = match parent {
          Some(p) => self.loops[p].depth + 1,
          None => 1,
        };
        let cloned = Set::from_vec(orig.blocks.iter().map(|b| bmap[b]).collect());
        let nl = self.loops.push(Loop {
          header: bmap[&orig.header],
          blocks: cloned,
          parent,
          depth,
        });
        lmap.insert(l, nl);
        new_loops.push(nl);
      } else if orig.blocks.intersects(blocks) {
        for b in blocks.iter() {
          if orig.blocks.contains(*b) {
            self.loops[l].blocks.insert(bmap[b]);
          }
        }
      }
    }
    new_loops
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;

  // entry -> outer: { inner: { inner } -> latch } -> exit
  fn nest() -> (Func, Map<&'static str, BlockIx>) {
    let mut f = Func::new("nest", Type::Void);
    let c = f.add_param("c", Type::I1);
    let mut m = Map::default();
    for name in &["entry", "outer", "inner", "latch", "exit"] {
      m.insert(*name, f.create_block(name));
    }
    f.append_inst(m["entry"], i_jump(m["outer"]), Type::Void, "");
    f.append_inst(m["outer"], i_jump(m["inner"]), Type::Void, "");
    f.append_inst(m["inner"], i_br(c, m["inner"], m["latch"]), Type::Void, "");
    f.append_inst(m["latch"], i_br(c, m["outer"], m["exit"]), Type::Void, "");
    f.append_inst(m["exit"], i_ret(None), Type::Void, "");
    (f, m)
  }

  fn loop_info(f: &Func) -> (DomTree, LoopInfo) {
    let cfg = CFGInfo::create(f).unwrap();
    let dt = DomTree::create(f, &cfg);
    let li = LoopInfo::create(f, &cfg, &dt);
    (dt, li)
  }

  #[test]
  fn nested_loops_are_found() {
    let (f, m) = nest();
    let (_, li) = loop_info(&f);
    assert_eq!(li.num_loops(), 2);
    let outer = li.loop_for(m["outer"]).unwrap();
    let inner = li.loop_for(m["inner"]).unwrap();
    assert_eq!(li.header(outer), m["outer"]);
    assert_eq!(li.parent(inner), Some(outer));
    assert!(li.contains_loop(outer, inner));
    assert_eq!(li.preheader(&f, outer), Some(m["entry"]));
    assert_eq!(li.preheader(&f, inner), Some(m["outer"]));
    assert_eq!(li.exiting_blocks(&f, outer), vec![m["latch"]]);
    assert_eq!(li.latches(&f, inner), vec![m["inner"]]);
    assert_eq!(li.innermost_first(), vec![inner, outer]);
    assert_eq!(li.loop_for(m["exit"]), None);
  }

  #[test]
  fn split_edge_keeps_membership() {
    let (mut f, m) = nest();
    let (_, mut li) = loop_info(&f);
    let mid = f.create_block_after("mid", m["inner"]);
    f.replace_successor(m["inner"], m["latch"], mid);
    f.append_inst(mid, i_jump(m["latch"]), Type::Void, "");
    li.update_after_split_edge(m["inner"], mid, m["latch"]);

    let (_, fresh) = loop_info(&f);
    let outer = li.loop_for(m["outer"]).unwrap();
    let fresh_outer = fresh.loop_for(m["outer"]).unwrap();
    assert!(li.loops[outer].blocks.equals(&fresh.loops[fresh_outer].blocks));
    assert_eq!(li.loop_for(mid), Some(outer));
  }
}
