/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Single-entry single-exit regions, organized as a tree.
//!
//! A region is given by an entry block and an exit block; the exit is the
//! first block after the region and is not part of it.  The top-level region
//! covers the whole function and has no exit.  Membership is computed from
//! the dominator tree, so a region stays meaningful while the CFG is being
//! edited, as long as the dominator tree is kept up to date.

#![allow(non_snake_case)]

use log::debug;

use crate::cfg::{CFGInfo, DomTree, PostDomTree};
use crate::data_structures::{BlockIx, InstIx, LoopIx, RegionIx, Set, TypedIxVec};
use crate::ir::Func;
use crate::loops::LoopInfo;

#[derive(Clone, Debug)]
pub struct Region {
  pub entry: BlockIx,
  /// `None` for the top-level region.
  pub exit: Option<BlockIx>,
  pub parent: Option<RegionIx>,
  /// In creation order.
  pub children: Vec<RegionIx>,
}

#[derive(Clone, Debug)]
pub struct RegionInfo {
  pub regions: TypedIxVec<RegionIx, Region>,
  top: RegionIx,
}

// The blocks of the region (entry, exit) if it is a valid single-entry
// single-exit region.  Every block reachable from |entry| without passing
// |exit| must be dominated by |entry|, and only |entry| may have
// predecessors from outside.
fn sese_blocks(
  cfg: &CFGInfo, dt: &DomTree, entry: BlockIx, exit: BlockIx,
) -> Option<Set<BlockIx>> {
  if entry == exit {
    return None;
  }
  let mut blocks = Set::unit(entry);
  let mut stack = vec![entry];
  while let Some(b) = stack.pop() {
    for s in cfg.succ_map[b].iter() {
      if *s != exit && !blocks.contains(*s) {
        if !dt.dominates(entry, *s) {
          return None;
        }
        blocks.insert(*s);
        stack.push(*s);
      }
    }
  }
  for b in blocks.iter() {
    if *b == entry {
      continue;
    }
    if cfg.pred_map[*b].iter().any(|p| !blocks.contains(*p)) {
      return None;
    }
  }
  Some(blocks)
}

// A region made of a single block that falls into its exit.
fn is_trivial(cfg: &CFGInfo, entry: BlockIx, exit: BlockIx) -> bool {
  let succs = &cfg.succ_map[entry];
  succs.card() <= 1 && succs.contains(exit)
}

impl RegionInfo {
  #[inline(never)]
  pub fn create(
    func: &Func, cfg: &CFGInfo, dt: &DomTree, pdt: &PostDomTree,
  ) -> Self {
    let layout_pos = |b: BlockIx| func.layout.iter().position(|x| *x == b);

    // === BEGIN find candidate regions ===
    //
    // For every entry, try the exits along its post-dominator chain.  Stop
    // once the entry no longer dominates the exit: nothing further along
    // can be single-entry.
    let mut candidates = Vec::<(BlockIx, BlockIx, Set<BlockIx>)>::new();
    for entry in &func.layout {
      let mut exit = pdt.ipdom(*entry);
      while let Some(x) = exit {
        if !is_trivial(cfg, *entry, x) {
          if let Some(blocks) = sese_blocks(cfg, dt, *entry, x) {
            candidates.push((*entry, x, blocks));
          }
        }
        if !dt.dominates(*entry, x) {
          break;
        }
        exit = pdt.ipdom(x);
      }
    }
    //
    // === END find candidate regions ===

    // === BEGIN build the region tree ===
    //
    // Largest regions first, so that every region's parent is already in
    // the tree when the region is inserted.
    candidates.sort_by(|(e1, _, s1), (e2, _, s2)| {
      s2.card().cmp(&s1.card()).then(layout_pos(*e1).cmp(&layout_pos(*e2)))
    });

    let mut all = Set::<BlockIx>::empty();
    for b in &func.layout {
      all.insert(*b);
    }
    let mut regions = TypedIxVec::<RegionIx, Region>::new();
    let mut region_blocks = Vec::<Set<BlockIx>>::new();
    let top = regions.push(Region {
      entry: func.layout[0],
      exit: None,
      parent: None,
      children: vec![],
    });
    region_blocks.push(all);

    for (entry, exit, blocks) in candidates {
      let mut parent: Option<RegionIx> = None;
      let mut overlaps = false;
      for (ix, other) in region_blocks.iter().enumerate() {
        if blocks.is_subset_of(other) {
          let better = match parent {
            None => true,
            Some(p) => other.card() < region_blocks[p.get() as usize].card(),
          };
          if better {
            parent = Some(RegionIx::new(ix as u32));
          }
        } else if blocks.intersects(other) {
          overlaps = true;
        }
      }
      let parent = match parent {
        Some(p) if !overlaps => p,
        _ => {
          debug!("RegionInfo: dropping overlapping region {:?} => {:?}", entry, exit);
          continue;
        }
      };
      let r = regions.push(Region {
        entry,
        exit: Some(exit),
        parent: Some(parent),
        children: vec![],
      });
      regions[parent].children.push(r);
      region_blocks.push(blocks);
    }

    for r in regions.range() {
      let mut children = regions[r].children.clone();
      children.sort_by_key(|c| layout_pos(regions[*c].entry));
      regions[r].children = children;
    }
    //
    // === END build the region tree ===

    let ri = RegionInfo { regions, top };
    for r in ri.regions.range() {
      debug!("RegionInfo: {:?} = {}", r, ri.name(func, r));
    }
    ri
  }

  pub fn top_level(&self) -> RegionIx {
    self.top
  }

  pub fn num_regions(&self) -> usize {
    self.regions.len() as usize
  }

  pub fn entry(&self, r: RegionIx) -> BlockIx {
    self.regions[r].entry
  }

  pub fn exit(&self, r: RegionIx) -> Option<BlockIx> {
    self.regions[r].exit
  }

  pub fn parent(&self, r: RegionIx) -> Option<RegionIx> {
    self.regions[r].parent
  }

  pub fn children(&self, r: RegionIx) -> &[RegionIx] {
    &self.regions[r].children
  }

  pub fn is_top_level(&self, r: RegionIx) -> bool {
    self.regions[r].parent.is_none()
  }

  /// Regions of the tree, parents before children.
  pub fn preorder(&self) -> Vec<RegionIx> {
    let mut res = vec![];
    let mut stack = vec![self.top];
    while let Some(r) = stack.pop() {
      res.push(r);
      for c in self.regions[r].children.iter().rev() {
        stack.push(*c);
      }
    }
    res
  }

  pub fn name(&self, func: &Func, r: RegionIx) -> String {
    let exit = match self.regions[r].exit {
      Some(x) => func.block_name(x).to_string(),
      None => "<Function Return>".to_string(),
    };
    format!("{} => {}", func.block_name(self.regions[r].entry), exit)
  }

  pub fn contains(&self, dt: &DomTree, r: RegionIx, b: BlockIx) -> bool {
    if !dt.has_node(b) {
      return false;
    }
    let region = &self.regions[r];
    match region.exit {
      None => dt.dominates(region.entry, b),
      Some(exit) => {
        dt.dominates(region.entry, b)
          && !(dt.dominates(exit, b) && dt.dominates(region.entry, exit))
      }
    }
  }

  pub fn contains_inst(
    &self, func: &Func, dt: &DomTree, r: RegionIx, i: InstIx,
  ) -> bool {
    match func.inst_block(i) {
      Some(b) => self.contains(dt, r, b),
      None => false,
    }
  }

  /// Is the whole loop inside the region?
  pub fn contains_loop(
    &self, dt: &DomTree, li: &LoopInfo, r: RegionIx, l: LoopIx,
  ) -> bool {
    li.loops[l].blocks.iter().all(|b| self.contains(dt, r, *b))
  }

  /// Blocks of the region in layout order.
  pub fn blocks(&self, func: &Func, dt: &DomTree, r: RegionIx) -> Vec<BlockIx> {
    func.layout.iter().cloned().filter(|b| self.contains(dt, r, *b)).collect()
  }

  /// The single predecessor of the entry lying outside the region.
  pub fn entering_block(
    &self, func: &Func, dt: &DomTree, r: RegionIx,
  ) -> Option<BlockIx> {
    let outside: Vec<BlockIx> = func
      .preds(self.regions[r].entry)
      .into_iter()
      .filter(|p| !self.contains(dt, r, *p))
      .collect();
    match outside.as_slice() {
      [p] => Some(*p),
      _ => None,
    }
  }

  /// The single predecessor of the exit lying inside the region.
  pub fn exiting_block(
    &self, func: &Func, dt: &DomTree, r: RegionIx,
  ) -> Option<BlockIx> {
    let exit = self.regions[r].exit?;
    let inside: Vec<BlockIx> = func
      .preds(exit)
      .into_iter()
      .filter(|p| self.contains(dt, r, *p))
      .collect();
    match inside.as_slice() {
      [p] => Some(*p),
      _ => None,
    }
  }

  /// Sets the entry of `r`, and of every descendant sharing `r`'s old entry.
  pub fn replace_entry_recursive(&mut self, r: RegionIx, new_entry: BlockIx) {
    let old_entry = self.regions[r].entry;
    let mut queue = vec![r];
    while let Some(q) = queue.pop() {
      self.regions[q].entry = new_entry;
      for c in &self.regions[q].children {
        if self.regions[*c].entry == old_entry {
          queue.push(*c);
        }
      }
    }
  }

  /// Sets the exit of `r`, and of every descendant sharing `r`'s old exit.
  pub fn replace_exit_recursive(&mut self, r: RegionIx, new_exit: BlockIx) {
    let old_exit = self.regions[r].exit;
    let mut queue = vec![r];
    while let Some(q) = queue.pop() {
      self.regions[q].exit = Some(new_exit);
      for c in &self.regions[q].children {
        if self.regions[*c].exit == old_exit {
          queue.push(*c);
        }
      }
    }
  }

  /// Adds a new child of `parent`.  It goes last in the parent's children.
  pub fn add_region(
    &mut self, entry: BlockIx, exit: Option<BlockIx>, parent: RegionIx,
  ) -> RegionIx {
    let r = self.regions.push(Region {
      entry,
      exit,
      parent: Some(parent),
      children: vec![],
    });
    self.regions[parent].children.push(r);
    r
  }

  /// Adds a region which is not linked into the tree.  It answers membership
  /// queries like any other region but is never visited by a traversal.
  pub fn add_detached_region(
    &mut self, entry: BlockIx, exit: Option<BlockIx>, parent: Option<RegionIx>,
  ) -> RegionIx {
    self.regions.push(Region { entry, exit, parent, children: vec![] })
  }

  /// The region obtained by dropping the first block of `r`: it starts at
  /// the second block of `r` in layout order and ends at the furthest exit
  /// that still yields a valid region inside `r`.
  pub fn reduced_region(
    &self, func: &Func, cfg: &CFGInfo, dt: &DomTree, pdt: &PostDomTree,
    r: RegionIx,
  ) -> Option<(BlockIx, BlockIx)> {
    let blocks = self.blocks(func, dt, r);
    if blocks.len() < 2 {
      return None;
    }
    let entry = blocks[1];
    let outer_exit = self.regions[r].exit;
    let mut best = None;
    let mut exit = pdt.ipdom(entry);
    while let Some(x) = exit {
      let inside = self.contains(dt, r, x) || Some(x) == outer_exit;
      if !inside {
        break;
      }
      if let Some(reduced) = sese_blocks(cfg, dt, entry, x) {
        if reduced.iter().all(|b| self.contains(dt, r, *b)) {
          best = Some((entry, x));
        }
      }
      if Some(x) == outer_exit || !dt.dominates(entry, x) {
        break;
      }
      exit = pdt.ipdom(x);
    }
    best
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;

  // entry -> pre -> { head <-> body } -> post -> ret
  fn single_loop() -> (Func, Vec<BlockIx>) {
    let mut f = Func::new("single_loop", Type::Void);
    let c = f.add_param("c", Type::I1);
    let names = ["entry", "pre", "head", "body", "post"];
    let b: Vec<BlockIx> = names.iter().map(|n| f.create_block(n)).collect();
    f.append_inst(b[0], i_jump(b[1]), Type::Void, "");
    f.append_inst(b[1], i_jump(b[2]), Type::Void, "");
    f.append_inst(b[2], i_br(c, b[3], b[4]), Type::Void, "");
    f.append_inst(b[3], i_jump(b[2]), Type::Void, "");
    f.append_inst(b[4], i_ret(None), Type::Void, "");
    (f, b)
  }

  fn analyses(f: &Func) -> (CFGInfo, DomTree, PostDomTree, RegionInfo) {
    let cfg = CFGInfo::create(f).unwrap();
    let dt = DomTree::create(f, &cfg);
    let pdt = PostDomTree::create(f, &cfg);
    let ri = RegionInfo::create(f, &cfg, &dt, &pdt);
    (cfg, dt, pdt, ri)
  }

  #[test]
  fn loop_region_is_found() {
    let (f, b) = single_loop();
    let (_, dt, _, ri) = analyses(&f);
    let top = ri.top_level();
    assert!(ri.is_top_level(top));
    let loop_region = ri
      .regions
      .range()
      .into_iter()
      .find(|r| ri.entry(*r) == b[2] && ri.exit(*r) == Some(b[4]))
      .unwrap();
    assert_eq!(ri.blocks(&f, &dt, loop_region), vec![b[2], b[3]]);
    assert_eq!(ri.entering_block(&f, &dt, loop_region), Some(b[1]));
    assert_eq!(ri.exiting_block(&f, &dt, loop_region), Some(b[2]));
    assert!(!ri.contains(&dt, loop_region, b[4]));
    assert_eq!(ri.name(&f, loop_region), "head => post");
    // Every region lies inside its parent.
    for r in ri.preorder() {
      if let Some(p) = ri.parent(r) {
        for blk in ri.blocks(&f, &dt, r) {
          assert!(ri.contains(&dt, p, blk));
        }
      }
    }
    assert_eq!(ri.blocks(&f, &dt, top).len(), 5);
  }

  #[test]
  fn replace_exit_follows_children() {
    let (f, b) = single_loop();
    let (_, _, _, mut ri) = analyses(&f);
    let r = ri
      .regions
      .range()
      .into_iter()
      .find(|r| ri.exit(*r) == Some(b[4]) && ri.entry(*r) == b[1])
      .unwrap();
    let child = ri.children(r)[0];
    assert_eq!(ri.entry(child), b[2]);
    ri.replace_exit_recursive(r, b[3]);
    assert_eq!(ri.exit(r), Some(b[3]));
    assert_eq!(ri.exit(child), Some(b[3]));
    // The enclosing region keeps its exit.
    assert_eq!(ri.exit(ri.parent(r).unwrap()), Some(b[4]));
  }

  #[test]
  fn reduced_region_drops_the_first_block() {
    let (f, b) = single_loop();
    let (cfg, dt, pdt, ri) = analyses(&f);
    let r = ri
      .regions
      .range()
      .into_iter()
      .find(|r| ri.entry(*r) == b[1] && ri.exit(*r) == Some(b[4]))
      .unwrap();
    assert_eq!(ri.reduced_region(&f, &cfg, &dt, &pdt, r), Some((b[2], b[4])));
  }
}
