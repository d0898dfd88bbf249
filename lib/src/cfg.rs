/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

use log::debug;

use crate::data_structures::{BlockIx, InstIx, Map, Set, TypedIxVec};
use crate::ir::Func;

#[derive(Clone, Debug)]
pub enum AnalysisError {
  /// The function has no blocks.
  EmptyFunction,

  /// A block is empty, does not end with a terminator, or has a terminator
  /// before its last instruction.
  MalformedBlock { block: String },

  /// A branch targets a block which is not part of the function's layout.
  DanglingSuccessor { from: String },

  /// At least one block is unreachable.
  UnreachableBlocks,

  /// The entry block is the target of a branch.
  EntryHasPredecessors,

  /// The transformed function failed verification.  This is a bug in the
  /// library, not in the input.
  VerifierFailed(String),
}

impl ToString for AnalysisError {
  fn to_string(&self) -> String {
    match self {
      AnalysisError::EmptyFunction => "function has no blocks".to_string(),
      AnalysisError::MalformedBlock { block } => {
        format!("block {} is not terminated properly", block)
      }
      AnalysisError::DanglingSuccessor { from } => {
        format!("block {} branches to a block outside the function", from)
      }
      AnalysisError::UnreachableBlocks => {
        "at least one block is unreachable".to_string()
      }
      AnalysisError::EntryHasPredecessors => {
        "the entry block has predecessors".to_string()
      }
      AnalysisError::VerifierFailed(msg) => {
        format!("verification of the transformed function failed: {}", msg)
      }
    }
  }
}

//=============================================================================
// Control-flow analysis results for a Func: predecessors, successors and
// DFS orders.

// CFGInfo contains CFG-related info computed from a Func.  It is a snapshot:
// any edit of the Func's control flow makes it stale.
pub struct CFGInfo {
  // Both maps contain one element per Block in the Func's block arena.
  // Blocks not in the layout have empty sets.
  pub pred_map: TypedIxVec<BlockIx, Set<BlockIx>>,
  pub succ_map: TypedIxVec<BlockIx, Set<BlockIx>>,

  // Pre- and post-order sequences.  Iterating forwards through these
  // vectors enumerates the blocks in preorder and postorder respectively.
  pub pre_ord: Vec<BlockIx>,
  pub post_ord: Vec<BlockIx>,
}

impl CFGInfo {
  #[inline(never)]
  pub fn create(func: &Func) -> Result<Self, AnalysisError> {
    let nBlocks = func.blocks.len();
    let entry = match func.entry_block() {
      Some(entry) => entry,
      None => return Err(AnalysisError::EmptyFunction),
    };

    let mut in_layout = Set::<BlockIx>::empty();
    for b in &func.layout {
      in_layout.insert(*b);
    }

    // === BEGIN sanity-check block shapes ===
    //
    for b in &func.layout {
      let insts = func.block_insts(*b);
      let bad = match insts.split_last() {
        None => true,
        Some((last, rest)) => {
          !func.kind(*last).is_terminator()
            || rest.iter().any(|i| func.kind(*i).is_terminator())
        }
      };
      if bad {
        return Err(AnalysisError::MalformedBlock {
          block: func.block_name(*b).to_string(),
        });
      }
    }
    //
    // === END sanity-check block shapes ===

    // === BEGIN compute successor and predecessor maps ===
    //
    let mut succ_map = TypedIxVec::<BlockIx, Set<BlockIx>>::new();
    succ_map.resize(nBlocks, Set::empty());
    for b in &func.layout {
      for s in func.succs(*b) {
        if !in_layout.contains(s) {
          return Err(AnalysisError::DanglingSuccessor {
            from: func.block_name(*b).to_string(),
          });
        }
        succ_map[*b].insert(s);
      }
    }

    // Now invert the mapping
    let mut pred_map = TypedIxVec::<BlockIx, Set<BlockIx>>::new();
    pred_map.resize(nBlocks, Set::empty());
    for b in &func.layout {
      for dst in succ_map[*b].to_vec() {
        pred_map[dst].insert(*b);
      }
    }
    if !pred_map[entry].is_empty() {
      return Err(AnalysisError::EntryHasPredecessors);
    }
    //
    // === END compute successor and predecessor maps ===

    // === BEGIN compute preord/postord sequences ===
    //
    // This is per Fig 7.12 of Muchnick 1997, with an explicit stack.
    //
    let (pre_ord, post_ord) = dfs_orders(&succ_map, entry);

    if pre_ord.len() != func.layout.len() {
      return Err(AnalysisError::UnreachableBlocks);
    }
    //
    // === END compute preord/postord sequences ===

    Ok(CFGInfo { pred_map, succ_map, pre_ord, post_ord })
  }
}

// Pre- and post-order of the nodes reachable from |start| in the graph
// described by |succ_map|.  Successors are visited in increasing index order
// so the result is deterministic.
fn dfs_orders(
  succ_map: &TypedIxVec<BlockIx, Set<BlockIx>>, start: BlockIx,
) -> (Vec<BlockIx>, Vec<BlockIx>) {
  let mut pre_ord = Vec::<BlockIx>::new();
  let mut post_ord = Vec::<BlockIx>::new();
  let mut visited = Set::<BlockIx>::empty();
  let mut stack = Vec::<(BlockIx, Vec<BlockIx>)>::new();

  visited.insert(start);
  pre_ord.push(start);
  let mut succs = succ_map[start].to_vec();
  succs.reverse();
  stack.push((start, succs));

  while let Some((bix, pending)) = stack.last_mut() {
    match pending.pop() {
      Some(succ) => {
        if !visited.contains(succ) {
          visited.insert(succ);
          pre_ord.push(succ);
          let mut succs = succ_map[succ].to_vec();
          succs.reverse();
          stack.push((succ, succs));
        }
      }
      None => {
        post_ord.push(*bix);
        stack.pop();
      }
    }
  }
  (pre_ord, post_ord)
}

// Calculate the dominance relationship, given |pred_map| and a start node
// |start|.  The resulting map sends each block in |post_ord| to the set of
// blocks that dominate it.  Nodes not in |post_ord| are ignored, which lets
// the same routine compute post-dominators on the reversed graph.  This
// algorithm is from Fig 7.14 of Muchnick 1997.
#[inline(never)]
fn calc_dominators(
  pred_map: &TypedIxVec<BlockIx, Set<BlockIx>>, post_ord: &[BlockIx],
  start: BlockIx,
) -> Map<BlockIx, Set<BlockIx>> {
  debug!("calc_dominators: begin");
  let nNodes = post_ord.len();
  let N: Set<BlockIx> = Set::from_vec(post_ord.to_vec());
  let mut dom_map = Map::<BlockIx, Set<BlockIx>>::default();
  for bixN in post_ord {
    if *bixN == start {
      dom_map.insert(*bixN, Set::unit(start));
    } else {
      dom_map.insert(*bixN, N.clone());
    }
  }
  let mut nnn = 0;
  loop {
    nnn += 1;
    debug!("calc_dominators:   outer loop {}", nnn);
    let mut change = false;
    for i in 0..nNodes {
      // bixN travels in "reverse postorder"
      let bixN = post_ord[nNodes - 1 - i];
      if bixN == start {
        continue;
      }
      let mut T = N.clone();
      for bixP in pred_map[bixN].iter() {
        if let Some(domP) = dom_map.get(bixP) {
          T.intersect(domP);
        }
      }
      T.insert(bixN);
      if !T.equals(&dom_map[&bixN]) {
        change = true;
        dom_map.insert(bixN, T);
      }
    }
    if !change {
      break;
    }
  }
  debug!("calc_dominators: end");
  dom_map
}

// The immediate dominator of a node is its strict dominator with the largest
// dominator set.
fn idoms_from_dom_sets(
  dom_map: &Map<BlockIx, Set<BlockIx>>,
) -> Map<BlockIx, Option<BlockIx>> {
  let mut idom = Map::default();
  for (bix, doms) in dom_map {
    let mut best: Option<BlockIx> = None;
    for d in doms.iter() {
      if d == bix {
        continue;
      }
      let better = match best {
        None => true,
        Some(b) => dom_map[d].card() > dom_map[&b].card(),
      };
      if better {
        best = Some(*d);
      }
    }
    idom.insert(*bix, best);
  }
  idom
}

//=============================================================================
// Dominator tree

/// Immediate-dominator tree of the blocks reachable from the entry.  It can
/// be repaired in place after the CFG edits done by region versioning.
#[derive(Clone, Debug, PartialEq)]
pub struct DomTree {
  entry: BlockIx,
  idom: Map<BlockIx, Option<BlockIx>>,
}

impl DomTree {
  #[inline(never)]
  pub fn create(func: &Func, cfg: &CFGInfo) -> Self {
    let entry = cfg.pre_ord[0];
    let dom_map = calc_dominators(&cfg.pred_map, &cfg.post_ord, entry);
    let idom = idoms_from_dom_sets(&dom_map);
    debug_assert!(idom.len() == func.layout.len());
    DomTree { entry, idom }
  }

  pub fn from_func(func: &Func) -> Result<Self, AnalysisError> {
    let cfg = CFGInfo::create(func)?;
    Ok(Self::create(func, &cfg))
  }

  pub fn entry(&self) -> BlockIx {
    self.entry
  }

  pub fn has_node(&self, b: BlockIx) -> bool {
    self.idom.contains_key(&b)
  }

  pub fn idom(&self, b: BlockIx) -> Option<BlockIx> {
    self.idom.get(&b).cloned().flatten()
  }

  pub fn dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    if !self.has_node(a) || !self.has_node(b) {
      return false;
    }
    let mut cur = Some(b);
    while let Some(c) = cur {
      if c == a {
        return true;
      }
      cur = self.idom(c);
    }
    false
  }

  pub fn properly_dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    a != b && self.dominates(a, b)
  }

  /// Does the value defined by `def` dominate the point just before `user`?
  pub fn inst_dominates(&self, func: &Func, def: InstIx, user: InstIx) -> bool {
    match (func.inst_block(def), func.inst_block(user)) {
      (Some(bd), Some(bu)) => {
        if bd == bu {
          func.inst_pos(def) < func.inst_pos(user)
        } else {
          self.dominates(bd, bu)
        }
      }
      _ => false,
    }
  }

  pub fn nearest_common_dominator(
    &self, a: BlockIx, b: BlockIx,
  ) -> Option<BlockIx> {
    let mut ancestors = Set::<BlockIx>::empty();
    let mut cur = Some(a);
    while let Some(c) = cur {
      ancestors.insert(c);
      cur = self.idom(c);
    }
    let mut cur = Some(b);
    while let Some(c) = cur {
      if ancestors.contains(c) {
        return Some(c);
      }
      cur = self.idom(c);
    }
    None
  }

  pub fn children(&self, b: BlockIx) -> Vec<BlockIx> {
    let mut res: Vec<BlockIx> = self
      .idom
      .iter()
      .filter(|(_, d)| **d == Some(b))
      .map(|(c, _)| *c)
      .collect();
    res.sort_unstable();
    res
  }

  pub fn add_new_block(&mut self, b: BlockIx, idom: BlockIx) {
    debug_assert!(!self.has_node(b));
    self.idom.insert(b, Some(idom));
  }

  pub fn change_idom(&mut self, b: BlockIx, new_idom: BlockIx) {
    debug_assert!(self.has_node(b) && self.has_node(new_idom));
    self.idom.insert(b, Some(new_idom));
  }

  /// `new` holds the tail of `old` after `Func::split_block`.
  pub fn update_after_split_block(&mut self, old: BlockIx, new: BlockIx) {
    for c in self.children(old) {
      self.idom.insert(c, Some(new));
    }
    self.add_new_block(new, old);
  }

  /// `new` was placed on the edge `src -> dst`.
  pub fn update_after_split_edge(
    &mut self, func: &Func, src: BlockIx, new: BlockIx, dst: BlockIx,
  ) {
    self.add_new_block(new, src);
    let dominated = func
      .preds(dst)
      .iter()
      .all(|p| *p == new || self.dominates(dst, *p));
    if dominated {
      self.change_idom(dst, new);
    }
  }

  /// `new` was created as the single predecessor of `bb` on behalf of
  /// `preds`.
  pub fn update_after_split_preds(
    &mut self, func: &Func, bb: BlockIx, preds: &[BlockIx], new: BlockIx,
  ) {
    let mut nca = preds[0];
    for p in &preds[1..] {
      if let Some(d) = self.nearest_common_dominator(nca, *p) {
        nca = d;
      }
    }
    self.add_new_block(new, nca);
    let dominated = func
      .preds(bb)
      .iter()
      .all(|p| *p == new || self.dominates(bb, *p));
    if dominated {
      self.change_idom(bb, new);
    }
  }
}

//=============================================================================
// Post-dominator tree

/// Post-dominators, computed on the reversed CFG with a virtual exit node
/// that every returning block flows into.  `ipdom(b) == None` means the
/// virtual exit.  Blocks that cannot reach a return have no entry.
#[derive(Clone, Debug)]
pub struct PostDomTree {
  ipdom: Map<BlockIx, Option<BlockIx>>,
}

impl PostDomTree {
  #[inline(never)]
  pub fn create(func: &Func, cfg: &CFGInfo) -> Self {
    let nBlocks = func.blocks.len();
    let virt = BlockIx::new(nBlocks);

    // The reversed graph: successors are predecessors and the virtual exit
    // leads to every returning block.
    let mut rsucc = TypedIxVec::<BlockIx, Set<BlockIx>>::new();
    let mut rpred = TypedIxVec::<BlockIx, Set<BlockIx>>::new();
    rsucc.resize(nBlocks + 1, Set::empty());
    rpred.resize(nBlocks + 1, Set::empty());
    for b in &func.layout {
      rsucc[*b] = cfg.pred_map[*b].clone();
      rpred[*b] = cfg.succ_map[*b].clone();
    }
    for b in func.return_blocks() {
      rsucc[virt].insert(b);
      rpred[b].insert(virt);
    }

    let (_, post_ord) = dfs_orders(&rsucc, virt);
    let pdom_map = calc_dominators(&rpred, &post_ord, virt);
    let mut ipdom = Map::default();
    for (b, d) in idoms_from_dom_sets(&pdom_map) {
      if b == virt {
        continue;
      }
      ipdom.insert(b, if d == Some(virt) { None } else { d });
    }
    PostDomTree { ipdom }
  }

  pub fn has_node(&self, b: BlockIx) -> bool {
    self.ipdom.contains_key(&b)
  }

  pub fn ipdom(&self, b: BlockIx) -> Option<BlockIx> {
    self.ipdom.get(&b).cloned().flatten()
  }

  pub fn post_dominates(&self, a: BlockIx, b: BlockIx) -> bool {
    if !self.has_node(a) || !self.has_node(b) {
      return false;
    }
    let mut cur = Some(b);
    while let Some(c) = cur {
      if c == a {
        return true;
      }
      cur = self.ipdom(c);
    }
    false
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;

  // entry -> (left | right) -> join -> ret
  fn diamond() -> (Func, Vec<BlockIx>) {
    let mut f = Func::new("diamond", Type::Void);
    let c = f.add_param("c", Type::I1);
    let entry = f.create_block("entry");
    let left = f.create_block("left");
    let right = f.create_block("right");
    let join = f.create_block("join");
    f.append_inst(entry, i_br(c, left, right), Type::Void, "");
    f.append_inst(left, i_jump(join), Type::Void, "");
    f.append_inst(right, i_jump(join), Type::Void, "");
    f.append_inst(join, i_ret(None), Type::Void, "");
    (f, vec![entry, left, right, join])
  }

  #[test]
  fn dominators_of_a_diamond() {
    let (f, b) = diamond();
    let cfg = CFGInfo::create(&f).unwrap();
    let dt = DomTree::create(&f, &cfg);
    assert_eq!(dt.idom(b[0]), None);
    assert_eq!(dt.idom(b[1]), Some(b[0]));
    assert_eq!(dt.idom(b[3]), Some(b[0]));
    assert!(dt.dominates(b[0], b[3]));
    assert!(!dt.dominates(b[1], b[3]));
    assert_eq!(dt.nearest_common_dominator(b[1], b[2]), Some(b[0]));

    let pdt = PostDomTree::create(&f, &cfg);
    assert_eq!(pdt.ipdom(b[0]), Some(b[3]));
    assert_eq!(pdt.ipdom(b[3]), None);
    assert!(pdt.post_dominates(b[3], b[1]));
  }

  #[test]
  fn unreachable_blocks_are_rejected() {
    let (mut f, _) = diamond();
    let dead = f.create_block("dead");
    f.append_inst(dead, i_ret(None), Type::Void, "");
    match CFGInfo::create(&f) {
      Err(AnalysisError::UnreachableBlocks) => {}
      _ => panic!("expected an error"),
    }
  }

  #[test]
  fn split_edge_repair_matches_recomputation() {
    let (mut f, b) = diamond();
    let mut dt = DomTree::from_func(&f).unwrap();
    // Put a block on left -> join.
    let mid = f.create_block_after("mid", b[1]);
    f.replace_successor(b[1], b[3], mid);
    f.append_inst(mid, i_jump(b[3]), Type::Void, "");
    dt.update_after_split_edge(&f, b[1], mid, b[3]);
    assert_eq!(dt, DomTree::from_func(&f).unwrap());

    let t = f.terminator(b[0]).unwrap();
    let tail = f.split_block(b[0], t, "entry.tail");
    dt.update_after_split_block(b[0], tail);
    assert_eq!(dt, DomTree::from_func(&f).unwrap());
  }
}
