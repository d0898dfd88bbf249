/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Duplication of a single-entry single-exit region.

#![allow(non_snake_case)]

use log::{debug, trace};

use crate::cfg::DomTree;
use crate::data_structures::{BlockIx, InstIx, LoopIx, Map, RegionIx, Set, ValueIx};
use crate::interface::FuncAnalyses;
use crate::ir::{Func, InstKind, Type};

/// A region and its copy.  Both run into the same exit, where every value
/// defined in the region and used after it is merged by a two-way phi.
#[derive(Clone, Debug)]
pub struct ClonedRegion {
  pub original: RegionIx,
  pub cloned: RegionIx,
  /// Original block to its copy.
  pub block_map: Map<BlockIx, BlockIx>,
  /// Original value to its copy, for values defined in the region.
  pub value_map: Map<ValueIx, ValueIx>,
  /// Phis created at the exit for values live out of the region.
  pub merge_phis: Vec<ValueIx>,
  pub new_loops: Vec<LoopIx>,
}

// Gives the copy of `b` its immediate dominator: the copy of `b`'s idom, or
// the idom itself when it lies outside the region.
fn clone_dominator_info(dt: &mut DomTree, b: BlockIx, bmap: &Map<BlockIx, BlockIx>) {
  let nb = bmap[&b];
  if dt.has_node(nb) {
    return;
  }
  let dom = match dt.idom(b) {
    Some(d) => d,
    None => panic!("clone_dominator_info: {:?} has no dominator", b),
  };
  let new_dom = match bmap.get(&dom) {
    Some(nd) => {
      clone_dominator_info(dt, dom, bmap);
      *nd
    }
    None => dom,
  };
  dt.add_new_block(nb, new_dom);
}

/// Copies region `r` of `func`.  The copies of its blocks are laid out
/// right before its entry; the copy's entry is left without predecessors,
/// for the caller to branch to.  `r` must have an exit and a single exiting
/// block.  The dominator tree (assuming the copy is entered from the same
/// block as the original), loop info and region tree are updated; the copy
/// is registered as a detached region.
#[inline(never)]
pub fn clone_region(func: &mut Func, an: &mut FuncAnalyses, r: RegionIx) -> ClonedRegion {
  let entry = an.ri.entry(r);
  let exit = match an.ri.exit(r) {
    Some(x) => x,
    None => panic!("clone_region: region {} has no exit", an.ri.name(func, r)),
  };
  let exiting = match an.ri.exiting_block(func, &an.dt, r) {
    Some(x) => x,
    None => panic!("clone_region: region {} has no exiting block", an.ri.name(func, r)),
  };
  let blocks = an.ri.blocks(func, &an.dt, r);

  // === BEGIN find outputs ===
  //
  // Values defined in the region and used outside of it.
  let mut outputs = Vec::<ValueIx>::new();
  for b in &blocks {
    for i in func.block_insts(*b) {
      if let Some(v) = func.insts[*i].result {
        let escapes = func
          .users(v)
          .iter()
          .any(|u| !an.ri.contains_inst(func, &an.dt, r, *u));
        if escapes {
          outputs.push(v);
        }
      }
    }
  }
  //
  // === END find outputs ===

  // === BEGIN copy blocks ===
  //
  let mut bmap = Map::<BlockIx, BlockIx>::default();
  let mut vmap = Map::<ValueIx, ValueIx>::default();
  let mut new_blocks = vec![];
  for b in &blocks {
    let name = format!("{}.clone", func.block_name(*b));
    let nb = func.create_block_before(&name, entry);
    bmap.insert(*b, nb);
    new_blocks.push(nb);
    let insts: Vec<InstIx> = func.block_insts(*b).to_vec();
    for i in insts {
      let kind = func.kind(i).clone();
      let (ty, name) = match func.insts[i].result {
        Some(v) => (func.value_ty(v), format!("{}.clone", func.value_name(v))),
        None => (Type::Void, String::new()),
      };
      let ni = func.append_inst(nb, kind, ty, &name);
      func.insts[ni].alias_scopes = func.insts[i].alias_scopes.clone();
      func.insts[ni].noalias = func.insts[i].noalias.clone();
      if let (Some(v), Some(nv)) = (func.insts[i].result, func.insts[ni].result) {
        vmap.insert(v, nv);
      }
    }
  }
  //
  // === END copy blocks ===

  for b in &blocks {
    clone_dominator_info(&mut an.dt, *b, &bmap);
  }

  // Operands and block references of the copies point into the copy.
  for nb in &new_blocks {
    for i in func.block_insts(*nb).to_vec() {
      let kind = &mut func.insts[i].kind;
      kind.map_operands(|v| vmap.get(&v).cloned().unwrap_or(v));
      kind.map_blocks(|b| bmap.get(&b).cloned().unwrap_or(b));
    }
  }

  // === BEGIN exit phis ===
  //
  // Phis after the region that take a value from an original block take the
  // corresponding value from the copied block too.
  let mut updated_phis = Set::<InstIx>::empty();
  for b in &blocks {
    for succ in func.succs(*b) {
      if an.ri.contains(&an.dt, r, succ) {
        continue;
      }
      for phi in func.phis(succ) {
        let incoming = match func.kind(phi) {
          InstKind::Phi { incoming } => incoming.clone(),
          _ => continue,
        };
        for (ib, iv) in incoming {
          if ib != *b {
            continue;
          }
          let cloned = vmap.get(&iv).cloned().unwrap_or(iv);
          if let InstKind::Phi { incoming } = &mut func.insts[phi].kind {
            incoming.push((bmap[b], cloned));
          }
          updated_phis.insert(phi);
        }
      }
    }
  }
  //
  // === END exit phis ===

  // === BEGIN merge live-out values ===
  //
  let cloned_exiting = bmap[&exiting];
  let mut merge_phis = vec![];
  for v in &outputs {
    let users: Vec<InstIx> = func
      .users(*v)
      .into_iter()
      .filter(|u| {
        !an.ri.contains_inst(func, &an.dt, r, *u) && !updated_phis.contains(*u)
      })
      .collect();
    if users.is_empty() {
      continue;
    }
    let ty = func.value_ty(*v);
    let name = format!("{}.merge", func.value_name(*v));
    let incoming = vec![(exiting, *v), (cloned_exiting, vmap[v])];
    let phi = func.insert_inst_at_start(exit, InstKind::Phi { incoming }, ty, &name);
    let pv = func.inst_result(phi);
    for u in users {
      func.replace_uses_of_with(u, *v, pv);
    }
    trace!("clone_region: merging {} at {}", func.display_value(*v), func.block_name(exit));
    merge_phis.push(pv);
  }
  //
  // === END merge live-out values ===

  // The exit is now reached from both copies.
  let preds = func.preds(exit);
  let mut nca = preds[0];
  for p in &preds[1..] {
    if let Some(d) = an.dt.nearest_common_dominator(nca, *p) {
      nca = d;
    }
  }
  an.dt.change_idom(exit, nca);

  let block_set = Set::from_vec(blocks.clone());
  let new_loops = an.li.clone_loops_within(&block_set, &bmap);
  let parent = an.ri.parent(r);
  let cloned = an.ri.add_detached_region(bmap[&entry], Some(exit), parent);

  debug!(
    "clone_region: {} copied as {}: {} block(s), {} live-out value(s), {} loop(s)",
    an.ri.name(func, r),
    an.ri.name(func, cloned),
    blocks.len(),
    merge_phis.len(),
    new_loops.len()
  );

  ClonedRegion {
    original: r,
    cloned,
    block_map: bmap,
    value_map: vmap,
    merge_phis,
    new_loops,
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;
  use crate::test_utils::shifted_copy;

  #[test]
  fn copies_have_the_same_shape() {
    let mut f = shifted_copy();
    let mut an = FuncAnalyses::compute(&f).unwrap();
    let head = f.block_by_name("head").unwrap();
    let exit = f.block_by_name("exit").unwrap();
    let r = an
      .ri
      .preorder()
      .into_iter()
      .find(|r| an.ri.entry(*r) == head && an.ri.exit(*r) == Some(exit))
      .unwrap();
    let n_blocks = f.layout.len();
    let orig_blocks = an.ri.blocks(&f, &an.dt, r);

    let cr = clone_region(&mut f, &mut an, r);

    assert_eq!(f.layout.len(), n_blocks + orig_blocks.len());
    for b in &orig_blocks {
      let nb = cr.block_map[b];
      assert_eq!(f.block_insts(*b).len(), f.block_insts(nb).len());
      assert_eq!(f.block_name(nb), format!("{}.clone", f.block_name(*b)));
      // The copy refers only to copied blocks and values.
      for i in f.block_insts(nb) {
        for op in f.kind(*i).operands() {
          assert!(!cr.value_map.contains_key(&op));
        }
        for s in f.kind(*i).successors() {
          assert!(!orig_blocks.contains(&s) || s == exit);
        }
      }
    }
    // Copies sit right before the original entry.
    let pos = |b: BlockIx| f.layout.iter().position(|x| *x == b).unwrap();
    assert_eq!(pos(cr.block_map[&head]) + orig_blocks.len(), pos(head));

    // `i` is returned after the loop: one merge phi with two inputs.
    assert_eq!(cr.merge_phis.len(), 1);
    let merge = f.def_inst(cr.merge_phis[0]).unwrap();
    match f.kind(merge) {
      InstKind::Phi { incoming } => assert_eq!(incoming.len(), 2),
      _ => panic!("merge value is not a phi"),
    }
    let ret = f.terminator(exit).unwrap();
    assert_eq!(f.kind(ret).operands()[0], cr.merge_phis[0]);
    assert_eq!(an.li.num_loops(), 2);
    assert_eq!(cr.new_loops.len(), 1);
  }

  #[test]
  fn dominators_match_a_recomputation() {
    let mut f = shifted_copy();
    let mut an = FuncAnalyses::compute(&f).unwrap();
    let entry = f.entry_block().unwrap();
    let head = f.block_by_name("head").unwrap();
    let r = an
      .ri
      .preorder()
      .into_iter()
      .find(|r| an.ri.entry(*r) == head && an.ri.exit(*r).is_some())
      .unwrap();
    let cr = clone_region(&mut f, &mut an, r);

    // Enter the copy from the same block as the original.
    let n = f.params[2];
    let zero = f.iconst(Type::I64, 0);
    let jump = f.terminator(entry).unwrap();
    f.remove_inst(jump);
    let c = f.ins(entry, i_icmp(IntCC::Sgt, n, zero), Type::I1, "c");
    f.append_inst(entry, i_br(c, head, cr.block_map[&head]), Type::Void, "");

    let fresh = DomTree::from_func(&f).unwrap();
    assert_eq!(an.dt, fresh);
    assert!(crate::verify::verify_func(&f).is_ok());
  }
}
