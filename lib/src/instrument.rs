/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Region versioning.
//!
//! A region whose base pointers may alias is duplicated.  A guard block in
//! front of it checks at run time that the byte ranges the pointers access
//! are pairwise disjoint.  When they are, control goes to the original
//! region, whose accesses are tagged with alias scopes stating that
//! accesses through different base pointers do not alias; otherwise it goes
//! to the untagged copy.

#![allow(non_snake_case)]

use log::{debug, info, trace};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::alias::{select_pairs, AliasOracle};
use crate::bounds::BoundBuilder;
use crate::clone::clone_region;
use crate::data_structures::{BlockIx, InstIx, Map, RegionIx, Set, ValueIx};
use crate::interface::FuncAnalyses;
use crate::ir::{i_binary, i_icmp, BinOp, Func, InstKind, IntCC, Type};
use crate::range_analysis::{PtrRangeAnalysis, RegionRangeInfo};
use crate::scev::ScalarEvolution;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum InstrumentationMode {
  /// Version the outermost regions with full side-effect info.
  Region,
  /// Version the outermost eligible regions, whether or not every memory
  /// effect in them is characterized.
  Function,
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct InstrumentStats {
  pub total_loops: u32,
  /// Loops inside versioned regions.
  pub cloned_loops: u32,
  pub cloned_regions: u32,
  pub pairwise_checks: u32,
}

impl InstrumentStats {
  pub fn accumulate(&mut self, other: &InstrumentStats) {
    self.total_loops += other.total_loops;
    self.cloned_loops += other.cloned_loops;
    self.cloned_regions += other.cloned_regions;
    self.pairwise_checks += other.pairwise_checks;
  }
}

/// One region guarded by a run-time check.
#[derive(Clone, Debug)]
pub struct VersionedRegion {
  pub region: RegionIx,
  /// The detached region holding the copy.
  pub cloned: RegionIx,
  /// Ends with `br check, entry, clone_entry`.
  pub guard: BlockIx,
  pub clone_entry: BlockIx,
  /// Number of pairwise disjointness tests in the check.
  pub checks: u32,
}

//=============================================================================
// Eligibility

/// Can region `r` be versioned?  It needs two characterized base pointers,
/// a well-defined exit, a loop, a store inside a loop, and no block already
/// taken by an earlier versioning.
pub fn can_instrument(
  func: &Func, an: &FuncAnalyses, info: &RegionRangeInfo,
  claimed: &Set<BlockIx>, r: RegionIx,
) -> bool {
  if info.base_ptrs.len() < 2 {
    return false;
  }
  if an.ri.exit(r).is_none()
    && !(an.ri.is_top_level(r) && func.return_blocks().len() == 1)
  {
    return false;
  }

  let loops: Vec<_> = an
    .li
    .loops
    .range()
    .into_iter()
    .filter(|l| an.ri.contains_loop(&an.dt, &an.li, r, *l))
    .collect();
  if loops.is_empty() {
    return false;
  }

  let in_loop = |i: InstIx| match func.inst_block(i) {
    Some(b) => loops.iter().any(|l| an.li.contains_block(*l, b)),
    None => false,
  };
  let has_store = info.base_ptrs.values().any(|p| {
    p.access_insts
      .iter()
      .any(|i| matches!(func.kind(*i), InstKind::Store { .. }) && in_loop(*i))
  });
  if !has_store {
    return false;
  }

  !an.ri.blocks(func, &an.dt, r).iter().any(|b| claimed.contains(*b))
}

//=============================================================================
// Normalization

// Routes the predecessors of `bb` for which `pred` holds through a single
// block.  When all or none of them do, `bb` is split after its phis and the
// tail is returned, so the caller can move the region boundary onto it.
fn group_predecessors(
  func: &mut Func, an: &mut FuncAnalyses, bb: BlockIx,
  pred: impl Fn(&FuncAnalyses, BlockIx) -> bool,
) -> Option<BlockIx> {
  let preds = func.preds(bb);
  let shared: &FuncAnalyses = &*an;
  let subset: Vec<BlockIx> =
    preds.iter().cloned().filter(|p| pred(shared, *p)).collect();
  if subset.is_empty() || subset.len() == preds.len() {
    let at = match func.first_non_phi(bb) {
      Some(i) => i,
      None => panic!("group_predecessors: {} has no body", func.block_name(bb)),
    };
    let name = format!("{}.split", func.block_name(bb));
    let tail = func.split_block(bb, at, &name);
    an.dt.update_after_split_block(bb, tail);
    an.li.update_after_split_block(bb, tail);
    Some(tail)
  } else {
    let new = func.split_block_predecessors(bb, &subset, ".region");
    an.dt.update_after_split_preds(func, bb, &subset, new);
    an.li.update_after_split_preds(bb, &subset, new);
    None
  }
}

// Gives `r` an exit, a single entering block and a single exiting block,
// and places an empty guard block on the entering edge.  Returns the guard.
fn normalize_region(func: &mut Func, an: &mut FuncAnalyses, r: RegionIx) -> BlockIx {
  if an.ri.exit(r).is_none() {
    let rets = func.return_blocks();
    let ret = match rets.as_slice() {
      [ret] => *ret,
      _ => panic!("normalize_region: {} return blocks", rets.len()),
    };
    let at = match func.terminator(ret) {
      Some(t) => t,
      None => panic!("normalize_region: unterminated return block"),
    };
    let name = format!("{}.exit", func.block_name(ret));
    let tail = func.split_block(ret, at, &name);
    an.dt.update_after_split_block(ret, tail);
    an.li.update_after_split_block(ret, tail);
    an.ri.replace_exit_recursive(r, tail);
  }

  if an.ri.entering_block(func, &an.dt, r).is_none() {
    let entry = an.ri.entry(r);
    let external = |an: &FuncAnalyses, p: BlockIx| !an.ri.contains(&an.dt, r, p);
    if let Some(tail) = group_predecessors(func, an, entry, external) {
      an.ri.replace_entry_recursive(r, tail);
    }
  }
  let entry = an.ri.entry(r);
  let entering = match an.ri.entering_block(func, &an.dt, r) {
    Some(b) => b,
    None => panic!("normalize_region: no entering block for {}", an.ri.name(func, r)),
  };
  let guard = func.split_edge(entering, entry);
  an.dt.update_after_split_edge(func, entering, guard, entry);
  an.li.update_after_split_edge(entering, guard, entry);

  if an.ri.exiting_block(func, &an.dt, r).is_none() {
    let exit = match an.ri.exit(r) {
      Some(x) => x,
      None => panic!("normalize_region: region lost its exit"),
    };
    let internal = |an: &FuncAnalyses, p: BlockIx| an.ri.contains(&an.dt, r, p);
    if let Some(tail) = group_predecessors(func, an, exit, internal) {
      an.ri.replace_exit_recursive(r, tail);
    }
  }
  if an.ri.exiting_block(func, &an.dt, r).is_none() {
    panic!("normalize_region: no exiting block for {}", an.ri.name(func, r));
  }

  debug!(
    "normalize_region: {} guarded by {}",
    an.ri.name(func, r),
    func.block_name(guard)
  );
  guard
}

//=============================================================================
// Run-time checks

// `[low_a, up_a)` and `[low_b, up_b)` do not overlap, as unsigned 64-bit
// addresses.
fn pair_check(
  func: &mut Func, at: InstIx, low_a: ValueIx, up_a: ValueIx, low_b: ValueIx,
  up_b: ValueIx,
) -> ValueIx {
  let a_below = func.insert_inst_before(at, i_icmp(IntCC::Ule, up_a, low_b), Type::I1, "");
  let b_below = func.insert_inst_before(at, i_icmp(IntCC::Ule, up_b, low_a), Type::I1, "");
  let (a_below, b_below) = (func.inst_result(a_below), func.inst_result(b_below));
  let check =
    func.insert_inst_before(at, i_binary(BinOp::Or, a_below, b_below), Type::I1, "pair-no-alias");
  func.inst_result(check)
}

// Materializes, before the guard's terminator, a flag that is true when no
// two pointers of `pairs` touch overlapping bytes inside `r`.
fn emit_checks(
  func: &mut Func, se: &mut ScalarEvolution, an: &FuncAnalyses,
  pra: &PtrRangeAnalysis, aa: &dyn AliasOracle, info: &RegionRangeInfo,
  r: RegionIx, guard: BlockIx, pairs: &[(ValueIx, ValueIx)],
) -> ValueIx {
  let at = match func.terminator(guard) {
    Some(t) => t,
    None => panic!("emit_checks: guard is not terminated"),
  };

  // === BEGIN compute bounds ===
  //
  let mut bounds = Map::<ValueIx, (ValueIx, ValueIx)>::default();
  {
    let mut builder = BoundBuilder::for_insertion(func, se, an, aa, r, at);
    builder.set_artificial_be_counts(pra.artificial_be_counts.clone());
    for base in info.sorted_base_ptrs() {
      let data = &info.base_ptrs[&base];
      let low = match builder.get_ulower_bound(&data.access_fns) {
        Some(v) => v.value(),
        None => panic!("emit_checks: no lower bound for a characterized pointer"),
      };
      let up = match builder.get_uupper_bound(&data.access_fns) {
        Some(v) => v,
        None => panic!("emit_checks: no upper bound for a characterized pointer"),
      };
      let up = builder.stretch_ptr_upper_bound(data.elem_size, up).value();
      bounds.insert(base, (low, up));
    }
  }
  //
  // === END compute bounds ===

  let mut all: Option<ValueIx> = None;
  for (a, b) in pairs {
    let (low_a, up_a) = bounds[a];
    let (low_b, up_b) = bounds[b];
    let check = pair_check(func, at, low_a, up_a, low_b, up_b);
    trace!(
      "emit_checks: {} vs {}: {}",
      func.display_value(*a),
      func.display_value(*b),
      func.display_value(check)
    );
    all = Some(match all {
      None => check,
      Some(prev) => {
        let and = i_binary(BinOp::And, prev, check);
        let i = func.insert_inst_before(at, and, Type::I1, "region-no-alias");
        func.inst_result(i)
      }
    });
  }
  match all {
    Some(v) => v,
    None => panic!("emit_checks: no pairs to check"),
  }
}

//=============================================================================
// Alias scopes

// One scope per base pointer.  Each access gets its own pointer's scope and
// is declared not to alias the scopes of the others.
fn tag_accesses(func: &mut Func, info: &RegionRangeInfo) {
  let bases = info.sorted_base_ptrs();
  let domain = func.name.clone();
  let scopes: Vec<_> = bases
    .iter()
    .map(|b| {
      let name = format!("{}: {}", func.name, func.display_value(*b));
      func.create_alias_scope(&domain, &name)
    })
    .collect();
  for (n, base) in bases.iter().enumerate() {
    for i in &info.base_ptrs[base].access_insts {
      if func.inst_block(*i).is_none() {
        continue;
      }
      let data = &mut func.insts[*i];
      data.alias_scopes.push(scopes[n]);
      for (m, s) in scopes.iter().enumerate() {
        if m != n {
          data.noalias.push(*s);
        }
      }
    }
  }
}

//=============================================================================
// Versioning

fn version_region(
  func: &mut Func, se: &mut ScalarEvolution, an: &mut FuncAnalyses,
  pra: &PtrRangeAnalysis, aa: &dyn AliasOracle, info: &RegionRangeInfo,
  r: RegionIx, claimed: &mut Set<BlockIx>, stats: &mut InstrumentStats,
) -> Option<VersionedRegion> {
  let pairs = select_pairs(func, aa, an, r, info);
  if pairs.is_empty() {
    debug!("version_region: {}: no pointers may alias", an.ri.name(func, r));
    return None;
  }

  let guard = normalize_region(func, an, r);
  let check = emit_checks(func, se, an, pra, aa, info, r, guard, &pairs);

  let nLoops = an
    .li
    .loops
    .range()
    .into_iter()
    .filter(|l| an.ri.contains(&an.dt, r, an.li.header(*l)))
    .count() as u32;
  let entry = an.ri.entry(r);
  let cr = clone_region(func, an, r);
  let clone_entry = cr.block_map[&entry];

  for b in an.ri.blocks(func, &an.dt, r) {
    claimed.insert(b);
  }
  for b in cr.block_map.values() {
    claimed.insert(*b);
  }

  // === BEGIN rewire the guard ===
  //
  let jump = match func.terminator(guard) {
    Some(t) => t,
    None => panic!("version_region: guard is not terminated"),
  };
  func.remove_inst(jump);
  let br = InstKind::Branch { cond: check, dests: [entry, clone_entry] };
  func.append_inst(guard, br, Type::Void, "");
  //
  // === END rewire the guard ===

  tag_accesses(func, info);

  stats.cloned_loops += nLoops;
  stats.cloned_regions += 1;
  stats.pairwise_checks += pairs.len() as u32;
  info!(
    "version_region: {}: versioned behind {} with {} check(s)",
    an.ri.name(func, r),
    func.block_name(guard),
    pairs.len()
  );
  Some(VersionedRegion {
    region: r,
    cloned: cr.cloned,
    guard,
    clone_entry,
    checks: pairs.len() as u32,
  })
}

fn instrument_region(
  func: &mut Func, se: &mut ScalarEvolution, an: &mut FuncAnalyses,
  pra: &PtrRangeAnalysis, aa: &dyn AliasOracle, mode: InstrumentationMode,
  r: RegionIx, claimed: &mut Set<BlockIx>, stats: &mut InstrumentStats,
  res: &mut Vec<VersionedRegion>,
) {
  let eligible = match pra.info(r) {
    Some(info) => {
      let wanted = match mode {
        InstrumentationMode::Region => info.has_full_side_effect_info,
        InstrumentationMode::Function => true,
      };
      wanted && can_instrument(func, an, info, claimed, r)
    }
    None => false,
  };

  if eligible {
    if let Some(info) = pra.info(r) {
      if let Some(v) =
        version_region(func, se, an, pra, aa, info, r, claimed, stats)
      {
        res.push(v);
      }
    }
    return;
  }

  trace!("instrument_region: {}: not eligible", an.ri.name(func, r));
  let children: Vec<RegionIx> = an.ri.children(r).iter().rev().cloned().collect();
  for c in children {
    instrument_region(func, se, an, pra, aa, mode, c, claimed, stats, res);
  }
}

/// Versions the outermost eligible regions of `func`, walking the region
/// tree from the top and visiting children in reverse order.  `an` is kept
/// up to date, except for the post-dominator tree.  Blocks of versioned
/// regions and of their copies are added to `claimed`.
#[inline(never)]
pub fn instrument_function(
  func: &mut Func, se: &mut ScalarEvolution, an: &mut FuncAnalyses,
  pra: &PtrRangeAnalysis, aa: &dyn AliasOracle, mode: InstrumentationMode,
  claimed: &mut Set<BlockIx>, stats: &mut InstrumentStats,
) -> Vec<VersionedRegion> {
  let mut res = vec![];
  let top = an.ri.top_level();
  instrument_region(func, se, an, pra, aa, mode, top, claimed, stats, &mut res);
  debug!("instrument_function: {}: {} region(s) versioned", func.name, res.len());
  res
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::alias::BasicAliasOracle;
  use crate::cfg::DomTree;
  use crate::ir::*;
  use crate::test_utils::{copy_kernel, counted_loop, eval_straight_line, shifted_copy};
  use crate::verify::verify_func;

  fn analyze(f: &Func) -> (FuncAnalyses, ScalarEvolution, PtrRangeAnalysis) {
    let mut an = FuncAnalyses::compute(f).unwrap();
    let mut se = ScalarEvolution::new();
    let mut pra = PtrRangeAnalysis::new();
    pra.run(&Module::new(), f, &mut se, &mut an, &BasicAliasOracle, false);
    (an, se, pra)
  }

  #[test]
  fn disjointness_check() {
    let mut f = Func::new("ranges", Type::I1);
    let params: Vec<ValueIx> = ["la", "ua", "lb", "ub"]
      .iter()
      .map(|n| f.add_param(n, Type::I64))
      .collect();
    let b = f.create_block("entry");
    let ret = f.append_inst(b, i_ret(None), Type::Void, "");
    let check = pair_check(&mut f, ret, params[0], params[1], params[2], params[3]);

    let eval = |f: &Func, vals: [i64; 4]| {
      let mut env = Map::default();
      for (p, v) in params.iter().zip(vals.iter()) {
        env.insert(*p, *v);
      }
      eval_straight_line(f, &env, check)
    };
    assert_eq!(eval(&f, [0, 10, 10, 20]), 1);
    assert_eq!(eval(&f, [10, 20, 0, 10]), 1);
    assert_eq!(eval(&f, [0, 10, 5, 15]), 0);
    assert_eq!(eval(&f, [5, 15, 0, 10]), 0);
    // Unsigned: a range high in the address space is not below a low one.
    assert_eq!(eval(&f, [-16, -8, 0, 10]), 1);
  }

  #[test]
  fn gate_requires_two_pointers_and_a_loop() {
    // One pointer.
    let (f, _, _) = counted_loop(IntCC::Slt, 0, 1);
    let (an, _, pra) = analyze(&f);
    let top = an.ri.top_level();
    let claimed = Set::empty();
    assert!(!can_instrument(&f, &an, pra.info(top).unwrap(), &claimed, top));

    // Two pointers, no loop.
    let mut f = Func::new("straight", Type::Void);
    let a = f.add_param("A", Type::Ptr(Some(4)));
    let b = f.add_param("B", Type::Ptr(Some(4)));
    let entry = f.create_block("entry");
    let v = f.ins(entry, i_load(b), Type::I32, "v");
    f.append_inst(entry, i_store(v, a), Type::Void, "");
    f.append_inst(entry, i_ret(None), Type::Void, "");
    let (an, _, pra) = analyze(&f);
    let top = an.ri.top_level();
    let info = pra.info(top).unwrap();
    assert_eq!(info.base_ptrs.len(), 2);
    assert!(!can_instrument(&f, &an, info, &claimed, top));

    // Eligible, until one of its blocks is claimed.
    let f = shifted_copy();
    let (an, _, pra) = analyze(&f);
    let top = an.ri.top_level();
    let info = pra.info(top).unwrap();
    assert!(can_instrument(&f, &an, info, &claimed, top));
    let claimed = Set::unit(f.block_by_name("body").unwrap());
    assert!(!can_instrument(&f, &an, info, &claimed, top));
  }

  #[test]
  fn noalias_pointers_need_no_versioning() {
    let mut f = copy_kernel();
    let a = f.params[0];
    let b = f.params[1];
    f.set_noalias(a);
    f.set_noalias(b);
    let (mut an, mut se, pra) = analyze(&f);
    let n_blocks = f.layout.len();
    let mut claimed = Set::empty();
    let mut stats = InstrumentStats::default();
    let res = instrument_function(
      &mut f,
      &mut se,
      &mut an,
      &pra,
      &BasicAliasOracle,
      InstrumentationMode::Region,
      &mut claimed,
      &mut stats,
    );
    assert!(res.is_empty());
    assert_eq!(f.layout.len(), n_blocks);
    assert_eq!(stats, InstrumentStats::default());
  }

  #[test]
  fn shifted_copy_is_versioned() {
    let mut f = shifted_copy();
    let (mut an, mut se, pra) = analyze(&f);
    let mut claimed = Set::empty();
    let mut stats = InstrumentStats::default();
    let res = instrument_function(
      &mut f,
      &mut se,
      &mut an,
      &pra,
      &BasicAliasOracle,
      InstrumentationMode::Region,
      &mut claimed,
      &mut stats,
    );
    assert_eq!(res.len(), 1);
    assert_eq!(stats.cloned_regions, 1);
    assert_eq!(stats.cloned_loops, 1);
    assert_eq!(stats.pairwise_checks, 1);
    let v = &res[0];
    assert_eq!(v.checks, 1);

    // The guard picks the original when the check holds.
    let entry = an.ri.entry(v.region);
    let br = f.terminator(v.guard).unwrap();
    let cond = match f.kind(br) {
      InstKind::Branch { cond, dests } => {
        assert_eq!(dests[0], entry);
        assert_eq!(dests[1], v.clone_entry);
        *cond
      }
      other => panic!("guard ends with {:?}", other),
    };

    // Accesses in the original are tagged, those in the copy are not.
    let mut tagged = 0;
    let mut untagged = 0;
    for b in &f.layout {
      for i in f.block_insts(*b) {
        if !f.kind(*i).is_memory_access() {
          continue;
        }
        let data = &f.insts[*i];
        if an.ri.contains(&an.dt, v.region, *b) {
          assert_eq!(data.alias_scopes.len(), 1);
          assert_eq!(data.noalias.len(), 1);
          assert_ne!(data.alias_scopes[0], data.noalias[0]);
          tagged += 1;
        } else {
          assert!(data.alias_scopes.is_empty() && data.noalias.is_empty());
          untagged += 1;
        }
      }
    }
    assert_eq!((tagged, untagged), (2, 2));
    assert_eq!(f.scopes.len(), 2);

    // The check only depends on the arguments.
    let env = |a: i64, b: i64, n: i64, m: i64| {
      let mut env = Map::default();
      for (p, v) in f.params.iter().zip([a, b, n, m].iter()) {
        env.insert(*p, *v);
      }
      env
    };
    assert_eq!(eval_straight_line(&f, &env(0, 10000, 100, 0), cond), 1);
    assert_eq!(eval_straight_line(&f, &env(10000, 0, 100, 0), cond), 1);
    assert_eq!(eval_straight_line(&f, &env(0, 200, 100, 0), cond), 0);
    assert_eq!(eval_straight_line(&f, &env(0, 0, 100, 10), cond), 0);

    assert_eq!(an.dt, DomTree::from_func(&f).unwrap());
    assert!(verify_func(&f).is_ok());
  }

  #[test]
  fn function_mode_versions_partially_characterized_regions() {
    // An unsafe call before the loop spoils the top region for region mode.
    let mut f = shifted_copy();
    let entry = f.entry_block().unwrap();
    let jump = f.terminator(entry).unwrap();
    f.insert_inst_before(jump, i_call("opaque", vec![], CallAttrs::default()), Type::Void, "");

    let (mut an, mut se, pra) = analyze(&f);
    let top = an.ri.top_level();
    assert!(!pra.info(top).unwrap().has_full_side_effect_info);

    let mut g = f.clone();
    let (mut an_g, mut se_g, pra_g) = analyze(&g);
    let mut stats = InstrumentStats::default();
    let res = instrument_function(
      &mut g,
      &mut se_g,
      &mut an_g,
      &pra_g,
      &BasicAliasOracle,
      InstrumentationMode::Region,
      &mut Set::empty(),
      &mut stats,
    );
    // Only the loop region below the call qualifies.
    for v in &res {
      assert!(!an_g.ri.is_top_level(v.region));
    }

    let mut stats = InstrumentStats::default();
    let res = instrument_function(
      &mut f,
      &mut se,
      &mut an,
      &pra,
      &BasicAliasOracle,
      InstrumentationMode::Function,
      &mut Set::empty(),
      &mut stats,
    );
    assert_eq!(res.len(), 1);
    assert!(an.ri.is_top_level(res[0].region));
    assert!(verify_func(&f).is_ok());
    assert_eq!(an.dt, DomTree::from_func(&f).unwrap());
  }
}
