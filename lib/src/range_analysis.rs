/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Symbolic pointer range analysis.
//!
//! For every region of a function, find the base pointers its loads and
//! stores go through, and the symbolic access expression of each access.
//! A region whose every memory effect is accounted for this way, with
//! computable bounds for each access, has "full side-effect info": the set
//! of bytes it may touch is described exactly by the per-pointer bounds.

#![allow(non_snake_case)]

use log::{debug, info, trace};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::alias::AliasOracle;
use crate::bounds::{is_invariant, BoundBuilder};
use crate::cfg::CFGInfo;
use crate::data_structures::{InstIx, LoopIx, Map, RegionIx, ScevIx, ValueIx};
use crate::interface::FuncAnalyses;
use crate::ir::{CallAttrs, CastOp, Func, InstKind, Module, Type};
use crate::scev::ScalarEvolution;

//=============================================================================
// Per-region results

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum AccessKind {
  Load,
  Store,
  LoadStore,
}

impl AccessKind {
  pub fn join(self, other: AccessKind) -> AccessKind {
    if self == other {
      self
    } else {
      AccessKind::LoadStore
    }
  }

  pub fn writes(self) -> bool {
    self != AccessKind::Load
  }
}

/// What is known about the accesses through one base pointer.
#[derive(Clone, Debug)]
pub struct PtrRangeInfo {
  pub base_ptr: ValueIx,
  /// Size of the elements the symbolic base points to.
  pub elem_size: u32,
  /// Loads and stores through the pointer, and the symbolic address each
  /// one accesses, in matching order.
  pub access_insts: Vec<InstIx>,
  pub access_fns: Vec<ScevIx>,
  pub access_kind: AccessKind,
}

impl PtrRangeInfo {
  fn new(base_ptr: ValueIx, elem_size: u32, kind: AccessKind) -> Self {
    Self {
      base_ptr,
      elem_size,
      access_insts: vec![],
      access_fns: vec![],
      access_kind: kind,
    }
  }
}

#[derive(Clone, Debug)]
pub struct RegionRangeInfo {
  pub region: RegionIx,
  /// Every memory effect of the region is described by `base_ptrs`: calls,
  /// if any, are safe, and each load and store has a known base pointer
  /// and a bounded access expression.
  pub has_full_side_effect_info: bool,
  pub base_ptrs: Map<ValueIx, PtrRangeInfo>,
}

impl RegionRangeInfo {
  pub fn new(region: RegionIx) -> Self {
    Self { region, has_full_side_effect_info: false, base_ptrs: Map::default() }
  }

  pub fn sorted_base_ptrs(&self) -> Vec<ValueIx> {
    let mut res: Vec<ValueIx> = self.base_ptrs.keys().cloned().collect();
    res.sort_unstable();
    res
  }

  pub fn num_accesses(&self) -> usize {
    self.base_ptrs.values().map(|p| p.access_insts.len()).sum()
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RangeStats {
  /// Loads and stores seen, counted once per enclosing region visited.
  pub memory_accesses: u32,
  /// Those with a known base pointer and bounded access expression.
  pub analyzed_accesses: u32,
  pub regions: u32,
  pub regions_with_full_info: u32,
  pub reduced_regions: u32,
}

impl RangeStats {
  pub fn accumulate(&mut self, other: &RangeStats) {
    self.memory_accesses += other.memory_accesses;
    self.analyzed_accesses += other.analyzed_accesses;
    self.regions += other.regions;
    self.regions_with_full_info += other.regions_with_full_info;
    self.reduced_regions += other.reduced_regions;
  }
}

//=============================================================================
// Helpers

/// Strips loads and geps off a pointer until the value they were all
/// derived from is reached.  `A[i][j]` is keyed by `A`.
pub fn indirection_root(func: &Func, ptr: ValueIx) -> ValueIx {
  let mut cur = ptr;
  loop {
    let i = match func.def_inst(cur) {
      Some(i) => i,
      None => return cur,
    };
    match func.kind(i) {
      InstKind::Load { ptr } => cur = *ptr,
      InstKind::Gep { base, .. } => cur = *base,
      _ => return cur,
    }
  }
}

fn is_int_to_ptr(func: &Func, v: ValueIx) -> bool {
  match func.def_inst(v) {
    Some(i) => matches!(func.kind(i), InstKind::Cast { op: CastOp::IntToPtr, .. }),
    None => false,
  }
}

// Library functions without memory effects visible to the caller, plus the
// block-copy helpers front ends emit for aggregate assignment.
const KNOWN_SAFE_CALLEES: &[&str] = &[
  "rand", "memcpy", "llvm.memcpy.p0i8.p0i8.i32", "llvm.memcpy.p0i8.p0i8.i64",
  "cos", "sin", "tan", "acos", "asin", "atan", "atan2", "cosh", "sinh", "tanh",
  "acosh", "asinh", "atanh", "exp", "frexp", "ldexp", "log", "log10", "modf",
  "exp2", "expm1", "ilogb", "log1p", "log2", "logb", "scalbn", "scalbln",
  "pow", "sqrt", "cbrt", "hypot", "erf", "erfc", "tgamma", "lgamma", "ceil",
  "floor", "fmod", "trunc", "round", "lround", "llround", "rint", "lrint",
  "llrint", "nearbyint", "remainder", "remquo", "copysign", "nan",
  "nextafter", "nexttoward", "fdim", "fmax", "fmin", "fabs", "abs", "fma",
];

//=============================================================================
// The analysis

pub struct PtrRangeAnalysis {
  pub regions_range_data: Map<RegionIx, RegionRangeInfo>,
  /// Results for the reduced form of a region lacking full side-effect
  /// info, keyed by the original region.
  pub reduced_range_data: Map<RegionIx, RegionRangeInfo>,
  /// For each loop, how each base pointer is accessed inside it.
  pub loop_access_kinds: Map<LoopIx, Map<ValueIx, AccessKind>>,
  pub stats: RangeStats,
  /// Trip-count bounds for loops whose backedge-taken count is not
  /// computable.
  pub artificial_be_counts: Map<LoopIx, ScevIx>,
  safe_callees: Map<String, bool>,
}

impl PtrRangeAnalysis {
  pub fn new() -> Self {
    Self {
      regions_range_data: Map::default(),
      reduced_range_data: Map::default(),
      loop_access_kinds: Map::default(),
      stats: RangeStats::default(),
      artificial_be_counts: Map::default(),
      safe_callees: Map::default(),
    }
  }

  pub fn set_artificial_be_counts(&mut self, counts: Map<LoopIx, ScevIx>) {
    self.artificial_be_counts = counts;
  }

  pub fn info(&self, r: RegionIx) -> Option<&RegionRangeInfo> {
    self.regions_range_data.get(&r)
  }

  /// How `ptr` is accessed inside `l`.  Pointers never seen count as both
  /// read and written.
  pub fn loop_access_kind(&self, l: LoopIx, ptr: ValueIx) -> AccessKind {
    self
      .loop_access_kinds
      .get(&l)
      .and_then(|m| m.get(&ptr))
      .cloned()
      .unwrap_or(AccessKind::LoadStore)
  }

  /// Collects range info for every region of `func`, parents before
  /// children.  With `reduce`, regions lacking full side-effect info are
  /// retried without their first block; the reduced regions are added to
  /// the region tree as detached regions.
  #[inline(never)]
  pub fn run(
    &mut self, module: &Module, func: &Func, se: &mut ScalarEvolution,
    an: &mut FuncAnalyses, aa: &dyn AliasOracle, reduce: bool,
  ) {
    self.regions_range_data.clear();
    self.reduced_range_data.clear();
    self.compute_loop_access_kinds(func, an);

    for r in an.ri.preorder() {
      let data = self.collect_region(module, func, se, an, aa, r);
      self.regions_range_data.insert(r, data);
    }

    if reduce {
      let partial: Vec<RegionIx> = an
        .ri
        .preorder()
        .into_iter()
        .filter(|r| !self.regions_range_data[r].has_full_side_effect_info)
        .collect();
      for r in partial {
        self.analyze_reduced_region(module, func, se, an, aa, r);
      }
    }

    info!(
      "PtrRangeAnalysis: {}: {} of {} memory accesses analyzed, \
       {} of {} regions fully characterized",
      func.name,
      self.stats.analyzed_accesses,
      self.stats.memory_accesses,
      self.stats.regions_with_full_info,
      self.stats.regions
    );
  }

  fn compute_loop_access_kinds(&mut self, func: &Func, an: &FuncAnalyses) {
    self.loop_access_kinds.clear();
    for l in an.li.loops.range() {
      let mut kinds = Map::<ValueIx, AccessKind>::default();
      for b in an.li.blocks_in_layout(func, l) {
        for i in func.block_insts(b) {
          let (ptr, kind) = match func.kind(*i) {
            InstKind::Load { ptr } => (*ptr, AccessKind::Load),
            InstKind::Store { ptr, .. } => (*ptr, AccessKind::Store),
            _ => continue,
          };
          let root = indirection_root(func, ptr);
          let joined = kinds.get(&root).map_or(kind, |k| k.join(kind));
          kinds.insert(root, joined);
        }
      }
      self.loop_access_kinds.insert(l, kinds);
    }
  }

  fn collect_region(
    &mut self, module: &Module, func: &Func, se: &mut ScalarEvolution,
    an: &FuncAnalyses, aa: &dyn AliasOracle, r: RegionIx,
  ) -> RegionRangeInfo {
    let mut data = RegionRangeInfo::new(r);
    data.has_full_side_effect_info = true;
    // All bounds are relative to the region entry.
    let mut builder = BoundBuilder::for_analysis(func, se, an, aa, r);
    builder.set_artificial_be_counts(self.artificial_be_counts.clone());

    for b in an.ri.blocks(func, &an.dt, r) {
      let insts = func.block_insts(b);
      for i in &insts[..insts.len().saturating_sub(1)] {
        if !self.collect_inst(module, func, &mut builder, an, aa, r, *i, &mut data) {
          trace!(
            "PtrRangeAnalysis: region {}: not characterized by {}",
            an.ri.name(func, r),
            func.display_inst(*i)
          );
          data.has_full_side_effect_info = false;
        }
      }
    }

    self.stats.regions += 1;
    if data.has_full_side_effect_info {
      self.stats.regions_with_full_info += 1;
    }
    debug!(
      "PtrRangeAnalysis: region {}: {} base pointer(s), {} access(es), full info: {}",
      an.ri.name(func, r),
      data.base_ptrs.len(),
      data.num_accesses(),
      data.has_full_side_effect_info
    );
    data
  }

  // Records the access `i` performs, if any.  Returns false when `i` may
  // affect memory in a way the region's range info does not describe.
  fn collect_inst(
    &mut self, module: &Module, func: &Func, builder: &mut BoundBuilder,
    an: &FuncAnalyses, aa: &dyn AliasOracle, r: RegionIx, i: InstIx,
    data: &mut RegionRangeInfo,
  ) -> bool {
    let kind = func.kind(i);
    match kind {
      InstKind::Call { callee, attrs, .. } => {
        return self.is_safe_call(module, callee, *attrs)
      }
      InstKind::Load { .. } | InstKind::Store { .. } => {}
      k if !k.may_read_memory() && !k.may_write_memory() => {
        return !matches!(k, InstKind::Alloca { .. })
      }
      _ => return false,
    }
    self.stats.memory_accesses += 1;

    let ptr = match kind.pointer_operand() {
      Some(ptr) => ptr,
      None => return false,
    };
    let access_fn = builder.se().get_scev(func, &an.li, ptr);
    let base = builder.se().get_pointer_base(access_fn);
    let base_v = match builder.se().as_unknown(base) {
      Some(v) => v,
      None => return false,
    };
    if func.is_undef(base_v) || is_int_to_ptr(func, base_v) {
      return false;
    }
    if !is_invariant(func, an, aa, r, base_v) {
      return false;
    }
    let elem_size = match func.value_ty(base_v).elem_size() {
      Some(size) => size,
      None => return false,
    };
    if !builder.can_compute_bounds_for(access_fn) {
      return false;
    }

    let access = match kind {
      InstKind::Store { .. } => AccessKind::Store,
      _ => AccessKind::Load,
    };
    let key = indirection_root(func, base_v);
    let entry = data
      .base_ptrs
      .entry(key)
      .or_insert_with(|| PtrRangeInfo::new(key, elem_size, access));
    entry.access_insts.push(i);
    entry.access_fns.push(access_fn);
    entry.access_kind = entry.access_kind.join(access);
    self.stats.analyzed_accesses += 1;
    true
  }

  fn analyze_reduced_region(
    &mut self, module: &Module, func: &Func, se: &mut ScalarEvolution,
    an: &mut FuncAnalyses, aa: &dyn AliasOracle, r: RegionIx,
  ) {
    // An unsafe call anywhere in the original region rules it out.
    for b in an.ri.blocks(func, &an.dt, r) {
      for i in func.block_insts(b) {
        if let InstKind::Call { callee, attrs, .. } = func.kind(*i) {
          if !self.is_safe_call(module, callee, *attrs) {
            return;
          }
        }
      }
    }
    let cfg = match CFGInfo::create(func) {
      Ok(cfg) => cfg,
      Err(_) => return,
    };
    let (entry, exit) =
      match an.ri.reduced_region(func, &cfg, &an.dt, &an.pdt, r) {
        Some(bounds) => bounds,
        None => return,
      };
    let rr = an.ri.add_detached_region(entry, Some(exit), Some(r));
    let data = self.collect_region(module, func, se, an, aa, rr);
    debug!(
      "PtrRangeAnalysis: region {} reduced to {}",
      an.ri.name(func, r),
      an.ri.name(func, rr)
    );
    self.stats.reduced_regions += 1;
    self.reduced_range_data.insert(r, data);
  }

  //---------------------------------------------------------------------------
  // Calls

  /// A call is safe when it cannot affect memory the region's accesses
  /// describe: it returns, and either touches no memory, is a known library
  /// function, or is defined in the module with only integer inputs and
  /// output and no access to a global.
  pub fn is_safe_call(
    &mut self, module: &Module, callee: &str, attrs: CallAttrs,
  ) -> bool {
    if attrs.no_return {
      return false;
    }
    if attrs.read_none {
      return true;
    }
    if let Some(res) = self.safe_callees.get(callee) {
      return *res;
    }
    let res = match module.find_func(callee) {
      None => KNOWN_SAFE_CALLEES.contains(&callee),
      Some(f) if f.is_declaration => KNOWN_SAFE_CALLEES.contains(&callee),
      Some(f) => is_pure_integer_function(f),
    };
    trace!("PtrRangeAnalysis: call to {} is safe: {}", callee, res);
    self.safe_callees.insert(callee.to_string(), res);
    res
  }
}

fn is_pure_integer_function(f: &Func) -> bool {
  if !f.ret_ty.is_int() {
    return false;
  }
  if !f.params.iter().all(|p| f.value_ty(*p).is_int()) {
    return false;
  }
  let is_global =
    |v: ValueIx| matches!(f.values[v].def, crate::ir::ValueDef::Global(_));
  for b in &f.layout {
    for i in f.block_insts(*b) {
      let ptr = match f.kind(*i) {
        InstKind::Load { ptr } | InstKind::Store { ptr, .. } => *ptr,
        InstKind::Gep { base, .. } => *base,
        _ => continue,
      };
      if is_global(ptr) {
        return false;
      }
    }
  }
  debug_assert!(f.ret_ty != Type::Void);
  true
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::alias::BasicAliasOracle;
  use crate::ir::*;
  use crate::test_utils::{copy_kernel, counted_loop, staged_kernel};

  fn analyze(m: &Module, f: &Func) -> (FuncAnalyses, PtrRangeAnalysis) {
    let mut an = FuncAnalyses::compute(f).unwrap();
    let mut se = ScalarEvolution::new();
    let mut pra = PtrRangeAnalysis::new();
    pra.run(m, f, &mut se, &mut an, &BasicAliasOracle, false);
    (an, pra)
  }

  #[test]
  fn copy_kernel_is_fully_characterized() {
    let f = copy_kernel();
    let m = Module::new();
    let (an, pra) = analyze(&m, &f);
    let top = pra.info(an.ri.top_level()).unwrap();
    assert!(top.has_full_side_effect_info);
    let a = f.params[0];
    let b = f.params[1];
    assert_eq!(top.sorted_base_ptrs(), vec![a, b]);
    assert_eq!(top.base_ptrs[&a].access_kind, AccessKind::Store);
    assert_eq!(top.base_ptrs[&b].access_kind, AccessKind::Load);
    assert_eq!(top.base_ptrs[&a].elem_size, 4);
    assert_eq!(pra.loop_access_kind(LoopIx::new(0), a), AccessKind::Store);
    // Every region of the tree got range data.
    assert_eq!(pra.regions_range_data.len(), an.ri.num_regions());
    assert_eq!(pra.stats.regions, an.ri.num_regions() as u32);
  }

  #[test]
  fn reduced_regions_leave_the_stack_slot_outside() {
    let f = staged_kernel();
    let m = Module::new();
    let mut an = FuncAnalyses::compute(&f).unwrap();
    let mut se = ScalarEvolution::new();
    let mut pra = PtrRangeAnalysis::new();
    pra.run(&m, &f, &mut se, &mut an, &BasicAliasOracle, true);

    let a = f.params[0];
    let b = f.params[1];
    let t = f.value_by_name("T").unwrap();
    let head = f.block_by_name("head").unwrap();
    // The alloca keeps every region holding the entry block from full info.
    assert!(!pra.info(an.ri.top_level()).unwrap().has_full_side_effect_info);
    assert_eq!(pra.reduced_range_data.len(), 2);
    assert_eq!(pra.stats.reduced_regions, 2);
    for (r, data) in &pra.reduced_range_data {
      assert!(!pra.info(*r).unwrap().has_full_side_effect_info);
      assert_ne!(data.region, *r);
      assert_eq!(an.ri.entry(data.region), head);
      assert!(data.has_full_side_effect_info);
      assert_eq!(data.sorted_base_ptrs(), vec![a, b, t]);
      assert_eq!(data.base_ptrs[&a].access_kind, AccessKind::Load);
      assert_eq!(data.base_ptrs[&b].access_kind, AccessKind::Store);
      assert_eq!(data.base_ptrs[&t].access_kind, AccessKind::LoadStore);
      assert_eq!(data.base_ptrs[&t].access_insts.len(), 2);
      assert_eq!(data.num_accesses(), 4);
    }
    assert!(pra.reduced_range_data.contains_key(&an.ri.top_level()));
  }

  #[test]
  fn unbounded_access_blocks_full_info() {
    // A loop controlled by an equality test has no trip count.
    let (f, _, _) = counted_loop(IntCC::Eq, 0, 1);
    let m = Module::new();
    let (an, pra) = analyze(&m, &f);
    let top = pra.info(an.ri.top_level()).unwrap();
    assert!(!top.has_full_side_effect_info);
    assert!(top.base_ptrs.is_empty());
    assert_eq!(pra.stats.analyzed_accesses, 0);
    assert!(pra.stats.memory_accesses > 0);
  }

  #[test]
  fn calls_and_allocas() {
    let mut m = Module::new();
    m.funcs.push(Func::new_declaration("sqrt", Type::I64, &[Type::I64]));
    m.funcs.push(Func::new_declaration("puts", Type::I32, &[Type::Ptr(Some(1))]));
    let mut sq = Func::new("square", Type::I64);
    let x = sq.add_param("x", Type::I64);
    let b = sq.create_block("entry");
    let y = sq.ins(b, i_mul(x, x), Type::I64, "y");
    sq.append_inst(b, i_ret(Some(y)), Type::Void, "");
    m.funcs.push(sq);

    let mut pra = PtrRangeAnalysis::new();
    let plain = CallAttrs::default();
    assert!(pra.is_safe_call(&m, "sqrt", plain));
    assert!(!pra.is_safe_call(&m, "puts", plain));
    assert!(pra.is_safe_call(&m, "square", plain));
    assert!(!pra.is_safe_call(&m, "unknown_fn", plain));
    assert!(pra.is_safe_call(
      &m,
      "puts",
      CallAttrs { read_none: true, no_return: false }
    ));
    assert!(!pra.is_safe_call(
      &m,
      "sqrt",
      CallAttrs { read_none: true, no_return: true }
    ));

    // An alloca inside the region blocks full characterization.
    let (mut f, _, _) = counted_loop(IntCC::Slt, 0, 1);
    let entry = f.entry_block().unwrap();
    let at = f.terminator(entry).unwrap();
    f.insert_inst_before(at, i_alloca(4), Type::Ptr(Some(4)), "slot");
    let (an, pra) = analyze(&m, &f);
    assert!(!pra.info(an.ri.top_level()).unwrap().has_full_side_effect_info);
  }

  #[test]
  fn indirections_are_keyed_by_their_root() {
    let mut f = Func::new("ind", Type::Void);
    let pp = f.add_param("pp", Type::Ptr(Some(8)));
    let b = f.create_block("entry");
    let zero = f.iconst(Type::I64, 0);
    let p = f.ins(b, i_load(pp), Type::Ptr(Some(4)), "p");
    let q = f.ins(b, i_gep(p, zero), Type::Ptr(Some(4)), "q");
    f.append_inst(b, i_ret(None), Type::Void, "");
    assert_eq!(indirection_root(&f, q), pp);
    assert_eq!(indirection_root(&f, pp), pp);
  }
}
