/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Alias queries, alias sets, and the selection of base-pointer pairs that
//! need a run-time disjointness check.

use log::{debug, trace};

use crate::data_structures::{BlockIx, Map, RegionIx, ValueIx};
use crate::interface::FuncAnalyses;
use crate::ir::{CastOp, Func, InstKind, ValueDef};
use crate::range_analysis::RegionRangeInfo;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AliasResult {
  NoAlias,
  MayAlias,
  MustAlias,
}

/// Answers whether two pointers may point into the same memory.  Queries
/// are about the whole objects the pointers can reach, not about a single
/// access size.
pub trait AliasOracle {
  fn alias(&self, func: &Func, a: ValueIx, b: ValueIx) -> AliasResult;
}

//=============================================================================
// Oracles

/// Follows `gep` bases and bitcasts back to the value a pointer was derived
/// from.
pub fn underlying_object(func: &Func, v: ValueIx) -> ValueIx {
  let mut cur = v;
  loop {
    let i = match func.def_inst(cur) {
      Some(i) => i,
      None => return cur,
    };
    match func.kind(i) {
      InstKind::Gep { base, .. } => cur = *base,
      InstKind::Cast { op: CastOp::Bitcast, arg } => cur = *arg,
      _ => return cur,
    }
  }
}

// Objects whose storage is known to be distinct from any other identified
// object: stack slots, globals and noalias parameters.
fn is_identified_object(func: &Func, v: ValueIx) -> bool {
  match &func.values[v].def {
    ValueDef::Global(_) => true,
    ValueDef::Param(_) => func.values[v].noalias,
    ValueDef::Inst(i) => matches!(func.kind(*i), InstKind::Alloca { .. }),
    ValueDef::Const(_) | ValueDef::Undef => false,
  }
}

fn is_alloca(func: &Func, v: ValueIx) -> bool {
  match func.def_inst(v) {
    Some(i) => matches!(func.kind(i), InstKind::Alloca { .. }),
    None => false,
  }
}

/// Reasons about the objects underlying both pointers.  Distinct identified
/// objects never alias, and a stack slot is never reachable through a
/// parameter.
#[derive(Copy, Clone, Debug, Default)]
pub struct BasicAliasOracle;

impl AliasOracle for BasicAliasOracle {
  fn alias(&self, func: &Func, a: ValueIx, b: ValueIx) -> AliasResult {
    if a == b {
      return AliasResult::MustAlias;
    }
    let oa = underlying_object(func, a);
    let ob = underlying_object(func, b);
    if oa == ob {
      return AliasResult::MayAlias;
    }
    if is_identified_object(func, oa) && is_identified_object(func, ob) {
      return AliasResult::NoAlias;
    }
    let is_param = |v: ValueIx| matches!(func.values[v].def, ValueDef::Param(_));
    if (is_alloca(func, oa) && is_param(ob)) || (is_alloca(func, ob) && is_param(oa)) {
      return AliasResult::NoAlias;
    }
    AliasResult::MayAlias
  }
}

/// Knows nothing: every two distinct pointers may alias.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConservativeAliasOracle;

impl AliasOracle for ConservativeAliasOracle {
  fn alias(&self, _func: &Func, a: ValueIx, b: ValueIx) -> AliasResult {
    if a == b {
      AliasResult::MustAlias
    } else {
      AliasResult::MayAlias
    }
  }
}

//=============================================================================
// Alias sets

#[derive(Clone, Debug)]
pub struct AliasSet {
  pub ptrs: Vec<ValueIx>,
  /// Some access through the set writes memory.
  pub is_mod: bool,
}

/// Partitions pointers into sets such that any two pointers that may alias
/// end up in the same set.
pub struct AliasSetTracker<'a> {
  aa: &'a dyn AliasOracle,
  // Sets that were merged into another one are `None`.
  sets: Vec<Option<AliasSet>>,
  set_of: Map<ValueIx, usize>,
}

impl<'a> AliasSetTracker<'a> {
  pub fn new(aa: &'a dyn AliasOracle) -> Self {
    Self { aa, sets: vec![], set_of: Map::default() }
  }

  /// Adds `ptr`, merging every set holding a pointer that may alias it.
  /// Returns the index of the set `ptr` ends up in.
  pub fn add_pointer(&mut self, func: &Func, ptr: ValueIx, is_mod: bool) -> usize {
    if let Some(s) = self.set_of.get(&ptr).cloned() {
      if let Some(set) = &mut self.sets[s] {
        set.is_mod |= is_mod;
      }
      return s;
    }
    let mut hits = vec![];
    for (ix, set) in self.sets.iter().enumerate() {
      if let Some(set) = set {
        let aliases = set
          .ptrs
          .iter()
          .any(|p| self.aa.alias(func, *p, ptr) != AliasResult::NoAlias);
        if aliases {
          hits.push(ix);
        }
      }
    }
    let target = match hits.first() {
      Some(t) => *t,
      None => {
        self.sets.push(Some(AliasSet { ptrs: vec![], is_mod: false }));
        self.sets.len() - 1
      }
    };
    for ix in hits.iter().skip(1) {
      if let Some(merged) = self.sets[*ix].take() {
        for p in &merged.ptrs {
          self.set_of.insert(*p, target);
        }
        if let Some(t) = &mut self.sets[target] {
          t.ptrs.extend(merged.ptrs);
          t.is_mod |= merged.is_mod;
        }
      }
    }
    if let Some(t) = &mut self.sets[target] {
      t.ptrs.push(ptr);
      t.is_mod |= is_mod;
    }
    self.set_of.insert(ptr, target);
    target
  }

  /// Adds the pointer operands of every load and store of the blocks.
  pub fn add_blocks(&mut self, func: &Func, blocks: &[BlockIx]) {
    for b in blocks {
      for i in func.block_insts(*b) {
        match func.kind(*i) {
          InstKind::Load { ptr } => {
            self.add_pointer(func, *ptr, false);
          }
          InstKind::Store { ptr, .. } => {
            self.add_pointer(func, *ptr, true);
          }
          _ => {}
        }
      }
    }
  }

  pub fn set(&self, ix: usize) -> Option<&AliasSet> {
    self.sets.get(ix).and_then(|s| s.as_ref())
  }

  pub fn num_sets(&self) -> usize {
    self.sets.iter().filter(|s| s.is_some()).count()
  }
}

//=============================================================================
// Pair selection

/// Pairs of characterized base pointers of `r` that may alias, each as
/// `(smaller, larger)` and sorted.  Two bases the oracle proves disjoint are
/// never paired, even when a third pointer put them in the same set.  An empty result means the region needs
/// no run-time check.
#[inline(never)]
pub fn select_pairs(
  func: &Func, aa: &dyn AliasOracle, an: &FuncAnalyses, r: RegionIx,
  info: &RegionRangeInfo,
) -> Vec<(ValueIx, ValueIx)> {
  let mut ast = AliasSetTracker::new(aa);
  ast.add_blocks(func, &an.ri.blocks(func, &an.dt, r));

  let bases: Vec<ValueIx> = info.sorted_base_ptrs();
  for base in &bases {
    ast.add_pointer(func, *base, false);
  }
  // Look the sets up only now: adding a base may merge earlier sets.
  let mut pairs = vec![];
  for base in &bases {
    let ix = match ast.set_of.get(base) {
      Some(ix) => *ix,
      None => continue,
    };
    let set = match ast.set(ix) {
      Some(set) => set,
      None => continue,
    };
    for other in &set.ptrs {
      if *other == *base || !info.base_ptrs.contains_key(other) {
        continue;
      }
      // Sets merge transitively: two members need not alias each other.
      if aa.alias(func, *base, *other) == AliasResult::NoAlias {
        continue;
      }
      let pair = if *base < *other { (*base, *other) } else { (*other, *base) };
      pairs.push(pair);
    }
  }
  pairs.sort_unstable();
  pairs.dedup();
  trace!("select_pairs: {} alias sets", ast.num_sets());
  debug!(
    "select_pairs: region {}: {} pair(s) to check",
    an.ri.name(func, r),
    pairs.len()
  );
  pairs
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;
  use crate::range_analysis::PtrRangeAnalysis;
  use crate::scev::ScalarEvolution;

  #[test]
  fn distinct_identified_objects_do_not_alias() {
    let mut f = Func::new("objs", Type::Void);
    let p = f.add_param("p", Type::Ptr(Some(4)));
    let q = f.add_param("q", Type::Ptr(Some(4)));
    let r = f.add_param("r", Type::Ptr(Some(4)));
    f.set_noalias(r);
    let b = f.create_block("entry");
    let zero = f.iconst(Type::I64, 0);
    let slot = f.ins(b, i_alloca(8), Type::Ptr(Some(4)), "slot");
    let g = f.global("g", Type::Ptr(Some(4)));
    let pg = f.ins(b, i_gep(p, zero), Type::Ptr(Some(4)), "pg");
    f.append_inst(b, i_ret(None), Type::Void, "");

    let aa = BasicAliasOracle;
    assert_eq!(aa.alias(&f, p, p), AliasResult::MustAlias);
    assert_eq!(aa.alias(&f, p, q), AliasResult::MayAlias);
    assert_eq!(aa.alias(&f, pg, p), AliasResult::MayAlias);
    assert_eq!(aa.alias(&f, r, g), AliasResult::NoAlias);
    assert_eq!(aa.alias(&f, slot, g), AliasResult::NoAlias);
    assert_eq!(aa.alias(&f, slot, pg), AliasResult::NoAlias);
    assert_eq!(aa.alias(&f, q, g), AliasResult::MayAlias);
    assert_eq!(underlying_object(&f, pg), p);
  }

  // for (i = 0; i < n; i++) r[i] = g[i] + p[i];
  fn sum_into_noalias() -> (Func, ValueIx, ValueIx, ValueIx) {
    let mut f = Func::new("sum", Type::Void);
    let r = f.add_param("r", Type::Ptr(Some(4)));
    let p = f.add_param("p", Type::Ptr(Some(4)));
    let n = f.add_param("n", Type::I64);
    f.set_noalias(r);
    let g = f.global("g", Type::Ptr(Some(4)));
    let entry = f.create_block("entry");
    let head = f.create_block("head");
    let body = f.create_block("body");
    let exit = f.create_block("exit");
    let zero = f.iconst(Type::I64, 0);
    let one = f.iconst(Type::I64, 1);

    f.append_inst(entry, i_jump(head), Type::Void, "");
    let i = f.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "i");
    let cmp = f.ins(head, i_icmp(IntCC::Slt, i, n), Type::I1, "cmp");
    f.append_inst(head, i_br(cmp, body, exit), Type::Void, "");
    let pg = f.ins(body, i_gep(g, i), Type::Ptr(Some(4)), "pg");
    let x = f.ins(body, i_load(pg), Type::I32, "x");
    let pp = f.ins(body, i_gep(p, i), Type::Ptr(Some(4)), "pp");
    let y = f.ins(body, i_load(pp), Type::I32, "y");
    let s = f.ins(body, i_add(x, y), Type::I32, "s");
    let pr = f.ins(body, i_gep(r, i), Type::Ptr(Some(4)), "pr");
    f.append_inst(body, i_store(s, pr), Type::Void, "");
    let next = f.ins(body, i_add(i, one), Type::I64, "i.next");
    f.append_inst(body, i_jump(head), Type::Void, "");
    f.append_inst(exit, i_ret(None), Type::Void, "");
    if let Some(pi) = f.def_inst(i) {
      if let InstKind::Phi { incoming } = &mut f.insts[pi].kind {
        incoming.push((body, next));
      }
    }
    (f, r, p, g)
  }

  #[test]
  fn disjoint_members_of_one_set_are_not_paired() {
    let (f, r, p, g) = sum_into_noalias();
    let mut an = FuncAnalyses::compute(&f).unwrap();
    let mut se = ScalarEvolution::new();
    let mut pra = PtrRangeAnalysis::new();
    let aa = BasicAliasOracle;
    pra.run(&Module::new(), &f, &mut se, &mut an, &aa, false);
    let top = an.ri.top_level();
    let info = pra.info(top).unwrap();
    assert_eq!(info.base_ptrs.len(), 3);

    let pairs = select_pairs(&f, &aa, &an, top, info);
    let ordered = |a: ValueIx, b: ValueIx| if a < b { (a, b) } else { (b, a) };
    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&ordered(p, r)));
    assert!(pairs.contains(&ordered(p, g)));
    assert!(!pairs.contains(&ordered(r, g)));

    // Without alias information every pair is checked.
    let pairs = select_pairs(&f, &ConservativeAliasOracle, &an, top, info);
    assert_eq!(pairs.len(), 3);
  }

  #[test]
  fn tracker_merges_transitively() {
    let mut f = Func::new("sets", Type::Void);
    let p = f.add_param("p", Type::Ptr(Some(4)));
    let r = f.add_param("r", Type::Ptr(Some(4)));
    f.set_noalias(r);
    let g = f.global("g", Type::Ptr(Some(4)));
    f.create_block("entry");

    let aa = BasicAliasOracle;
    let mut ast = AliasSetTracker::new(&aa);
    let sr = ast.add_pointer(&f, r, false);
    let sg = ast.add_pointer(&f, g, true);
    assert_ne!(sr, sg);
    assert_eq!(ast.num_sets(), 2);
    // p may alias both r and g: everything ends up together.
    let sp = ast.add_pointer(&f, p, false);
    assert_eq!(ast.num_sets(), 1);
    let set = ast.set(sp).unwrap();
    assert_eq!(set.ptrs.len(), 3);
    assert!(set.is_mod);
  }
}
