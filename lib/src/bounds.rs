/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Symbolic bounds of expressions.
//!
//! A `BoundBuilder` computes, for a symbolic expression, a value that is
//! provably less than or equal to (lower bound) or greater than or equal to
//! (upper bound) every value the expression takes while a given region
//! runs.  Bounds are built out of region-invariant values and the trip
//! counts of the loops the expression depends on, so they can be evaluated
//! once, before the region is entered.
//!
//! The builder works in one of two modes.  In analysis mode nothing is
//! created: every successful step yields `BoundValue::Probe`, and the only
//! interesting outcome is whether a bound exists at all.  In materializing
//! mode the instructions computing the bound are inserted before the
//! insertion point, and results are memoized per (expression, insertion
//! point, direction).

#![allow(non_snake_case)]

use log::trace;

use crate::alias::{AliasOracle, AliasResult};
use crate::data_structures::{
  InstIx, LoopIx, Map, RegionIx, ScevIx, Set, ValueIx,
};
use crate::interface::FuncAnalyses;
use crate::ir::{
  signed_max, signed_min, BinOp, CastOp, Func, InstKind, IntCC, Type,
  ValueDef,
};
use crate::scev::{ScalarEvolution, ScevKind};

//=============================================================================
// Bound values

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BoundValue {
  /// Stands for a bound known to exist but not materialized.
  Probe,
  Val(ValueIx),
}

impl BoundValue {
  pub fn is_probe(self) -> bool {
    self == BoundValue::Probe
  }

  pub fn value(self) -> ValueIx {
    match self {
      BoundValue::Val(v) => v,
      BoundValue::Probe => panic!("BoundValue::value: analysis-mode probe"),
    }
  }
}

enum FuncRef<'a> {
  Shared(&'a Func),
  Exclusive(&'a mut Func),
}

impl<'a> FuncRef<'a> {
  fn get(&self) -> &Func {
    match self {
      FuncRef::Shared(f) => *f,
      FuncRef::Exclusive(f) => &**f,
    }
  }
}

//=============================================================================
// Region invariance

/// Is `v` guaranteed to have the same value during the whole execution of
/// region `r`?  Parameters, constants, globals and values defined outside
/// the region are.  An instruction inside the region is when it is not a
/// phi, has no side effects, all its operands are invariant and, for a
/// load, nothing in the region may write the loaded location.
pub fn is_invariant(
  func: &Func, an: &FuncAnalyses, aa: &dyn AliasOracle, r: RegionIx,
  v: ValueIx,
) -> bool {
  let mut visiting = Set::<ValueIx>::empty();
  is_invariant_wrk(func, an, aa, r, v, &mut visiting)
}

fn is_invariant_wrk(
  func: &Func, an: &FuncAnalyses, aa: &dyn AliasOracle, r: RegionIx,
  v: ValueIx, visiting: &mut Set<ValueIx>,
) -> bool {
  let i = match func.values[v].def {
    ValueDef::Inst(i) => i,
    ValueDef::Param(_)
    | ValueDef::Const(_)
    | ValueDef::Global(_)
    | ValueDef::Undef => return true,
  };
  if !an.ri.contains_inst(func, &an.dt, r, i) {
    return true;
  }
  let kind = func.kind(i);
  if kind.may_have_side_effects() || kind.is_phi() {
    return false;
  }
  // Cycles only go through phis, which were rejected above.
  if visiting.contains(v) {
    return false;
  }
  visiting.insert(v);
  for op in kind.operands() {
    if !is_invariant_wrk(func, an, aa, r, op, visiting) {
      return false;
    }
  }
  if let InstKind::Load { ptr } = kind {
    for b in an.ri.blocks(func, &an.dt, r) {
      for j in func.block_insts(b) {
        match func.kind(*j) {
          InstKind::Store { ptr: sptr, .. } => {
            if aa.alias(func, *sptr, *ptr) != AliasResult::NoAlias {
              return false;
            }
          }
          other if other.may_write_memory() => return false,
          _ => {}
        }
      }
    }
  }
  true
}

//=============================================================================
// The bound builder

pub struct BoundBuilder<'a> {
  func: FuncRef<'a>,
  se: &'a mut ScalarEvolution,
  an: &'a FuncAnalyses,
  aa: &'a dyn AliasOracle,
  region: RegionIx,
  insert_pt: InstIx,
  analysis_mode: bool,
  memo: Map<(ScevIx, InstIx, bool), ValueIx>,
  invariant_cache: Map<ValueIx, bool>,
  artificial_be_counts: Map<LoopIx, ScevIx>,
}

impl<'a> BoundBuilder<'a> {
  /// A builder that only answers whether bounds exist.  Values are taken to
  /// be available at the first non-phi instruction of the region's entry.
  pub fn for_analysis(
    func: &'a Func, se: &'a mut ScalarEvolution, an: &'a FuncAnalyses,
    aa: &'a dyn AliasOracle, region: RegionIx,
  ) -> Self {
    let entry = an.ri.entry(region);
    let insert_pt = match func.first_non_phi(entry) {
      Some(i) => i,
      None => panic!("BoundBuilder::for_analysis: entry block has no body"),
    };
    Self::new(FuncRef::Shared(func), se, an, aa, region, insert_pt, true)
  }

  /// A builder that inserts the bound computations before `insert_pt`.
  pub fn for_insertion(
    func: &'a mut Func, se: &'a mut ScalarEvolution, an: &'a FuncAnalyses,
    aa: &'a dyn AliasOracle, region: RegionIx, insert_pt: InstIx,
  ) -> Self {
    Self::new(FuncRef::Exclusive(func), se, an, aa, region, insert_pt, false)
  }

  fn new(
    func: FuncRef<'a>, se: &'a mut ScalarEvolution, an: &'a FuncAnalyses,
    aa: &'a dyn AliasOracle, region: RegionIx, insert_pt: InstIx,
    analysis_mode: bool,
  ) -> Self {
    Self {
      func,
      se,
      an,
      aa,
      region,
      insert_pt,
      analysis_mode,
      memo: Map::default(),
      invariant_cache: Map::default(),
      artificial_be_counts: Map::default(),
    }
  }

  pub fn func(&self) -> &Func {
    self.func.get()
  }

  pub fn se(&mut self) -> &mut ScalarEvolution {
    &mut *self.se
  }

  fn func_mut(&mut self) -> &mut Func {
    match &mut self.func {
      FuncRef::Exclusive(f) => &mut **f,
      FuncRef::Shared(_) => {
        panic!("BoundBuilder: cannot materialize into a shared function")
      }
    }
  }

  pub fn insert_point(&self) -> InstIx {
    self.insert_pt
  }

  pub fn set_insert_point(&mut self, at: InstIx) {
    self.insert_pt = at;
  }

  pub fn set_analysis_mode(&mut self, on: bool) {
    debug_assert!(on || matches!(self.func, FuncRef::Exclusive(_)));
    self.analysis_mode = on;
  }

  /// Trip-count bounds to use for loops whose backedge-taken count is not
  /// computable.
  pub fn set_artificial_be_counts(&mut self, counts: Map<LoopIx, ScevIx>) {
    self.artificial_be_counts = counts;
  }

  pub fn get_upper_bound(&mut self, s: ScevIx) -> Option<BoundValue> {
    self.expand(s, true)
  }

  pub fn get_lower_bound(&mut self, s: ScevIx) -> Option<BoundValue> {
    self.expand(s, false)
  }

  /// Both bounds of `s` exist.  Nothing is inserted.
  pub fn can_compute_bounds_for(&mut self, s: ScevIx) -> bool {
    let saved = self.analysis_mode;
    self.analysis_mode = true;
    let res = self.expand(s, false).is_some() && self.expand(s, true).is_some();
    self.analysis_mode = saved;
    res
  }

  /// Unsigned minimum of the lower bounds of every expression in `list`.
  pub fn get_ulower_bound(&mut self, list: &[ScevIx]) -> Option<BoundValue> {
    self.get_ulower_or_upper_bound(list, false)
  }

  /// Unsigned maximum of the upper bounds of every expression in `list`.
  pub fn get_uupper_bound(&mut self, list: &[ScevIx]) -> Option<BoundValue> {
    self.get_ulower_or_upper_bound(list, true)
  }

  fn get_ulower_or_upper_bound(
    &mut self, list: &[ScevIx], upper: bool,
  ) -> Option<BoundValue> {
    let (first, rest) = list.split_first()?;
    let best = self.expand(*first, upper)?;
    let mut best = self.coerce(best, Type::I64);
    for s in rest {
      let new = self.expand(*s, upper)?;
      let new = self.coerce(new, Type::I64);
      let cc = if upper { IntCC::Ugt } else { IntCC::Ult };
      let cmp = self.icmp(cc, new, best);
      let name = if upper { "umax" } else { "umin" };
      best = self.select(cmp, new, best, Type::I64, name);
    }
    Some(best)
  }

  /// An upper bound on the last byte touched through an access whose
  /// address is bounded by `upper`.
  pub fn stretch_ptr_upper_bound(
    &mut self, elem_size: u32, upper: BoundValue,
  ) -> BoundValue {
    let upper = self.coerce(upper, Type::I64);
    let size = self.konst(Type::I64, elem_size as i64);
    self.binop(BinOp::Add, upper, size, Type::I64)
  }

  //---------------------------------------------------------------------------
  // Expansion

  fn expand(&mut self, s: ScevIx, upper: bool) -> Option<BoundValue> {
    let key = (s, self.insert_pt, upper);
    if !self.analysis_mode {
      if let Some(v) = self.memo.get(&key) {
        return Some(BoundValue::Val(*v));
      }
    }
    let res = self.visit(s, upper);
    trace!(
      "BoundBuilder: {} bound of {}: {}",
      if upper { "upper" } else { "lower" },
      self.se.display(self.func.get(), s),
      match res {
        None => "not computable".to_string(),
        Some(BoundValue::Probe) => "exists".to_string(),
        Some(BoundValue::Val(v)) => self.func.get().display_value(v),
      }
    );
    if let (false, Some(BoundValue::Val(v))) = (self.analysis_mode, res) {
      self.memo.insert(key, v);
    }
    res
  }

  fn visit(&mut self, s: ScevIx, upper: bool) -> Option<BoundValue> {
    let ty = self.se.ty(s).effective();
    match self.se.kind(s).clone() {
      ScevKind::Constant(c) => Some(self.konst(ty, c)),
      ScevKind::Truncate(x) => self.visit_truncate(x, ty, upper),
      ScevKind::ZeroExtend(x) => {
        let b = self.expand(x, upper)?;
        let src = self.se.ty(x).effective();
        let b = self.coerce(b, src);
        Some(self.cast(CastOp::ZExt, b, ty))
      }
      ScevKind::SignExtend(x) => {
        let b = self.expand(x, upper)?;
        let src = self.se.ty(x).effective();
        let b = self.coerce(b, src);
        Some(self.cast(CastOp::SExt, b, ty))
      }
      ScevKind::Add(ops) => self.visit_add(&ops, ty, upper),
      ScevKind::Mul(ops) => self.visit_mul(&ops, ty, upper),
      ScevKind::UDiv(a, b) => self.visit_udiv(a, b, ty, upper),
      ScevKind::AddRec(ops, l) => {
        if ops.len() != 2 {
          // Quadratic recurrences grow faster than start + step * count.
          return None;
        }
        self.visit_add_rec(ops[0], ops[1], l, ty, upper)
      }
      ScevKind::UMax(ops) => self.visit_max(&ops, ty, upper, false),
      ScevKind::SMax(ops) => self.visit_max(&ops, ty, upper, true),
      ScevKind::Unknown(v) => self.visit_unknown(v, upper),
      ScevKind::CouldNotCompute => None,
    }
  }

  // Within the signed range of the destination the truncation of a bound is
  // a bound; outside it the bound is clamped to the limit of that range.
  fn visit_truncate(
    &mut self, x: ScevIx, ty: Type, upper: bool,
  ) -> Option<BoundValue> {
    let src = self.se.ty(x).effective();
    let b = self.expand(x, upper)?;
    let b = self.coerce(b, src);
    let dst_bits = ty.bits();
    let (cc, limit) = if upper {
      (IntCC::Sgt, signed_max(dst_bits))
    } else {
      (IntCC::Slt, signed_min(dst_bits))
    };
    let limit = self.konst(src, limit);
    let cmp = self.icmp(cc, b, limit);
    let sel = self.select(cmp, limit, b, src, "sbound");
    Some(self.cast(CastOp::Trunc, sel, ty))
  }

  fn visit_add(
    &mut self, ops: &[ScevIx], ty: Type, upper: bool,
  ) -> Option<BoundValue> {
    // Bounds of every term first, so that nothing is built for a sum with
    // an unbounded term.
    let mut terms = Vec::<(bool, BoundValue)>::new();
    for op in ops {
      if self.se.is_non_constant_negative(*op) {
        let neg = self.se.negate(*op);
        let b = self.expand(neg, !upper)?;
        terms.push((true, b));
      } else {
        let b = self.expand(*op, upper)?;
        terms.push((false, b));
      }
    }
    let mut acc = self.konst(ty, 0);
    for (negated, b) in terms {
      let b = self.coerce(b, ty);
      let op = if negated { BinOp::Sub } else { BinOp::Add };
      acc = self.binop(op, acc, b, ty);
    }
    Some(acc)
  }

  fn visit_mul(
    &mut self, ops: &[ScevIx], ty: Type, upper: bool,
  ) -> Option<BoundValue> {
    if ops.len() != 2 {
      return None;
    }
    let c1 = self.se.as_signed_constant(ops[0]);
    let c2 = self.se.as_signed_constant(ops[1]);
    let (c, x) = match (c1, c2) {
      (Some(a), Some(b)) => return Some(self.konst(ty, a.wrapping_mul(b))),
      (Some(c), None) => (c, ops[1]),
      (None, Some(c)) => (c, ops[0]),
      (None, None) => {
        // Monotone in both operands only when neither can be negative.
        if !self.se.is_known_non_negative(ops[0])
          || !self.se.is_known_non_negative(ops[1])
        {
          return None;
        }
        let a = self.expand(ops[0], upper)?;
        let b = self.expand(ops[1], upper)?;
        let a = self.coerce(a, ty);
        let b = self.coerce(b, ty);
        return Some(self.binop(BinOp::Mul, a, b, ty));
      }
    };
    let b = self.expand(x, if c < 0 { !upper } else { upper })?;
    let b = self.coerce(b, ty);
    let k = self.konst(ty, c);
    Some(self.binop(BinOp::Mul, k, b, ty))
  }

  fn visit_udiv(
    &mut self, a: ScevIx, b: ScevIx, ty: Type, upper: bool,
  ) -> Option<BoundValue> {
    if let Some(c) = self.se.as_constant(b) {
      let d = crate::ir::as_unsigned(c, ty.bits());
      if d == 0 {
        return None;
      }
      let lhs = self.expand(a, upper)?;
      let lhs = self.coerce(lhs, ty);
      if d.is_power_of_two() {
        let sh = self.konst(ty, d.trailing_zeros() as i64);
        return Some(self.binop(BinOp::LShr, lhs, sh, ty));
      }
      let k = self.konst(ty, c);
      return Some(self.binop(BinOp::UDiv, lhs, k, ty));
    }
    let lhs = self.expand(a, upper)?;
    let rhs = self.expand(b, !upper)?;
    let lhs = self.coerce(lhs, ty);
    let rhs = self.coerce(rhs, ty);
    let one = self.konst(ty, 1);
    let is_zero = self.icmp(IntCC::Ult, rhs, one);
    let rhs = self.select(is_zero, one, rhs, ty, "bnd");
    Some(self.binop(BinOp::UDiv, lhs, rhs, ty))
  }

  // The value of {start, +, step} over the iterations [0, T] of its loop
  // lies between start and start + step * T.
  fn visit_add_rec(
    &mut self, start: ScevIx, step: ScevIx, l: LoopIx, ty: Type, upper: bool,
  ) -> Option<BoundValue> {
    let count = {
      let computed = self.se.backedge_taken_count(
        self.func.get(),
        &self.an.li,
        &self.an.dt,
        l,
      );
      match computed.or_else(|| self.artificial_be_counts.get(&l).cloned()) {
        Some(count) => count,
        None => return None,
      }
    };
    let count = if self.se.ty(count).effective().bits() < ty.bits() {
      self.se.zero_extend(count, ty)
    } else {
      self.se.truncate(count, ty)
    };
    let trips = self.expand(count, true)?;
    let trips = self.coerce(trips, ty);

    let b_start = self.expand(start, upper)?;
    let b_start = self.coerce(b_start, ty);

    if let Some(c) = self.se.as_signed_constant(step) {
      if (c >= 0) != upper {
        return Some(b_start);
      }
      let k = self.konst(ty, c);
      let delta = self.binop(BinOp::Mul, k, trips, ty);
      return Some(self.binop(BinOp::Add, b_start, delta, ty));
    }

    // Symbolic step: only the part of step * T pointing in the query
    // direction moves the bound.
    let b_step = self.expand(step, upper)?;
    let b_step = self.coerce(b_step, ty);
    let delta = self.binop(BinOp::Mul, b_step, trips, ty);
    let zero = self.konst(ty, 0);
    let cc = if upper { IntCC::Sgt } else { IntCC::Slt };
    let cmp = self.icmp(cc, delta, zero);
    let delta = self.select(cmp, delta, zero, ty, "bnd");
    Some(self.binop(BinOp::Add, b_start, delta, ty))
  }

  fn visit_max(
    &mut self, ops: &[ScevIx], ty: Type, upper: bool, signed: bool,
  ) -> Option<BoundValue> {
    let mut bounds = vec![];
    for op in ops {
      let b = self.expand(*op, upper)?;
      bounds.push(b);
    }
    let cc = if signed { IntCC::Sgt } else { IntCC::Ugt };
    let mut acc = self.coerce(bounds[0], ty);
    for b in &bounds[1..] {
      let b = self.coerce(*b, ty);
      let cmp = self.icmp(cc, b, acc);
      acc = self.select(cmp, b, acc, ty, if signed { "smax" } else { "umax" });
    }
    Some(acc)
  }

  fn visit_unknown(&mut self, v: ValueIx, upper: bool) -> Option<BoundValue> {
    if self.usable(v) {
      let ty = self.func.get().value_ty(v).effective();
      let b = if self.analysis_mode { BoundValue::Probe } else { BoundValue::Val(v) };
      return Some(self.coerce(b, ty));
    }

    // x % d lies in [0, d) for a usable non-negative d.  srem takes the
    // sign of x, so x must be non-negative as well.
    let i = self.func.get().def_inst(v)?;
    let (signed, dividend, divisor) = match self.func.get().kind(i) {
      InstKind::Binary { op: BinOp::SRem, args } => (true, args[0], args[1]),
      InstKind::Binary { op: BinOp::URem, args } => (false, args[0], args[1]),
      _ => return None,
    };
    if !self.usable(divisor) {
      return None;
    }
    let func = self.func.get();
    let sd = self.se.get_scev(func, &self.an.li, divisor);
    if !self.se.is_known_non_negative(sd) {
      return None;
    }
    if signed {
      let sx = self.se.get_scev(func, &self.an.li, dividend);
      if !self.se.is_known_non_negative(sx) {
        return None;
      }
    }
    let ty = self.func.get().value_ty(v).effective();
    if upper {
      let b = if self.analysis_mode {
        BoundValue::Probe
      } else {
        BoundValue::Val(divisor)
      };
      Some(self.coerce(b, ty))
    } else {
      Some(self.konst(ty, 0))
    }
  }

  // Invariant in the region and available at the insertion point.
  fn usable(&mut self, v: ValueIx) -> bool {
    let invariant = match self.invariant_cache.get(&v) {
      Some(res) => *res,
      None => {
        let res =
          is_invariant(self.func.get(), self.an, self.aa, self.region, v);
        self.invariant_cache.insert(v, res);
        res
      }
    };
    if !invariant {
      return false;
    }
    match self.func.get().def_inst(v) {
      None => true,
      Some(i) => self.an.dt.inst_dominates(self.func.get(), i, self.insert_pt),
    }
  }

  //---------------------------------------------------------------------------
  // Instruction emission, with constant folding.  In analysis mode every
  // helper returns a probe.

  fn emit(&mut self, kind: InstKind, ty: Type, name: &str) -> BoundValue {
    let at = self.insert_pt;
    let func = self.func_mut();
    let i = func.insert_inst_before(at, kind, ty, name);
    BoundValue::Val(func.inst_result(i))
  }

  fn const_of(&self, b: BoundValue) -> Option<i64> {
    match b {
      BoundValue::Val(v) => self.func.get().const_value(v),
      BoundValue::Probe => None,
    }
  }

  fn konst(&mut self, ty: Type, c: i64) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    BoundValue::Val(self.func_mut().iconst(ty, c))
  }

  fn binop(
    &mut self, op: BinOp, a: BoundValue, b: BoundValue, ty: Type,
  ) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    match (op, self.const_of(a), self.const_of(b)) {
      (_, Some(x), Some(y)) => {
        if let Some(res) = op.calc(x, y, ty.bits()) {
          return self.konst(ty, res);
        }
      }
      (BinOp::Add, Some(0), _) => return b,
      (BinOp::Add, _, Some(0))
      | (BinOp::Sub, _, Some(0))
      | (BinOp::LShr, _, Some(0)) => return a,
      (BinOp::Mul, Some(1), _) => return b,
      (BinOp::Mul, _, Some(1)) => return a,
      (BinOp::Mul, Some(0), _) | (BinOp::Mul, _, Some(0)) => {
        return self.konst(ty, 0)
      }
      _ => {}
    }
    let kind = InstKind::Binary { op, args: [a.value(), b.value()] };
    self.emit(kind, ty, "bnd")
  }

  fn icmp(&mut self, cc: IntCC, a: BoundValue, b: BoundValue) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    if let (Some(x), Some(y)) = (self.const_of(a), self.const_of(b)) {
      let bits = self.func.get().value_ty(a.value()).effective().bits();
      return self.konst(Type::I1, cc.calc(x, y, bits) as i64);
    }
    let kind = InstKind::Icmp { cc, args: [a.value(), b.value()] };
    self.emit(kind, Type::I1, "bnd.cmp")
  }

  fn select(
    &mut self, cond: BoundValue, t: BoundValue, f: BoundValue, ty: Type,
    name: &str,
  ) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    match self.const_of(cond) {
      Some(c) if c & 1 != 0 => return t,
      Some(_) => return f,
      None => {}
    }
    if t == f {
      return t;
    }
    let kind = InstKind::Select { args: [cond.value(), t.value(), f.value()] };
    self.emit(kind, ty, name)
  }

  fn cast(&mut self, op: CastOp, b: BoundValue, ty: Type) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    let from = self.func.get().value_ty(b.value());
    if from == ty {
      return b;
    }
    if let Some(c) = self.const_of(b) {
      return self.konst(ty, op.apply(c, from, ty));
    }
    self.emit(InstKind::Cast { op, arg: b.value() }, ty, "bnd.cast")
  }

  // Brings a bound to the integer type `ty`: pointers are converted to
  // their address, narrower integers are sign-extended, wider ones
  // truncated.
  fn coerce(&mut self, b: BoundValue, ty: Type) -> BoundValue {
    if self.analysis_mode {
      return BoundValue::Probe;
    }
    let from = self.func.get().value_ty(b.value());
    if from == ty {
      return b;
    }
    if from.is_ptr() {
      let addr = self.cast(CastOp::PtrToInt, b, Type::I64);
      return self.coerce(addr, ty);
    }
    if from.bits() < ty.bits() {
      self.cast(CastOp::SExt, b, ty)
    } else {
      self.cast(CastOp::Trunc, b, ty)
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::alias::BasicAliasOracle;
  use crate::ir::*;
  use crate::test_utils::{counted_loop, eval_straight_line};

  fn setup(f: &Func) -> FuncAnalyses {
    FuncAnalyses::compute(f).unwrap()
  }

  #[test]
  fn access_bounds_hold_for_every_trip_count() {
    let (mut f, _, p) = counted_loop(IntCC::Slt, 0, 1);
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let access = se.get_scev(&f, &an.li, p);
    let top = an.ri.top_level();
    let entry = f.entry_block().unwrap();
    let at = f.terminator(entry).unwrap();

    {
      let mut probe = BoundBuilder::for_analysis(&f, &mut se, &an, &aa, top);
      assert!(probe.can_compute_bounds_for(access));
      assert_eq!(probe.get_upper_bound(access), Some(BoundValue::Probe));
    }
    let n_insts = f.insts.len();
    let (lo, hi) = {
      let mut bb =
        BoundBuilder::for_insertion(&mut f, &mut se, &an, &aa, top, at);
      // Analysis queries leave the function alone.
      assert!(bb.can_compute_bounds_for(access));
      assert_eq!(bb.func().insts.len(), n_insts);
      let lo = bb.get_lower_bound(access).unwrap().value();
      let hi = bb.get_upper_bound(access).unwrap().value();
      (lo, hi)
    };

    let a = f.params[0];
    let n = f.params[1];
    let base = 4096;
    for trips in -3..40i64 {
      let mut env = Map::default();
      env.insert(a, base);
      env.insert(n, trips);
      let lo_v = eval_straight_line(&f, &env, lo);
      let hi_v = eval_straight_line(&f, &env, hi);
      for i in 0..trips.max(0) {
        let addr = base + 4 * i;
        assert!(lo_v <= addr && addr <= hi_v, "n = {}, i = {}", trips, i);
      }
      assert_eq!(lo_v, base);
    }
  }

  #[test]
  fn bounds_are_memoized() {
    let (mut f, _, p) = counted_loop(IntCC::Slt, 0, 1);
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let access = se.get_scev(&f, &an.li, p);
    let entry = f.entry_block().unwrap();
    let at = f.terminator(entry).unwrap();
    let mut bb = BoundBuilder::for_insertion(
      &mut f,
      &mut se,
      &an,
      &aa,
      an.ri.top_level(),
      at,
    );
    let first = bb.get_upper_bound(access).unwrap();
    let n_insts = bb.func().insts.len();
    let second = bb.get_upper_bound(access).unwrap();
    assert_eq!(first, second);
    assert_eq!(bb.func().insts.len(), n_insts);
  }

  #[test]
  fn truncation_clamps_to_the_signed_range() {
    let mut f = Func::new("trunc", Type::Void);
    let x = f.add_param("x", Type::I64);
    let entry = f.create_block("entry");
    let at = f.append_inst(entry, i_ret(None), Type::Void, "");
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let sx = se.unknown(&f, x);
    let t = se.truncate(sx, Type::I32);
    let (lo, hi) = {
      let mut bb = BoundBuilder::for_insertion(
        &mut f,
        &mut se,
        &an,
        &aa,
        an.ri.top_level(),
        at,
      );
      let lo = bb.get_lower_bound(t).unwrap().value();
      let hi = bb.get_upper_bound(t).unwrap().value();
      (lo, hi)
    };
    let run = |v: ValueIx, arg: i64| {
      let mut env = Map::default();
      env.insert(x, arg);
      eval_straight_line(&f, &env, v)
    };
    assert_eq!(run(hi, 5), 5);
    assert_eq!(run(lo, -5), -5);
    assert_eq!(run(hi, 1 << 40), i32::MAX as i64);
    assert_eq!(run(lo, -(1 << 40)), i32::MIN as i64);
    assert_eq!(f.value_ty(hi), Type::I32);
  }

  #[test]
  fn quadratic_recurrences_have_no_bounds() {
    let (f, _, _) = counted_loop(IntCC::Slt, 0, 1);
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let zero = se.constant(Type::I64, 0);
    let one = se.constant(Type::I64, 1);
    let quad = se.add_rec(&[zero, zero, one], LoopIx::new(0), Type::I64);
    let affine = se.add_rec(&[zero, one], LoopIx::new(0), Type::I64);
    let mut bb =
      BoundBuilder::for_analysis(&f, &mut se, &an, &aa, an.ri.top_level());
    assert_eq!(bb.get_upper_bound(quad), None);
    assert_eq!(bb.get_lower_bound(quad), None);
    assert!(!bb.can_compute_bounds_for(quad));
    assert!(bb.can_compute_bounds_for(affine));
  }

  #[test]
  fn unsupported_shapes_are_not_computable() {
    let (f, i, _) = counted_loop(IntCC::Eq, 0, 1);
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    // No trip count for an equality-controlled loop.
    let si = se.get_scev(&f, &an.li, i);
    let n = se.unknown(&f, f.params[1]);
    let zero = se.constant(Type::I64, 0);
    let by_zero = se.udiv(n, zero);
    let nn = se.mul(&[n, n]);
    let cnc = se.could_not_compute();
    let mut bb =
      BoundBuilder::for_analysis(&f, &mut se, &an, &aa, an.ri.top_level());
    assert!(!bb.can_compute_bounds_for(si));
    assert!(!bb.can_compute_bounds_for(by_zero));
    // %n may be negative.
    assert!(!bb.can_compute_bounds_for(nn));
    assert!(!bb.can_compute_bounds_for(cnc));
    assert!(bb.can_compute_bounds_for(n));

    let mut counts = Map::default();
    let ten = bb.se.constant(Type::I64, 10);
    counts.insert(LoopIx::new(0), ten);
    bb.set_artificial_be_counts(counts);
    assert!(bb.can_compute_bounds_for(si));
  }

  #[test]
  fn negative_steps_move_the_lower_bound() {
    // for (i = n; i > 0; i--) A[i] = 0
    let (mut f, i, _) = counted_loop(IntCC::Sgt, -1, -1);
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let si = se.get_scev(&f, &an.li, i);
    let entry = f.entry_block().unwrap();
    let at = f.terminator(entry).unwrap();
    let (lo, hi) = {
      let mut bb = BoundBuilder::for_insertion(
        &mut f,
        &mut se,
        &an,
        &aa,
        an.ri.top_level(),
        at,
      );
      let lo = bb.get_lower_bound(si).unwrap().value();
      let hi = bb.get_upper_bound(si).unwrap().value();
      (lo, hi)
    };
    let n = f.params[1];
    for limit in -20..0i64 {
      let mut env = Map::default();
      env.insert(n, limit);
      assert_eq!(eval_straight_line(&f, &env, hi), -1);
      assert!(eval_straight_line(&f, &env, lo) <= limit + 1);
    }
  }

  #[test]
  fn remainders_need_non_negative_operands() {
    let mut f = Func::new("rem", Type::Void);
    let x = f.add_param("x", Type::I64);
    let y = f.add_param("y", Type::I32);
    let d = f.add_param("d", Type::I64);
    let entry = f.create_block("entry");
    let c16 = f.iconst(Type::I64, 16);
    let srem = f.ins(entry, i_binary(BinOp::SRem, x, c16), Type::I64, "srem");
    let urem = f.ins(entry, i_binary(BinOp::URem, x, c16), Type::I64, "urem");
    let by_d = f.ins(entry, i_binary(BinOp::URem, x, d), Type::I64, "by_d");
    let yz = f.ins(entry, i_cast(CastOp::ZExt, y), Type::I64, "yz");
    let srem_yz = f.ins(entry, i_binary(BinOp::SRem, yz, c16), Type::I64, "srem_yz");
    let at = f.append_inst(entry, i_ret(None), Type::Void, "");
    let an = setup(&f);
    let aa = BasicAliasOracle;
    let mut se = ScalarEvolution::new();
    let s_srem = se.get_scev(&f, &an.li, srem);
    let s_urem = se.get_scev(&f, &an.li, urem);
    let s_by_d = se.get_scev(&f, &an.li, by_d);
    let s_srem_yz = se.get_scev(&f, &an.li, srem_yz);
    {
      let mut bb =
        BoundBuilder::for_analysis(&f, &mut se, &an, &aa, an.ri.top_level());
      // -5 srem 16 is -5.
      assert!(!bb.can_compute_bounds_for(s_srem));
      assert!(bb.can_compute_bounds_for(s_urem));
      // %d may be negative.
      assert!(!bb.can_compute_bounds_for(s_by_d));
      assert!(bb.can_compute_bounds_for(s_srem_yz));
    }

    let (lo, hi) = {
      let mut bb = BoundBuilder::for_insertion(
        &mut f,
        &mut se,
        &an,
        &aa,
        an.ri.top_level(),
        at,
      );
      let lo = bb.get_lower_bound(s_srem_yz).unwrap().value();
      let hi = bb.get_upper_bound(s_srem_yz).unwrap().value();
      (lo, hi)
    };
    let env = Map::default();
    assert_eq!(eval_straight_line(&f, &env, lo), 0);
    assert_eq!(eval_straight_line(&f, &env, hi), 16);
  }
}
