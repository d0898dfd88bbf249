/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Symbolic expressions for integer and pointer values.
//!
//! Expressions are hash-consed in an arena owned by `ScalarEvolution`, so
//! two structurally equal expressions always have the same `ScevIx`.  Loop
//! induction variables are described by add-recurrences
//! `{start, +, step}<L>`, whose value at iteration `k` of loop `L` is
//! `start + step * k`.  Three-operand recurrences `{a, +, b, +, c}<L>`
//! describe quadratic induction variables.

#![allow(non_snake_case)]

use log::trace;
use smallvec::SmallVec;

use crate::cfg::DomTree;
use crate::data_structures::{BlockIx, LoopIx, Map, ScevIx, TypedIxVec, ValueIx};
use crate::ir::{
  as_unsigned, normalize, to_signed, BinOp, CastOp, Func, InstKind, IntCC,
  Type, ValueDef,
};
use crate::loops::LoopInfo;

pub type ScevOps = SmallVec<[ScevIx; 4]>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScevKind {
  Constant(i64),
  Truncate(ScevIx),
  ZeroExtend(ScevIx),
  SignExtend(ScevIx),
  Add(ScevOps),
  Mul(ScevOps),
  UDiv(ScevIx, ScevIx),
  AddRec(ScevOps, LoopIx),
  UMax(ScevOps),
  SMax(ScevOps),
  Unknown(ValueIx),
  CouldNotCompute,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScevData {
  pub kind: ScevKind,
  /// Pointer-typed expressions keep their pointer type so that the element
  /// size of a base pointer can be recovered.
  pub ty: Type,
}

pub struct ScalarEvolution {
  exprs: TypedIxVec<ScevIx, ScevData>,
  uniq: Map<ScevData, ScevIx>,
  value_map: Map<ValueIx, ScevIx>,
  // Values added to |value_map|, in order.  Used to forget everything that
  // was derived while a phi was only known through a placeholder.
  value_log: Vec<ValueIx>,
  be_counts: Map<LoopIx, Option<ScevIx>>,
}

fn width(ty: Type) -> u8 {
  ty.effective().bits()
}

impl ScalarEvolution {
  pub fn new() -> Self {
    Self {
      exprs: TypedIxVec::new(),
      uniq: Map::default(),
      value_map: Map::default(),
      value_log: vec![],
      be_counts: Map::default(),
    }
  }

  pub fn num_exprs(&self) -> usize {
    self.exprs.len() as usize
  }

  pub fn kind(&self, s: ScevIx) -> &ScevKind {
    &self.exprs[s].kind
  }

  pub fn ty(&self, s: ScevIx) -> Type {
    self.exprs[s].ty
  }

  fn intern(&mut self, kind: ScevKind, ty: Type) -> ScevIx {
    let data = ScevData { kind, ty };
    if let Some(s) = self.uniq.get(&data) {
      return *s;
    }
    let s = self.exprs.push(data.clone());
    self.uniq.insert(data, s);
    s
  }

  //---------------------------------------------------------------------------
  // Leaves

  pub fn constant(&mut self, ty: Type, c: i64) -> ScevIx {
    let ty = ty.effective();
    self.intern(ScevKind::Constant(normalize(c, ty.bits())), ty)
  }

  pub fn unknown(&mut self, func: &Func, v: ValueIx) -> ScevIx {
    self.intern(ScevKind::Unknown(v), func.value_ty(v))
  }

  pub fn could_not_compute(&mut self) -> ScevIx {
    self.intern(ScevKind::CouldNotCompute, Type::Void)
  }

  pub fn as_constant(&self, s: ScevIx) -> Option<i64> {
    match self.exprs[s].kind {
      ScevKind::Constant(c) => Some(c),
      _ => None,
    }
  }

  /// The constant as a signed number of the expression's width.
  pub fn as_signed_constant(&self, s: ScevIx) -> Option<i64> {
    self.as_constant(s).map(|c| to_signed(c, width(self.ty(s))))
  }

  pub fn as_unknown(&self, s: ScevIx) -> Option<ValueIx> {
    match self.exprs[s].kind {
      ScevKind::Unknown(v) => Some(v),
      _ => None,
    }
  }

  /// Operands and loop of an add-recurrence.
  pub fn as_add_rec(&self, s: ScevIx) -> Option<(ScevOps, LoopIx)> {
    match &self.exprs[s].kind {
      ScevKind::AddRec(ops, l) => Some((ops.clone(), *l)),
      _ => None,
    }
  }

  pub fn is_affine_add_rec(&self, s: ScevIx) -> bool {
    matches!(&self.exprs[s].kind, ScevKind::AddRec(ops, _) if ops.len() == 2)
  }

  //---------------------------------------------------------------------------
  // Casts

  pub fn truncate(&mut self, s: ScevIx, ty: Type) -> ScevIx {
    let from = width(self.ty(s));
    if ty.bits() >= from {
      return s;
    }
    match self.kind(s).clone() {
      ScevKind::Constant(c) => self.constant(ty, c),
      ScevKind::Truncate(inner) => self.truncate(inner, ty),
      ScevKind::ZeroExtend(inner) | ScevKind::SignExtend(inner)
        if width(self.ty(inner)) == ty.bits() =>
      {
        inner
      }
      _ => self.intern(ScevKind::Truncate(s), ty),
    }
  }

  pub fn zero_extend(&mut self, s: ScevIx, ty: Type) -> ScevIx {
    let from = width(self.ty(s));
    if ty.bits() <= from {
      return s;
    }
    match self.kind(s).clone() {
      ScevKind::Constant(c) => self.constant(ty, as_unsigned(c, from) as i64),
      ScevKind::ZeroExtend(inner) => self.zero_extend(inner, ty),
      _ => self.intern(ScevKind::ZeroExtend(s), ty),
    }
  }

  pub fn sign_extend(&mut self, s: ScevIx, ty: Type) -> ScevIx {
    let from = width(self.ty(s));
    if ty.bits() <= from {
      return s;
    }
    match self.kind(s).clone() {
      ScevKind::Constant(c) => self.constant(ty, to_signed(c, from)),
      ScevKind::SignExtend(inner) => self.sign_extend(inner, ty),
      _ => self.intern(ScevKind::SignExtend(s), ty),
    }
  }

  //---------------------------------------------------------------------------
  // Arithmetic

  // Constants first, then by arena index.
  fn sort_operands(&self, ops: &mut ScevOps) {
    ops.sort_by_key(|s| (self.as_constant(*s).is_none(), *s));
  }

  fn result_ty(&self, ops: &[ScevIx]) -> Type {
    ops
      .iter()
      .map(|s| self.ty(*s))
      .find(|ty| ty.is_ptr())
      .unwrap_or_else(|| self.ty(ops[0]).effective())
  }

  pub fn add(&mut self, ops: &[ScevIx]) -> ScevIx {
    assert!(!ops.is_empty(), "ScalarEvolution::add: no operands");
    let ty = self.result_ty(ops);
    let bits = width(ty);

    // Flatten nested sums, fold constants.
    let mut flat = ScevOps::new();
    let mut cst: i64 = 0;
    let mut work: Vec<ScevIx> = ops.to_vec();
    while let Some(s) = work.pop() {
      match self.kind(s).clone() {
        ScevKind::Add(inner) => work.extend(inner.iter().cloned()),
        ScevKind::Constant(c) => cst = cst.wrapping_add(c),
        _ => flat.push(s),
      }
    }
    let cst = normalize(cst, bits);

    // Merge recurrences of the same loop, operand-wise.
    let mut recs: Vec<(LoopIx, ScevOps)> = vec![];
    let mut rest = ScevOps::new();
    for s in flat {
      match self.kind(s).clone() {
        ScevKind::AddRec(rops, l) => {
          match recs.iter_mut().find(|(rl, _)| *rl == l) {
            Some((_, acc)) => {
              let mut merged = ScevOps::new();
              for k in 0..acc.len().max(rops.len()) {
                merged.push(match (acc.get(k), rops.get(k)) {
                  (Some(a), Some(b)) => self.add(&[*a, *b]),
                  (Some(a), None) => *a,
                  (None, Some(b)) => *b,
                  (None, None) => unreachable!(),
                });
              }
              *acc = merged;
            }
            None => recs.push((l, rops)),
          }
        }
        _ => rest.push(s),
      }
    }

    // A constant goes into the start of the first recurrence.
    let mut cst_pending = cst != 0;
    let mut result = rest;
    for (l, mut rops) in recs {
      if cst_pending {
        let c = self.constant(self.ty(rops[0]), cst);
        rops[0] = self.add(&[rops[0], c]);
        cst_pending = false;
      }
      let rec_ty = self.result_ty(&rops);
      result.push(self.add_rec(&rops, l, rec_ty));
    }
    if cst_pending {
      result.push(self.constant(ty, cst));
    }

    match result.len() {
      0 => self.constant(ty, 0),
      1 => result[0],
      _ => {
        self.sort_operands(&mut result);
        self.intern(ScevKind::Add(result), ty)
      }
    }
  }

  pub fn mul(&mut self, ops: &[ScevIx]) -> ScevIx {
    assert!(!ops.is_empty(), "ScalarEvolution::mul: no operands");
    let ty = self.result_ty(ops);
    let bits = width(ty);

    let mut flat = ScevOps::new();
    let mut cst: i64 = 1;
    let mut work: Vec<ScevIx> = ops.to_vec();
    while let Some(s) = work.pop() {
      match self.kind(s).clone() {
        ScevKind::Mul(inner) => work.extend(inner.iter().cloned()),
        ScevKind::Constant(c) => cst = cst.wrapping_mul(c),
        _ => flat.push(s),
      }
    }
    let cst = normalize(cst, bits);
    if cst == 0 || flat.is_empty() {
      return self.constant(ty, cst);
    }
    if cst == 1 && flat.len() == 1 {
      return flat[0];
    }

    // Distribute a constant over a single sum or recurrence.
    if flat.len() == 1 {
      match self.kind(flat[0]).clone() {
        ScevKind::Add(terms) => {
          let mut scaled = vec![];
          for t in terms {
            let c = self.constant(self.ty(t), cst);
            scaled.push(self.mul(&[c, t]));
          }
          return self.add(&scaled);
        }
        ScevKind::AddRec(rops, l) => {
          let mut scaled = ScevOps::new();
          for t in rops {
            let c = self.constant(self.ty(t), cst);
            scaled.push(self.mul(&[c, t]));
          }
          return self.add_rec(&scaled, l, ty);
        }
        _ => {}
      }
    }

    let mut result = flat;
    if cst != 1 {
      result.push(self.constant(ty, cst));
    }
    if result.len() == 1 {
      return result[0];
    }
    self.sort_operands(&mut result);
    self.intern(ScevKind::Mul(result), ty)
  }

  pub fn negate(&mut self, s: ScevIx) -> ScevIx {
    let m1 = self.constant(self.ty(s), -1);
    self.mul(&[m1, s])
  }

  pub fn minus(&mut self, a: ScevIx, b: ScevIx) -> ScevIx {
    let nb = self.negate(b);
    self.add(&[a, nb])
  }

  pub fn udiv(&mut self, lhs: ScevIx, rhs: ScevIx) -> ScevIx {
    let ty = self.ty(lhs).effective();
    let bits = width(ty);
    match (self.as_constant(lhs), self.as_constant(rhs)) {
      (_, Some(1)) => lhs,
      (Some(a), Some(b)) if as_unsigned(b, bits) != 0 => {
        let q = as_unsigned(a, bits) / as_unsigned(b, bits);
        self.constant(ty, q as i64)
      }
      _ => self.intern(ScevKind::UDiv(lhs, rhs), ty),
    }
  }

  pub fn add_rec(&mut self, ops: &[ScevIx], l: LoopIx, ty: Type) -> ScevIx {
    let mut ops: ScevOps = ops.iter().cloned().collect();
    while ops.len() > 1
      && ops.last().map_or(false, |s| self.as_constant(*s) == Some(0))
    {
      ops.pop();
    }
    if ops.len() == 1 {
      return ops[0];
    }
    self.intern(ScevKind::AddRec(ops, l), ty)
  }

  fn max_common(&mut self, ops: &[ScevIx], signed: bool) -> ScevIx {
    let ty = self.result_ty(ops);
    let bits = width(ty);
    let mut flat = ScevOps::new();
    let mut cst: Option<i64> = None;
    let mut work: Vec<ScevIx> = ops.to_vec();
    while let Some(s) = work.pop() {
      match (self.kind(s).clone(), signed) {
        (ScevKind::SMax(inner), true) | (ScevKind::UMax(inner), false) => {
          work.extend(inner.iter().cloned())
        }
        (ScevKind::Constant(c), _) => {
          cst = Some(match cst {
            None => c,
            Some(prev) => {
              let greater = if signed {
                to_signed(c, bits) > to_signed(prev, bits)
              } else {
                as_unsigned(c, bits) > as_unsigned(prev, bits)
              };
              if greater {
                c
              } else {
                prev
              }
            }
          })
        }
        _ => {
          if !flat.contains(&s) {
            flat.push(s)
          }
        }
      }
    }
    if let Some(c) = cst {
      flat.push(self.constant(ty, c));
    }
    if flat.len() == 1 {
      return flat[0];
    }
    self.sort_operands(&mut flat);
    if signed {
      self.intern(ScevKind::SMax(flat), ty)
    } else {
      self.intern(ScevKind::UMax(flat), ty)
    }
  }

  pub fn smax(&mut self, ops: &[ScevIx]) -> ScevIx {
    self.max_common(ops, true)
  }

  pub fn umax(&mut self, ops: &[ScevIx]) -> ScevIx {
    self.max_common(ops, false)
  }

  //---------------------------------------------------------------------------
  // From values

  /// The expression for `v`.  Results are cached per value.
  pub fn get_scev(&mut self, func: &Func, li: &LoopInfo, v: ValueIx) -> ScevIx {
    if let Some(s) = self.value_map.get(&v) {
      return *s;
    }
    let s = self.create_scev(func, li, v);
    self.value_map.insert(v, s);
    self.value_log.push(v);
    s
  }

  fn create_scev(&mut self, func: &Func, li: &LoopInfo, v: ValueIx) -> ScevIx {
    let ty = func.value_ty(v);
    let i = match func.values[v].def {
      ValueDef::Const(c) => return self.constant(ty, c),
      ValueDef::Inst(i) => i,
      _ => return self.unknown(func, v),
    };
    match func.kind(i).clone() {
      InstKind::Binary { op, args } if ty.is_int() => {
        let a = self.get_scev(func, li, args[0]);
        let b = self.get_scev(func, li, args[1]);
        match op {
          BinOp::Add => self.add(&[a, b]),
          BinOp::Sub => self.minus(a, b),
          BinOp::Mul => self.mul(&[a, b]),
          BinOp::UDiv => self.udiv(a, b),
          BinOp::Shl => match self.as_constant(b) {
            Some(k) if k >= 0 && k < ty.bits() as i64 => {
              let scale = self.constant(ty, 1i64 << k);
              self.mul(&[a, scale])
            }
            _ => self.unknown(func, v),
          },
          _ => self.unknown(func, v),
        }
      }
      InstKind::Cast { op, arg } => {
        let a = self.get_scev(func, li, arg);
        match op {
          CastOp::Trunc => self.truncate(a, ty),
          CastOp::ZExt => self.zero_extend(a, ty),
          CastOp::SExt => self.sign_extend(a, ty),
          _ => self.unknown(func, v),
        }
      }
      InstKind::Gep { base, index } => {
        let elem_size = match func.value_ty(base).elem_size() {
          Some(size) => size,
          None => return self.unknown(func, v),
        };
        let b = self.get_scev(func, li, base);
        let idx = self.get_scev(func, li, index);
        let idx = self.sign_extend(idx, Type::I64);
        let size = self.constant(Type::I64, elem_size as i64);
        let offset = self.mul(&[size, idx]);
        let sum = self.add(&[b, offset]);
        // Keep the type of the gep itself.
        match self.kind(sum).clone() {
          ScevKind::Add(ops) => self.intern(ScevKind::Add(ops), ty),
          ScevKind::AddRec(ops, l) => self.intern(ScevKind::AddRec(ops, l), ty),
          _ => sum,
        }
      }
      InstKind::Select { args } => {
        self.create_node_for_select(func, li, v, args).unwrap_or_else(|| self.unknown(func, v))
      }
      InstKind::Phi { incoming } => self.create_node_for_phi(func, li, v, &incoming),
      _ => self.unknown(func, v),
    }
  }

  // select(a > b, a, b) is a maximum.
  fn create_node_for_select(
    &mut self, func: &Func, li: &LoopInfo, v: ValueIx, args: [ValueIx; 3],
  ) -> Option<ScevIx> {
    if !func.value_ty(v).is_int() {
      return None;
    }
    let ci = func.def_inst(args[0])?;
    let (cc, cargs) = match func.kind(ci) {
      InstKind::Icmp { cc, args } => (*cc, *args),
      _ => return None,
    };
    let (cc, x, y) = if cargs == [args[1], args[2]] {
      (cc, args[1], args[2])
    } else if cargs == [args[2], args[1]] {
      (cc.swap_args(), args[1], args[2])
    } else {
      return None;
    };
    let a = self.get_scev(func, li, x);
    let b = self.get_scev(func, li, y);
    match cc {
      IntCC::Sgt | IntCC::Sge => Some(self.smax(&[a, b])),
      IntCC::Ugt | IntCC::Uge => Some(self.umax(&[a, b])),
      _ => None,
    }
  }

  fn forget_since(&mut self, mark: usize) {
    for v in self.value_log.drain(mark..) {
      self.value_map.remove(&v);
    }
  }

  fn create_node_for_phi(
    &mut self, func: &Func, li: &LoopInfo, v: ValueIx,
    incoming: &[(BlockIx, ValueIx)],
  ) -> ScevIx {
    let placeholder = self.unknown(func, v);
    let others: Vec<ValueIx> =
      incoming.iter().map(|(_, iv)| *iv).filter(|iv| *iv != v).collect();
    if let Some(first) = others.first() {
      if others.iter().all(|iv| iv == first) {
        return self.get_scev(func, li, *first);
      }
    }

    let i = match func.def_inst(v) {
      Some(i) => i,
      None => return placeholder,
    };
    let b = match func.inst_block(i) {
      Some(b) => b,
      None => return placeholder,
    };
    let l = match li.loop_for(b) {
      Some(l) if li.header(l) == b => l,
      _ => return placeholder,
    };
    if incoming.len() != 2 {
      return placeholder;
    }
    let (start_v, be_v) = {
      let inside0 = li.contains_block(l, incoming[0].0);
      let inside1 = li.contains_block(l, incoming[1].0);
      match (inside0, inside1) {
        (false, true) => (incoming[0].1, incoming[1].1),
        (true, false) => (incoming[1].1, incoming[0].1),
        _ => return placeholder,
      }
    };

    // Evaluate the backedge value with the phi standing for itself, then
    // forget everything computed under that assumption.
    let mark = self.value_log.len();
    self.value_map.insert(v, placeholder);
    self.value_log.push(v);
    let be = self.get_scev(func, li, be_v);
    let step = match self.kind(be).clone() {
      ScevKind::Add(ops) if ops.contains(&placeholder) => {
        let pos = ops.iter().position(|s| *s == placeholder).unwrap_or(0);
        let mut rest = ops.clone();
        rest.remove(pos);
        Some(self.add(&rest))
      }
      _ => None,
    };
    self.forget_since(mark);

    let step = match step {
      Some(step) => step,
      None => return placeholder,
    };
    let start = self.get_scev(func, li, start_v);
    let ty = func.value_ty(v);
    if self.is_loop_invariant(func, li, step, l) {
      let rec = self.add_rec(&[start, step], l, ty);
      trace!("ScalarEvolution: phi {} = {}", func.value_name(v), self.display(func, rec));
      return rec;
    }
    if let ScevKind::AddRec(sops, sl) = self.kind(step).clone() {
      let invariant = sops.iter().all(|s| self.is_loop_invariant(func, li, *s, l));
      if sl == l && sops.len() == 2 && invariant {
        return self.add_rec(&[start, sops[0], sops[1]], l, ty);
      }
    }
    placeholder
  }

  //---------------------------------------------------------------------------
  // Queries

  /// Does `s` have the same value on every iteration of `l`?
  pub fn is_loop_invariant(
    &self, func: &Func, li: &LoopInfo, s: ScevIx, l: LoopIx,
  ) -> bool {
    match &self.exprs[s].kind {
      ScevKind::Constant(_) => true,
      ScevKind::CouldNotCompute => false,
      ScevKind::Unknown(v) => match func.def_inst(*v).and_then(|i| func.inst_block(i)) {
        Some(b) => !li.contains_block(l, b),
        None => true,
      },
      ScevKind::Truncate(x) | ScevKind::ZeroExtend(x) | ScevKind::SignExtend(x) => {
        self.is_loop_invariant(func, li, *x, l)
      }
      ScevKind::UDiv(a, b) => {
        self.is_loop_invariant(func, li, *a, l) && self.is_loop_invariant(func, li, *b, l)
      }
      ScevKind::Add(ops) | ScevKind::Mul(ops) | ScevKind::UMax(ops) | ScevKind::SMax(ops) => {
        ops.iter().all(|o| self.is_loop_invariant(func, li, *o, l))
      }
      ScevKind::AddRec(ops, rl) => {
        // A recurrence of an enclosing loop is fixed while `l` runs.
        *rl != l
          && li.contains_loop(*rl, l)
          && ops.iter().all(|o| self.is_loop_invariant(func, li, *o, l))
      }
    }
  }

  /// Signed non-negativity that follows from the shape of `s` alone.
  pub fn is_known_non_negative(&self, s: ScevIx) -> bool {
    match &self.exprs[s].kind {
      ScevKind::Constant(_) => self.as_signed_constant(s).map_or(false, |c| c >= 0),
      ScevKind::ZeroExtend(x) => width(self.ty(s)) > width(self.ty(*x)),
      ScevKind::SignExtend(x) => self.is_known_non_negative(*x),
      ScevKind::Add(ops) | ScevKind::Mul(ops) | ScevKind::AddRec(ops, _) => {
        ops.iter().all(|o| self.is_known_non_negative(*o))
      }
      ScevKind::UDiv(a, _) => self.is_known_non_negative(*a),
      ScevKind::SMax(ops) => ops.iter().any(|o| self.is_known_non_negative(*o)),
      ScevKind::UMax(ops) => ops.iter().all(|o| self.is_known_non_negative(*o)),
      ScevKind::Truncate(_) | ScevKind::Unknown(_) | ScevKind::CouldNotCompute => false,
    }
  }

  /// A product whose leading constant is negative, i.e. `-c * X` with
  /// `c > 0`.
  pub fn is_non_constant_negative(&self, s: ScevIx) -> bool {
    match &self.exprs[s].kind {
      ScevKind::Mul(ops) => {
        matches!(self.as_signed_constant(ops[0]), Some(c) if c < 0)
      }
      _ => false,
    }
  }

  /// Strips offsets off a pointer expression.
  pub fn get_pointer_base(&self, s: ScevIx) -> ScevIx {
    let mut cur = s;
    loop {
      match &self.exprs[cur].kind {
        ScevKind::AddRec(ops, _) => cur = ops[0],
        ScevKind::Add(ops) => {
          match ops.iter().rev().find(|o| self.ty(**o).is_ptr()) {
            Some(o) => cur = *o,
            None => return cur,
          }
        }
        _ => return cur,
      }
    }
  }

  //---------------------------------------------------------------------------
  // Trip counts

  /// The number of times the backedge of `l` is taken, as an expression
  /// invariant in `l`.  Only loops with a single exiting block that runs on
  /// every iteration and tests an affine induction variable with a constant
  /// step against an invariant limit are understood.  Wrap-around of the
  /// induction variable is not considered.
  pub fn backedge_taken_count(
    &mut self, func: &Func, li: &LoopInfo, dt: &DomTree, l: LoopIx,
  ) -> Option<ScevIx> {
    if let Some(res) = self.be_counts.get(&l) {
      return *res;
    }
    let res = self.compute_backedge_taken_count(func, li, dt, l);
    if let Some(count) = res {
      trace!(
        "ScalarEvolution: backedge-taken count of {:?} = {}",
        l,
        self.display(func, count)
      );
    }
    self.be_counts.insert(l, res);
    res
  }

  fn compute_backedge_taken_count(
    &mut self, func: &Func, li: &LoopInfo, dt: &DomTree, l: LoopIx,
  ) -> Option<ScevIx> {
    let exiting = li.exiting_blocks(func, l);
    if exiting.len() != 1 {
      return None;
    }
    let exiting = exiting[0];
    if !li.latches(func, l).iter().all(|latch| dt.dominates(exiting, *latch)) {
      return None;
    }
    let term = func.terminator(exiting)?;
    let (cond, dests) = match func.kind(term) {
      InstKind::Branch { cond, dests } => (*cond, *dests),
      _ => return None,
    };
    let (cc, args) = match func.kind(func.def_inst(cond)?) {
      InstKind::Icmp { cc, args } => (*cc, *args),
      _ => return None,
    };

    // The condition under which the loop keeps going.
    let cc = match (li.contains_block(l, dests[0]), li.contains_block(l, dests[1])) {
      (true, false) => cc,
      (false, true) => cc.inverse(),
      _ => return None,
    };

    let a = self.get_scev(func, li, args[0]);
    let b = self.get_scev(func, li, args[1]);
    let is_iv = |se: &Self, s: ScevIx| {
      matches!(se.kind(s), ScevKind::AddRec(ops, rl) if *rl == l && ops.len() == 2)
    };
    let (iv, limit, cc) = if is_iv(self, a) && self.is_loop_invariant(func, li, b, l) {
      (a, b, cc)
    } else if is_iv(self, b) && self.is_loop_invariant(func, li, a, l) {
      (b, a, cc.swap_args())
    } else {
      return None;
    };
    if !self.ty(iv).is_int() {
      return None;
    }
    let ty = self.ty(iv);
    let (ops, _) = self.as_add_rec(iv)?;
    let start = ops[0];
    let step = self.as_signed_constant(ops[1])?;

    let one = self.constant(ty, 1);
    let m_one = self.constant(ty, -1);
    let count = match cc {
      IntCC::Slt | IntCC::Ult if step > 0 => {
        self.count_up(start, limit, step, cc == IntCC::Slt)
      }
      IntCC::Sle | IntCC::Ule if step > 0 => {
        let limit = self.add(&[limit, one]);
        self.count_up(start, limit, step, cc == IntCC::Sle)
      }
      IntCC::Sgt | IntCC::Ugt if step < 0 => {
        self.count_down(start, limit, -step, cc == IntCC::Sgt)
      }
      IntCC::Sge | IntCC::Uge if step < 0 => {
        let limit = self.add(&[limit, m_one]);
        self.count_down(start, limit, -step, cc == IntCC::Sge)
      }
      IntCC::Ne if step == 1 => self.minus(limit, start),
      IntCC::Ne if step == -1 => self.minus(start, limit),
      _ => return None,
    };
    Some(count)
  }

  // Iterations of `x < n` for `x = start, start + step, ...`:
  // (max(n, start) - start + step - 1) / step.
  fn count_up(&mut self, start: ScevIx, limit: ScevIx, step: i64, signed: bool) -> ScevIx {
    let hi = if signed { self.smax(&[limit, start]) } else { self.umax(&[limit, start]) };
    let dist = self.minus(hi, start);
    self.round_up_div(dist, step)
  }

  // Iterations of `x > n` for `x = start, start - step, ...`.
  fn count_down(&mut self, start: ScevIx, limit: ScevIx, step: i64, signed: bool) -> ScevIx {
    let hi = if signed { self.smax(&[start, limit]) } else { self.umax(&[start, limit]) };
    let dist = self.minus(hi, limit);
    self.round_up_div(dist, step)
  }

  fn round_up_div(&mut self, dist: ScevIx, step: i64) -> ScevIx {
    if step == 1 {
      return dist;
    }
    let ty = self.ty(dist);
    let bias = self.constant(ty, step - 1);
    let num = self.add(&[dist, bias]);
    let den = self.constant(ty, step);
    self.udiv(num, den)
  }

  //---------------------------------------------------------------------------
  // Printing

  pub fn display(&self, func: &Func, s: ScevIx) -> String {
    let list = |ops: &[ScevIx], sep: &str| -> String {
      let parts: Vec<String> = ops.iter().map(|o| self.display(func, *o)).collect();
      parts.join(sep)
    };
    let ty = self.ty(s);
    match &self.exprs[s].kind {
      ScevKind::Constant(_) => format!("{}", self.as_signed_constant(s).unwrap_or(0)),
      ScevKind::Truncate(x) => format!("(trunc {} to {})", self.display(func, *x), ty),
      ScevKind::ZeroExtend(x) => format!("(zext {} to {})", self.display(func, *x), ty),
      ScevKind::SignExtend(x) => format!("(sext {} to {})", self.display(func, *x), ty),
      ScevKind::Add(ops) => format!("({})", list(ops, " + ")),
      ScevKind::Mul(ops) => format!("({})", list(ops, " * ")),
      ScevKind::UDiv(a, b) => {
        format!("({} /u {})", self.display(func, *a), self.display(func, *b))
      }
      ScevKind::AddRec(ops, l) => format!("{{{}}}<{:?}>", list(ops, ",+,"), l),
      ScevKind::UMax(ops) => format!("umax({})", list(ops, ", ")),
      ScevKind::SMax(ops) => format!("smax({})", list(ops, ", ")),
      ScevKind::Unknown(v) => func.display_value(*v),
      ScevKind::CouldNotCompute => "***COULDNOTCOMPUTE***".to_string(),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::cfg::{CFGInfo, DomTree};
  use crate::ir::*;
  use crate::test_utils::counted_loop;

  fn analyses(f: &Func) -> (DomTree, LoopInfo) {
    let cfg = CFGInfo::create(f).unwrap();
    let dt = DomTree::create(f, &cfg);
    let li = LoopInfo::create(f, &cfg, &dt);
    (dt, li)
  }

  #[test]
  fn expressions_are_hash_consed() {
    let mut se = ScalarEvolution::new();
    let a = se.constant(Type::I64, 3);
    let b = se.constant(Type::I64, 4);
    let s1 = se.add(&[a, b]);
    let s2 = se.constant(Type::I64, 7);
    assert_eq!(s1, s2);
    let m = se.mul(&[b, a]);
    assert_eq!(se.as_constant(m), Some(12));
  }

  #[test]
  fn induction_variable_and_access_function() {
    let (f, i, p) = counted_loop(IntCC::Slt, 0, 1);
    let (_, li) = analyses(&f);
    let mut se = ScalarEvolution::new();
    let si = se.get_scev(&f, &li, i);
    assert!(se.is_affine_add_rec(si));
    assert_eq!(se.display(&f, si), "{0,+,1}<L0>");
    let sp = se.get_scev(&f, &li, p);
    assert_eq!(se.display(&f, sp), "(%A + {0,+,4}<L0>)");
    let base = se.get_pointer_base(sp);
    assert_eq!(se.as_unknown(base), Some(f.params[0]));
    assert!(se.is_known_non_negative(si));
  }

  #[test]
  fn trip_counts() {
    let (f, _, _) = counted_loop(IntCC::Slt, 0, 1);
    let (dt, li) = analyses(&f);
    let mut se = ScalarEvolution::new();
    let be = se.backedge_taken_count(&f, &li, &dt, LoopIx::new(0)).unwrap();
    assert_eq!(se.display(&f, be), "smax(0, %n)");

    let (f, _, _) = counted_loop(IntCC::Slt, 0, 3);
    let (dt, li) = analyses(&f);
    let mut se = ScalarEvolution::new();
    let be = se.backedge_taken_count(&f, &li, &dt, LoopIx::new(0)).unwrap();
    assert_eq!(se.display(&f, be), "((2 + smax(0, %n)) /u 3)");

    let (f, _, _) = counted_loop(IntCC::Eq, 0, 1);
    let (dt, li) = analyses(&f);
    let mut se = ScalarEvolution::new();
    assert!(se.backedge_taken_count(&f, &li, &dt, LoopIx::new(0)).is_none());
  }

  #[test]
  fn quadratic_recurrence() {
    // j += i; i += 1
    let mut f = Func::new("quad", Type::Void);
    let n = f.add_param("n", Type::I64);
    let entry = f.create_block("entry");
    let head = f.create_block("head");
    let exit = f.create_block("exit");
    let zero = f.iconst(Type::I64, 0);
    let one = f.iconst(Type::I64, 1);
    f.append_inst(entry, i_jump(head), Type::Void, "");
    let i = f.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "i");
    let j = f.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "j");
    let i_next = f.ins(head, i_add(i, one), Type::I64, "i.next");
    let j_next = f.ins(head, i_add(j, i), Type::I64, "j.next");
    let cmp = f.ins(head, i_icmp(IntCC::Slt, i_next, n), Type::I1, "cmp");
    f.append_inst(head, i_br(cmp, head, exit), Type::Void, "");
    f.append_inst(exit, i_ret(None), Type::Void, "");
    for (phi, next) in &[(i, i_next), (j, j_next)] {
      let pi = f.def_inst(*phi).unwrap();
      if let InstKind::Phi { incoming } = &mut f.insts[pi].kind {
        incoming.push((head, *next));
      }
    }
    let (_, li) = analyses(&f);
    let mut se = ScalarEvolution::new();
    let sj = se.get_scev(&f, &li, j);
    assert_eq!(se.display(&f, sj), "{0,+,0,+,1}<L0>");
    assert!(!se.is_affine_add_rec(sj));
  }
}
