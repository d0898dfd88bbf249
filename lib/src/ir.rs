/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A small SSA IR.  Functions own arenas of values, instructions and blocks,
//! plus a layout order for the blocks.  Every analysis and transformation in
//! the crate works on this representation.

use smallvec::{smallvec, SmallVec};
use std::fmt;

use crate::data_structures::{
  BlockIx, InstIx, Map, ScopeIx, TypedIxVec, ValueIx,
};

//=============================================================================
// Types and integer arithmetic helpers

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
  Void,
  /// An integer of the given bit width.
  Int(u8),
  /// A pointer.  The payload is the byte size of the pointee, if known.
  Ptr(Option<u32>),
}

impl Type {
  pub const I1: Type = Type::Int(1);
  pub const I8: Type = Type::Int(8);
  pub const I16: Type = Type::Int(16);
  pub const I32: Type = Type::Int(32);
  pub const I64: Type = Type::Int(64);

  pub fn is_int(self) -> bool {
    matches!(self, Type::Int(_))
  }
  pub fn is_ptr(self) -> bool {
    matches!(self, Type::Ptr(_))
  }
  pub fn bits(self) -> u8 {
    match self {
      Type::Void => 0,
      Type::Int(bits) => bits,
      Type::Ptr(_) => 64,
    }
  }
  /// Number of bytes a load or store of this type touches.
  pub fn store_size(self) -> u32 {
    match self {
      Type::Void => 0,
      Type::Int(bits) => (bits as u32 + 7) / 8,
      Type::Ptr(_) => 8,
    }
  }
  pub fn elem_size(self) -> Option<u32> {
    match self {
      Type::Ptr(elem) => elem,
      _ => None,
    }
  }
  /// Pointers are plain 64-bit addresses once they take part in arithmetic.
  pub fn effective(self) -> Type {
    match self {
      Type::Ptr(_) => Type::I64,
      other => other,
    }
  }
}

impl fmt::Display for Type {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Type::Void => write!(fmt, "void"),
      Type::Int(bits) => write!(fmt, "i{}", bits),
      Type::Ptr(Some(size)) => write!(fmt, "ptr<{}>", size),
      Type::Ptr(None) => write!(fmt, "ptr"),
    }
  }
}

pub fn mask(bits: u8) -> u64 {
  if bits >= 64 {
    !0
  } else {
    (1u64 << bits) - 1
  }
}

/// Canonical form of an integer of width `bits`: sign-extended to 64 bits,
/// except for `i1` which is kept as 0 or 1.
pub fn normalize(v: i64, bits: u8) -> i64 {
  if bits == 1 {
    v & 1
  } else if bits >= 64 || bits == 0 {
    v
  } else {
    let sh = 64 - bits as u32;
    (v << sh) >> sh
  }
}

pub fn to_signed(v: i64, bits: u8) -> i64 {
  if bits == 1 {
    -(v & 1)
  } else {
    normalize(v, bits)
  }
}

pub fn as_unsigned(v: i64, bits: u8) -> u64 {
  (v as u64) & mask(bits)
}

pub fn signed_max(bits: u8) -> i64 {
  if bits >= 64 {
    i64::MAX
  } else {
    (1i64 << (bits - 1)) - 1
  }
}

pub fn signed_min(bits: u8) -> i64 {
  if bits >= 64 {
    i64::MIN
  } else {
    -(1i64 << (bits - 1))
  }
}

//=============================================================================
// Operators

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  UDiv,
  SDiv,
  URem,
  SRem,
  Shl,
  LShr,
  AShr,
  And,
  Or,
  Xor,
}

impl BinOp {
  pub fn name(self) -> &'static str {
    match self {
      BinOp::Add => "add",
      BinOp::Sub => "sub",
      BinOp::Mul => "mul",
      BinOp::UDiv => "udiv",
      BinOp::SDiv => "sdiv",
      BinOp::URem => "urem",
      BinOp::SRem => "srem",
      BinOp::Shl => "shl",
      BinOp::LShr => "lshr",
      BinOp::AShr => "ashr",
      BinOp::And => "and",
      BinOp::Or => "or",
      BinOp::Xor => "xor",
    }
  }

  pub fn from_name(name: &str) -> Option<BinOp> {
    Some(match name {
      "add" => BinOp::Add,
      "sub" => BinOp::Sub,
      "mul" => BinOp::Mul,
      "udiv" => BinOp::UDiv,
      "sdiv" => BinOp::SDiv,
      "urem" => BinOp::URem,
      "srem" => BinOp::SRem,
      "shl" => BinOp::Shl,
      "lshr" => BinOp::LShr,
      "ashr" => BinOp::AShr,
      "and" => BinOp::And,
      "or" => BinOp::Or,
      "xor" => BinOp::Xor,
      _ => return None,
    })
  }

  /// Division and remainder trap on a zero divisor.
  pub fn may_trap(self) -> bool {
    matches!(self, BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem)
  }

  /// Evaluates the operator on two canonical values of width `bits`.  Returns
  /// `None` on division by zero.
  pub fn calc(self, a: i64, b: i64, bits: u8) -> Option<i64> {
    let ua = as_unsigned(a, bits);
    let ub = as_unsigned(b, bits);
    let sa = to_signed(a, bits);
    let sb = to_signed(b, bits);
    let sh = (ub % (bits.max(1) as u64)) as u32;
    let res = match self {
      BinOp::Add => a.wrapping_add(b),
      BinOp::Sub => a.wrapping_sub(b),
      BinOp::Mul => a.wrapping_mul(b),
      BinOp::UDiv => {
        if ub == 0 {
          return None;
        }
        (ua / ub) as i64
      }
      BinOp::SDiv => {
        if sb == 0 {
          return None;
        }
        sa.wrapping_div(sb)
      }
      BinOp::URem => {
        if ub == 0 {
          return None;
        }
        (ua % ub) as i64
      }
      BinOp::SRem => {
        if sb == 0 {
          return None;
        }
        sa.wrapping_rem(sb)
      }
      BinOp::Shl => a.wrapping_shl(sh),
      BinOp::LShr => (ua >> sh) as i64,
      BinOp::AShr => sa >> sh,
      BinOp::And => a & b,
      BinOp::Or => a | b,
      BinOp::Xor => a ^ b,
    };
    Some(normalize(res, bits))
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntCC {
  Eq,
  Ne,
  Slt,
  Sle,
  Sgt,
  Sge,
  Ult,
  Ule,
  Ugt,
  Uge,
}

impl IntCC {
  pub fn name(self) -> &'static str {
    match self {
      IntCC::Eq => "eq",
      IntCC::Ne => "ne",
      IntCC::Slt => "slt",
      IntCC::Sle => "sle",
      IntCC::Sgt => "sgt",
      IntCC::Sge => "sge",
      IntCC::Ult => "ult",
      IntCC::Ule => "ule",
      IntCC::Ugt => "ugt",
      IntCC::Uge => "uge",
    }
  }

  pub fn from_name(name: &str) -> Option<IntCC> {
    Some(match name {
      "eq" => IntCC::Eq,
      "ne" => IntCC::Ne,
      "slt" => IntCC::Slt,
      "sle" => IntCC::Sle,
      "sgt" => IntCC::Sgt,
      "sge" => IntCC::Sge,
      "ult" => IntCC::Ult,
      "ule" => IntCC::Ule,
      "ugt" => IntCC::Ugt,
      "uge" => IntCC::Uge,
      _ => return None,
    })
  }

  /// The condition that holds exactly when `self` does not.
  pub fn inverse(self) -> IntCC {
    match self {
      IntCC::Eq => IntCC::Ne,
      IntCC::Ne => IntCC::Eq,
      IntCC::Slt => IntCC::Sge,
      IntCC::Sle => IntCC::Sgt,
      IntCC::Sgt => IntCC::Sle,
      IntCC::Sge => IntCC::Slt,
      IntCC::Ult => IntCC::Uge,
      IntCC::Ule => IntCC::Ugt,
      IntCC::Ugt => IntCC::Ule,
      IntCC::Uge => IntCC::Ult,
    }
  }

  /// The condition to use when the two operands trade places.
  pub fn swap_args(self) -> IntCC {
    match self {
      IntCC::Eq => IntCC::Eq,
      IntCC::Ne => IntCC::Ne,
      IntCC::Slt => IntCC::Sgt,
      IntCC::Sle => IntCC::Sge,
      IntCC::Sgt => IntCC::Slt,
      IntCC::Sge => IntCC::Sle,
      IntCC::Ult => IntCC::Ugt,
      IntCC::Ule => IntCC::Uge,
      IntCC::Ugt => IntCC::Ult,
      IntCC::Uge => IntCC::Ule,
    }
  }

  pub fn calc(self, a: i64, b: i64, bits: u8) -> bool {
    let (sa, sb) = (to_signed(a, bits), to_signed(b, bits));
    let (ua, ub) = (as_unsigned(a, bits), as_unsigned(b, bits));
    match self {
      IntCC::Eq => ua == ub,
      IntCC::Ne => ua != ub,
      IntCC::Slt => sa < sb,
      IntCC::Sle => sa <= sb,
      IntCC::Sgt => sa > sb,
      IntCC::Sge => sa >= sb,
      IntCC::Ult => ua < ub,
      IntCC::Ule => ua <= ub,
      IntCC::Ugt => ua > ub,
      IntCC::Uge => ua >= ub,
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CastOp {
  Trunc,
  ZExt,
  SExt,
  PtrToInt,
  IntToPtr,
  Bitcast,
}

impl CastOp {
  pub fn name(self) -> &'static str {
    match self {
      CastOp::Trunc => "trunc",
      CastOp::ZExt => "zext",
      CastOp::SExt => "sext",
      CastOp::PtrToInt => "ptrtoint",
      CastOp::IntToPtr => "inttoptr",
      CastOp::Bitcast => "bitcast",
    }
  }

  pub fn from_name(name: &str) -> Option<CastOp> {
    Some(match name {
      "trunc" => CastOp::Trunc,
      "zext" => CastOp::ZExt,
      "sext" => CastOp::SExt,
      "ptrtoint" => CastOp::PtrToInt,
      "inttoptr" => CastOp::IntToPtr,
      "bitcast" => CastOp::Bitcast,
      _ => return None,
    })
  }

  pub fn apply(self, v: i64, from: Type, to: Type) -> i64 {
    match self {
      CastOp::ZExt => normalize(as_unsigned(v, from.bits()) as i64, to.bits()),
      CastOp::SExt => normalize(to_signed(v, from.bits()), to.bits()),
      CastOp::Trunc
      | CastOp::PtrToInt
      | CastOp::IntToPtr
      | CastOp::Bitcast => normalize(v, to.bits()),
    }
  }
}

//=============================================================================
// Instructions

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct CallAttrs {
  /// The callee neither reads nor writes memory visible to the caller.
  pub read_none: bool,
  /// The callee never returns.
  pub no_return: bool,
}

#[derive(Clone, Debug)]
pub enum InstKind {
  Binary { op: BinOp, args: [ValueIx; 2] },
  Icmp { cc: IntCC, args: [ValueIx; 2] },
  Select { args: [ValueIx; 3] },
  /// The destination type is the result type of the instruction.
  Cast { op: CastOp, arg: ValueIx },
  /// `base + index * elem_size(base)`.
  Gep { base: ValueIx, index: ValueIx },
  Load { ptr: ValueIx },
  Store { ptr: ValueIx, value: ValueIx },
  /// `count` elements of the result pointer's element type.
  Alloca { count: u32 },
  Call { callee: String, args: Vec<ValueIx>, attrs: CallAttrs },
  Phi { incoming: Vec<(BlockIx, ValueIx)> },
  Jump { dest: BlockIx },
  Branch { cond: ValueIx, dests: [BlockIx; 2] },
  Return { value: Option<ValueIx> },
}

impl InstKind {
  pub fn is_terminator(&self) -> bool {
    matches!(
      self,
      InstKind::Jump { .. } | InstKind::Branch { .. } | InstKind::Return { .. }
    )
  }

  pub fn is_phi(&self) -> bool {
    matches!(self, InstKind::Phi { .. })
  }

  pub fn is_memory_access(&self) -> bool {
    matches!(self, InstKind::Load { .. } | InstKind::Store { .. })
  }

  pub fn may_read_memory(&self) -> bool {
    match self {
      InstKind::Load { .. } => true,
      InstKind::Call { attrs, .. } => !attrs.read_none,
      _ => false,
    }
  }

  pub fn may_write_memory(&self) -> bool {
    match self {
      InstKind::Store { .. } => true,
      InstKind::Call { attrs, .. } => !attrs.read_none,
      _ => false,
    }
  }

  /// Anything that must not be executed speculatively or removed.
  pub fn may_have_side_effects(&self) -> bool {
    match self {
      InstKind::Store { .. } => true,
      InstKind::Call { attrs, .. } => !attrs.read_none || attrs.no_return,
      _ => false,
    }
  }

  pub fn successors(&self) -> SmallVec<[BlockIx; 2]> {
    match self {
      InstKind::Jump { dest } => smallvec![*dest],
      InstKind::Branch { dests, .. } => {
        if dests[0] == dests[1] {
          smallvec![dests[0]]
        } else {
          smallvec![dests[0], dests[1]]
        }
      }
      _ => SmallVec::new(),
    }
  }

  pub fn operands(&self) -> SmallVec<[ValueIx; 4]> {
    match self {
      InstKind::Binary { args, .. } | InstKind::Icmp { args, .. } => {
        smallvec![args[0], args[1]]
      }
      InstKind::Select { args } => smallvec![args[0], args[1], args[2]],
      InstKind::Cast { arg, .. } => smallvec![*arg],
      InstKind::Gep { base, index } => smallvec![*base, *index],
      InstKind::Load { ptr } => smallvec![*ptr],
      InstKind::Store { ptr, value } => smallvec![*value, *ptr],
      InstKind::Alloca { .. } => SmallVec::new(),
      InstKind::Call { args, .. } => args.iter().cloned().collect(),
      InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
      InstKind::Jump { .. } => SmallVec::new(),
      InstKind::Branch { cond, .. } => smallvec![*cond],
      InstKind::Return { value } => value.iter().cloned().collect(),
    }
  }

  /// Applies `f` to every value operand in place.
  pub fn map_operands<F: FnMut(ValueIx) -> ValueIx>(&mut self, mut f: F) {
    match self {
      InstKind::Binary { args, .. } | InstKind::Icmp { args, .. } => {
        args[0] = f(args[0]);
        args[1] = f(args[1]);
      }
      InstKind::Select { args } => {
        for a in args.iter_mut() {
          *a = f(*a);
        }
      }
      InstKind::Cast { arg, .. } => *arg = f(*arg),
      InstKind::Gep { base, index } => {
        *base = f(*base);
        *index = f(*index);
      }
      InstKind::Load { ptr } => *ptr = f(*ptr),
      InstKind::Store { ptr, value } => {
        *value = f(*value);
        *ptr = f(*ptr);
      }
      InstKind::Alloca { .. } | InstKind::Jump { .. } => {}
      InstKind::Call { args, .. } => {
        for a in args.iter_mut() {
          *a = f(*a);
        }
      }
      InstKind::Phi { incoming } => {
        for (_, v) in incoming.iter_mut() {
          *v = f(*v);
        }
      }
      InstKind::Branch { cond, .. } => *cond = f(*cond),
      InstKind::Return { value } => {
        if let Some(v) = value {
          *v = f(*v);
        }
      }
    }
  }

  /// Applies `f` to every block reference: branch targets and phi incoming
  /// blocks.
  pub fn map_blocks<F: FnMut(BlockIx) -> BlockIx>(&mut self, mut f: F) {
    match self {
      InstKind::Jump { dest } => *dest = f(*dest),
      InstKind::Branch { dests, .. } => {
        dests[0] = f(dests[0]);
        dests[1] = f(dests[1]);
      }
      InstKind::Phi { incoming } => {
        for (b, _) in incoming.iter_mut() {
          *b = f(*b);
        }
      }
      _ => {}
    }
  }

  /// The pointer operand of a load or store.
  pub fn pointer_operand(&self) -> Option<ValueIx> {
    match self {
      InstKind::Load { ptr } | InstKind::Store { ptr, .. } => Some(*ptr),
      _ => None,
    }
  }
}

#[derive(Clone, Debug)]
pub struct InstData {
  pub kind: InstKind,
  pub result: Option<ValueIx>,
  /// `None` once the instruction has been removed from its block.
  pub block: Option<BlockIx>,
  pub alias_scopes: SmallVec<[ScopeIx; 2]>,
  pub noalias: SmallVec<[ScopeIx; 4]>,
}

//=============================================================================
// Values, blocks, scopes

#[derive(Clone, Debug, PartialEq)]
pub enum ValueDef {
  Param(u32),
  Const(i64),
  Global(String),
  Inst(InstIx),
  Undef,
}

#[derive(Clone, Debug)]
pub struct ValueData {
  pub def: ValueDef,
  pub ty: Type,
  pub name: String,
  /// Parameter attribute: no other pointer reachable by the callee aliases
  /// this one.
  pub noalias: bool,
}

#[derive(Clone, Debug)]
pub struct BlockData {
  pub name: String,
  pub insts: Vec<InstIx>,
}

#[derive(Clone, Debug)]
pub struct AliasScope {
  pub name: String,
  pub domain: String,
}

//=============================================================================
// Functions

#[derive(Clone, Debug)]
pub struct Func {
  pub name: String,
  pub ret_ty: Type,
  pub params: Vec<ValueIx>,
  pub values: TypedIxVec<ValueIx, ValueData>,
  pub insts: TypedIxVec<InstIx, InstData>,
  pub blocks: TypedIxVec<BlockIx, BlockData>,
  /// Blocks in program order.  The first one is the entry.
  pub layout: Vec<BlockIx>,
  pub scopes: TypedIxVec<ScopeIx, AliasScope>,
  /// Declarations have no blocks.
  pub is_declaration: bool,
  consts: Map<(Type, i64), ValueIx>,
  globals: Map<String, ValueIx>,
  undefs: Map<Type, ValueIx>,
  value_names: Map<String, ValueIx>,
  block_names: Map<String, BlockIx>,
}

impl Func {
  pub fn new(name: &str, ret_ty: Type) -> Self {
    Self {
      name: name.to_string(),
      ret_ty,
      params: vec![],
      values: TypedIxVec::new(),
      insts: TypedIxVec::new(),
      blocks: TypedIxVec::new(),
      layout: vec![],
      scopes: TypedIxVec::new(),
      is_declaration: false,
      consts: Map::default(),
      globals: Map::default(),
      undefs: Map::default(),
      value_names: Map::default(),
      block_names: Map::default(),
    }
  }

  pub fn new_declaration(name: &str, ret_ty: Type, params: &[Type]) -> Self {
    let mut func = Self::new(name, ret_ty);
    for (i, ty) in params.iter().enumerate() {
      func.add_param(&format!("a{}", i), *ty);
    }
    func.is_declaration = true;
    func
  }

  fn unique_value_name(&self, base: &str) -> String {
    let base = if base.is_empty() { "t" } else { base };
    if !self.value_names.contains_key(base) {
      return base.to_string();
    }
    let mut n = 1;
    loop {
      let cand = format!("{}.{}", base, n);
      if !self.value_names.contains_key(&cand) {
        return cand;
      }
      n += 1;
    }
  }

  fn new_value(&mut self, def: ValueDef, ty: Type, name: &str) -> ValueIx {
    let name = match def {
      ValueDef::Param(_) | ValueDef::Inst(_) => {
        let name = self.unique_value_name(name);
        name
      }
      _ => name.to_string(),
    };
    let v = self.values.push(ValueData { def: def.clone(), ty, name: name.clone(), noalias: false });
    if let ValueDef::Param(_) | ValueDef::Inst(_) = def {
      self.value_names.insert(name, v);
    }
    v
  }

  pub fn add_param(&mut self, name: &str, ty: Type) -> ValueIx {
    let v = self.new_value(ValueDef::Param(self.params.len() as u32), ty, name);
    self.params.push(v);
    v
  }

  pub fn set_noalias(&mut self, v: ValueIx) {
    self.values[v].noalias = true;
  }

  /// Interned integer constant.
  pub fn iconst(&mut self, ty: Type, value: i64) -> ValueIx {
    let value = normalize(value, ty.bits());
    if let Some(v) = self.consts.get(&(ty, value)) {
      return *v;
    }
    let v = self.new_value(ValueDef::Const(value), ty, "");
    self.consts.insert((ty, value), v);
    v
  }

  /// Interned reference to a module-level global.  `ty` is the pointer type
  /// of the global's address.
  pub fn global(&mut self, name: &str, ty: Type) -> ValueIx {
    if let Some(v) = self.globals.get(name) {
      return *v;
    }
    let v = self.new_value(ValueDef::Global(name.to_string()), ty, name);
    self.globals.insert(name.to_string(), v);
    v
  }

  pub fn undef(&mut self, ty: Type) -> ValueIx {
    if let Some(v) = self.undefs.get(&ty) {
      return *v;
    }
    let v = self.new_value(ValueDef::Undef, ty, "undef");
    self.undefs.insert(ty, v);
    v
  }

  pub fn value_ty(&self, v: ValueIx) -> Type {
    self.values[v].ty
  }

  pub fn value_name(&self, v: ValueIx) -> &str {
    &self.values[v].name
  }

  pub fn value_by_name(&self, name: &str) -> Option<ValueIx> {
    self.value_names.get(name).cloned()
  }

  pub fn def_inst(&self, v: ValueIx) -> Option<InstIx> {
    match self.values[v].def {
      ValueDef::Inst(i) => Some(i),
      _ => None,
    }
  }

  pub fn const_value(&self, v: ValueIx) -> Option<i64> {
    match self.values[v].def {
      ValueDef::Const(c) => Some(c),
      _ => None,
    }
  }

  pub fn is_undef(&self, v: ValueIx) -> bool {
    self.values[v].def == ValueDef::Undef
  }

  //---------------------------------------------------------------------------
  // Blocks

  fn unique_block_name(&self, base: &str) -> String {
    if !self.block_names.contains_key(base) {
      return base.to_string();
    }
    let mut n = 1;
    loop {
      let cand = format!("{}.{}", base, n);
      if !self.block_names.contains_key(&cand) {
        return cand;
      }
      n += 1;
    }
  }

  fn new_block(&mut self, name: &str) -> BlockIx {
    let name = self.unique_block_name(name);
    let b = self.blocks.push(BlockData { name: name.clone(), insts: vec![] });
    self.block_names.insert(name, b);
    b
  }

  /// Creates a block at the end of the layout.
  pub fn create_block(&mut self, name: &str) -> BlockIx {
    let b = self.new_block(name);
    self.layout.push(b);
    b
  }

  pub fn create_block_before(&mut self, name: &str, before: BlockIx) -> BlockIx {
    let b = self.new_block(name);
    let pos = self.layout_pos(before);
    self.layout.insert(pos, b);
    b
  }

  pub fn create_block_after(&mut self, name: &str, after: BlockIx) -> BlockIx {
    let b = self.new_block(name);
    let pos = self.layout_pos(after);
    self.layout.insert(pos + 1, b);
    b
  }

  fn layout_pos(&self, b: BlockIx) -> usize {
    match self.layout.iter().position(|x| *x == b) {
      Some(pos) => pos,
      None => panic!("Func::layout_pos: {:?} is not in the layout", b),
    }
  }

  pub fn block_by_name(&self, name: &str) -> Option<BlockIx> {
    self.block_names.get(name).cloned()
  }

  pub fn block_name(&self, b: BlockIx) -> &str {
    &self.blocks[b].name
  }

  pub fn entry_block(&self) -> Option<BlockIx> {
    self.layout.first().cloned()
  }

  pub fn block_insts(&self, b: BlockIx) -> &[InstIx] {
    &self.blocks[b].insts
  }

  pub fn terminator(&self, b: BlockIx) -> Option<InstIx> {
    match self.blocks[b].insts.last() {
      Some(i) if self.insts[*i].kind.is_terminator() => Some(*i),
      _ => None,
    }
  }

  /// First instruction that is not a phi.  Well-formed blocks always have
  /// one, the terminator at worst.
  pub fn first_non_phi(&self, b: BlockIx) -> Option<InstIx> {
    self.blocks[b].insts.iter().cloned().find(|i| !self.insts[*i].kind.is_phi())
  }

  pub fn phis(&self, b: BlockIx) -> Vec<InstIx> {
    self.blocks[b]
      .insts
      .iter()
      .cloned()
      .take_while(|i| self.insts[*i].kind.is_phi())
      .collect()
  }

  pub fn succs(&self, b: BlockIx) -> SmallVec<[BlockIx; 2]> {
    match self.terminator(b) {
      Some(t) => self.insts[t].kind.successors(),
      None => SmallVec::new(),
    }
  }

  /// Predecessors in layout order, without duplicates.
  pub fn preds(&self, b: BlockIx) -> Vec<BlockIx> {
    self.layout.iter().cloned().filter(|p| self.succs(*p).contains(&b)).collect()
  }

  pub fn return_blocks(&self) -> Vec<BlockIx> {
    self
      .layout
      .iter()
      .cloned()
      .filter(|b| match self.terminator(*b) {
        Some(t) => matches!(self.insts[t].kind, InstKind::Return { .. }),
        None => false,
      })
      .collect()
  }

  //---------------------------------------------------------------------------
  // Instructions

  fn new_inst(&mut self, kind: InstKind, ty: Type, name: &str) -> InstIx {
    let i = self.insts.push(InstData {
      kind,
      result: None,
      block: None,
      alias_scopes: SmallVec::new(),
      noalias: SmallVec::new(),
    });
    if ty != Type::Void {
      let v = self.new_value(ValueDef::Inst(i), ty, name);
      self.insts[i].result = Some(v);
    }
    i
  }

  pub fn append_inst(
    &mut self, b: BlockIx, kind: InstKind, ty: Type, name: &str,
  ) -> InstIx {
    let i = self.new_inst(kind, ty, name);
    self.insts[i].block = Some(b);
    self.blocks[b].insts.push(i);
    i
  }

  pub fn insert_inst_before(
    &mut self, before: InstIx, kind: InstKind, ty: Type, name: &str,
  ) -> InstIx {
    let b = match self.insts[before].block {
      Some(b) => b,
      None => panic!("Func::insert_inst_before: {:?} is detached", before),
    };
    let i = self.new_inst(kind, ty, name);
    self.insts[i].block = Some(b);
    let pos = self.inst_pos(before);
    self.blocks[b].insts.insert(pos, i);
    i
  }

  pub fn insert_inst_at_start(
    &mut self, b: BlockIx, kind: InstKind, ty: Type, name: &str,
  ) -> InstIx {
    let i = self.new_inst(kind, ty, name);
    self.insts[i].block = Some(b);
    self.blocks[b].insts.insert(0, i);
    i
  }

  /// Appends an instruction that produces a value and returns that value.
  pub fn ins(
    &mut self, b: BlockIx, kind: InstKind, ty: Type, name: &str,
  ) -> ValueIx {
    let i = self.append_inst(b, kind, ty, name);
    self.inst_result(i)
  }

  /// Detaches an instruction from its block.  Its value must be unused.
  pub fn remove_inst(&mut self, i: InstIx) {
    if let Some(b) = self.insts[i].block.take() {
      self.blocks[b].insts.retain(|x| *x != i);
    }
  }

  /// Moves an attached instruction right before `before`, keeping its
  /// identity and result value.
  pub fn move_inst_before(&mut self, i: InstIx, before: InstIx) {
    self.remove_inst(i);
    let b = match self.insts[before].block {
      Some(b) => b,
      None => panic!("Func::move_inst_before: {:?} is detached", before),
    };
    let pos = self.inst_pos(before);
    self.blocks[b].insts.insert(pos, i);
    self.insts[i].block = Some(b);
  }

  /// Position of `i` inside its block.
  pub fn inst_pos(&self, i: InstIx) -> usize {
    let b = match self.insts[i].block {
      Some(b) => b,
      None => panic!("Func::inst_pos: {:?} is detached", i),
    };
    match self.blocks[b].insts.iter().position(|x| *x == i) {
      Some(pos) => pos,
      None => panic!("Func::inst_pos: {:?} not found in {:?}", i, b),
    }
  }

  pub fn inst_block(&self, i: InstIx) -> Option<BlockIx> {
    self.insts[i].block
  }

  pub fn inst_result(&self, i: InstIx) -> ValueIx {
    match self.insts[i].result {
      Some(v) => v,
      None => panic!("Func::inst_result: {:?} produces no value", i),
    }
  }

  pub fn kind(&self, i: InstIx) -> &InstKind {
    &self.insts[i].kind
  }

  /// Every attached instruction reading `v`.
  pub fn users(&self, v: ValueIx) -> Vec<InstIx> {
    let mut res = vec![];
    for b in &self.layout {
      for i in &self.blocks[*b].insts {
        if self.insts[*i].kind.operands().contains(&v) {
          res.push(*i);
        }
      }
    }
    res
  }

  pub fn replace_uses_of_with(&mut self, i: InstIx, from: ValueIx, to: ValueIx) {
    self.insts[i].kind.map_operands(|v| if v == from { to } else { v });
  }

  /// In `b`'s phis, renames the incoming block `from` to `to`.
  pub fn rename_phi_incoming_block(
    &mut self, b: BlockIx, from: BlockIx, to: BlockIx,
  ) {
    for phi in self.phis(b) {
      if let InstKind::Phi { incoming } = &mut self.insts[phi].kind {
        for (ib, _) in incoming.iter_mut() {
          if *ib == from {
            *ib = to;
          }
        }
      }
    }
  }

  pub fn replace_successor(&mut self, b: BlockIx, from: BlockIx, to: BlockIx) {
    if let Some(t) = self.terminator(b) {
      self.insts[t].kind.map_blocks(|d| if d == from { to } else { d });
    }
  }

  /// Moves the instructions of `b` from `at` onwards into a new block placed
  /// right after `b` in the layout, and terminates `b` with a jump to it.
  /// Phis in the successors of the moved terminator are updated.  Analyses
  /// are not touched.
  pub fn split_block(&mut self, b: BlockIx, at: InstIx, name: &str) -> BlockIx {
    let pos = self.inst_pos(at);
    let new_b = self.create_block_after(name, b);
    let moved: Vec<InstIx> = self.blocks[b].insts.drain(pos..).collect();
    for i in &moved {
      self.insts[*i].block = Some(new_b);
    }
    self.blocks[new_b].insts = moved;
    for s in self.succs(new_b) {
      self.rename_phi_incoming_block(s, b, new_b);
    }
    self.append_inst(b, InstKind::Jump { dest: new_b }, Type::Void, "");
    new_b
  }

  /// Places a new block on the edge `src -> dst`, right after `src` in the
  /// layout.
  pub fn split_edge(&mut self, src: BlockIx, dst: BlockIx) -> BlockIx {
    let name = format!("{}.{}.split", self.block_name(src), self.block_name(dst));
    let new_b = self.create_block_after(&name, src);
    self.append_inst(new_b, InstKind::Jump { dest: dst }, Type::Void, "");
    self.replace_successor(src, dst, new_b);
    self.rename_phi_incoming_block(dst, src, new_b);
    new_b
  }

  /// Routes the edges from `preds` into `b` through a new block placed
  /// right before `b`.  Phi inputs coming from `preds` are merged in the new
  /// block.
  pub fn split_block_predecessors(
    &mut self, b: BlockIx, preds: &[BlockIx], suffix: &str,
  ) -> BlockIx {
    let name = format!("{}{}", self.block_name(b), suffix);
    let new_b = self.create_block_before(&name, b);
    for phi in self.phis(b) {
      let (moved, kept): (Vec<_>, Vec<_>) = match &self.insts[phi].kind {
        InstKind::Phi { incoming } => {
          incoming.iter().cloned().partition(|(ib, _)| preds.contains(ib))
        }
        _ => continue,
      };
      if moved.is_empty() {
        continue;
      }
      let ty = self.value_ty(self.inst_result(phi));
      let v0 = moved[0].1;
      let merged = if moved.iter().all(|(_, v)| *v == v0) {
        v0
      } else {
        let name = self.value_name(self.inst_result(phi)).to_string();
        self.ins(new_b, InstKind::Phi { incoming: moved }, ty, &name)
      };
      let mut incoming = kept;
      incoming.push((new_b, merged));
      self.insts[phi].kind = InstKind::Phi { incoming };
    }
    for p in preds {
      self.replace_successor(*p, b, new_b);
    }
    self.append_inst(new_b, InstKind::Jump { dest: b }, Type::Void, "");
    new_b
  }

  //---------------------------------------------------------------------------
  // Alias scopes

  pub fn create_alias_scope(&mut self, domain: &str, name: &str) -> ScopeIx {
    self.scopes.push(AliasScope { name: name.to_string(), domain: domain.to_string() })
  }

  //---------------------------------------------------------------------------
  // Printing

  pub fn print(&self, who: &str) {
    println!("");
    println!("Func {}: name='{}' entry='{:?}' {{", who, self.name, self.entry_block());
    print!("{}", self);
    println!("}}");
  }

  pub fn display_value(&self, v: ValueIx) -> String {
    let data = &self.values[v];
    match &data.def {
      ValueDef::Const(c) => format!("{}", c),
      ValueDef::Global(name) => format!("@{}", name),
      ValueDef::Undef => "undef".to_string(),
      ValueDef::Param(_) | ValueDef::Inst(_) => format!("%{}", data.name),
    }
  }

  pub fn display_inst(&self, i: InstIx) -> String {
    let data = &self.insts[i];
    let v = |x: &ValueIx| self.display_value(*x);
    let b = |x: &BlockIx| self.blocks[*x].name.clone();
    let res_ty = data.result.map(|r| self.value_ty(r)).unwrap_or(Type::Void);
    let mut s = match data.result {
      Some(r) => format!("{} = ", self.display_value(r)),
      None => String::new(),
    };
    s += &match &data.kind {
      InstKind::Binary { op, args } => {
        format!("{} {} {}, {}", op.name(), res_ty, v(&args[0]), v(&args[1]))
      }
      InstKind::Icmp { cc, args } => format!(
        "icmp {} {} {}, {}",
        cc.name(),
        self.value_ty(args[0]),
        v(&args[0]),
        v(&args[1])
      ),
      InstKind::Select { args } => format!(
        "select {} {}, {}, {}",
        res_ty,
        v(&args[0]),
        v(&args[1]),
        v(&args[2])
      ),
      InstKind::Cast { op, arg } => format!(
        "{} {} {} to {}",
        op.name(),
        self.value_ty(*arg),
        v(arg),
        res_ty
      ),
      InstKind::Gep { base, index } => format!(
        "gep {}, {} {}",
        v(base),
        self.value_ty(*index),
        v(index)
      ),
      InstKind::Load { ptr } => format!("load {} {}", res_ty, v(ptr)),
      InstKind::Store { ptr, value } => {
        format!("store {} {}, {}", self.value_ty(*value), v(value), v(ptr))
      }
      InstKind::Alloca { count } => {
        format!("alloca {} x {}", elem_type_name(res_ty), count)
      }
      InstKind::Call { callee, args, attrs } => {
        let args: Vec<String> = args
          .iter()
          .map(|a| format!("{} {}", self.value_ty(*a), v(a)))
          .collect();
        let mut s = format!("call {} @{}({})", res_ty, callee, args.join(", "));
        if attrs.read_none {
          s += " readnone";
        }
        if attrs.no_return {
          s += " noreturn";
        }
        s
      }
      InstKind::Phi { incoming } => {
        let inc: Vec<String> = incoming
          .iter()
          .map(|(ib, iv)| format!("[{}, {}]", v(iv), b(ib)))
          .collect();
        format!("phi {} {}", res_ty, inc.join(", "))
      }
      InstKind::Jump { dest } => format!("jump {}", b(dest)),
      InstKind::Branch { cond, dests } => {
        format!("br {}, {}, {}", v(cond), b(&dests[0]), b(&dests[1]))
      }
      InstKind::Return { value: Some(r) } => {
        format!("ret {} {}", self.value_ty(*r), v(r))
      }
      InstKind::Return { value: None } => "ret".to_string(),
    };
    if !data.alias_scopes.is_empty() {
      let l: Vec<String> =
        data.alias_scopes.iter().map(|s| s.get().to_string()).collect();
      s += &format!(" !alias.scope({})", l.join(", "));
    }
    if !data.noalias.is_empty() {
      let l: Vec<String> =
        data.noalias.iter().map(|s| s.get().to_string()).collect();
      s += &format!(" !noalias({})", l.join(", "));
    }
    s
  }
}

fn elem_type_name(ptr_ty: Type) -> String {
  match ptr_ty.elem_size() {
    Some(8) => "i64".to_string(),
    Some(4) => "i32".to_string(),
    Some(2) => "i16".to_string(),
    Some(1) => "i8".to_string(),
    Some(n) => format!("[{}]", n),
    None => "?".to_string(),
  }
}

impl fmt::Display for Func {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let params: Vec<String> = self
      .params
      .iter()
      .map(|p| {
        let noalias = if self.values[*p].noalias { " noalias" } else { "" };
        format!("%{}: {}{}", self.values[*p].name, self.value_ty(*p), noalias)
      })
      .collect();
    if self.is_declaration {
      return writeln!(
        fmt,
        "declare @{}({}) -> {}",
        self.name,
        params.join(", "),
        self.ret_ty
      );
    }
    writeln!(fmt, "func @{}({}) -> {} {{", self.name, params.join(", "), self.ret_ty)?;
    for (n, scope) in self.scopes.iter().enumerate() {
      writeln!(fmt, "  ; scope {}: {} ({})", n, scope.name, scope.domain)?;
    }
    for b in &self.layout {
      writeln!(fmt, "{}:", self.blocks[*b].name)?;
      for i in &self.blocks[*b].insts {
        writeln!(fmt, "  {}", self.display_inst(*i))?;
      }
    }
    writeln!(fmt, "}}")
  }
}

//=============================================================================
// Modules

#[derive(Clone, Debug)]
pub struct GlobalDecl {
  pub name: String,
  pub elem_ty: Type,
  pub count: u32,
}

impl GlobalDecl {
  /// Type of the global's address.
  pub fn ptr_ty(&self) -> Type {
    Type::Ptr(Some(self.elem_ty.store_size()))
  }
}

#[derive(Clone, Debug, Default)]
pub struct Module {
  pub globals: Vec<GlobalDecl>,
  pub funcs: Vec<Func>,
}

impl Module {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn find_func(&self, name: &str) -> Option<&Func> {
    self.funcs.iter().find(|f| f.name == name)
  }

  pub fn find_global(&self, name: &str) -> Option<&GlobalDecl> {
    self.globals.iter().find(|g| g.name == name)
  }
}

impl fmt::Display for Module {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    for g in &self.globals {
      writeln!(fmt, "global @{}: {} x {}", g.name, g.elem_ty, g.count)?;
    }
    for f in &self.funcs {
      writeln!(fmt)?;
      write!(fmt, "{}", f)?;
    }
    Ok(())
  }
}

//=============================================================================
// Instruction constructors, in the style of the i_* helpers of the test
// framework.

pub fn i_binary(op: BinOp, lhs: ValueIx, rhs: ValueIx) -> InstKind {
  InstKind::Binary { op, args: [lhs, rhs] }
}
pub fn i_add(lhs: ValueIx, rhs: ValueIx) -> InstKind {
  i_binary(BinOp::Add, lhs, rhs)
}
pub fn i_sub(lhs: ValueIx, rhs: ValueIx) -> InstKind {
  i_binary(BinOp::Sub, lhs, rhs)
}
pub fn i_mul(lhs: ValueIx, rhs: ValueIx) -> InstKind {
  i_binary(BinOp::Mul, lhs, rhs)
}
pub fn i_icmp(cc: IntCC, lhs: ValueIx, rhs: ValueIx) -> InstKind {
  InstKind::Icmp { cc, args: [lhs, rhs] }
}
pub fn i_select(cond: ValueIx, t: ValueIx, f: ValueIx) -> InstKind {
  InstKind::Select { args: [cond, t, f] }
}
pub fn i_cast(op: CastOp, arg: ValueIx) -> InstKind {
  InstKind::Cast { op, arg }
}
pub fn i_gep(base: ValueIx, index: ValueIx) -> InstKind {
  InstKind::Gep { base, index }
}
pub fn i_load(ptr: ValueIx) -> InstKind {
  InstKind::Load { ptr }
}
pub fn i_store(value: ValueIx, ptr: ValueIx) -> InstKind {
  InstKind::Store { ptr, value }
}
pub fn i_alloca(count: u32) -> InstKind {
  InstKind::Alloca { count }
}
pub fn i_call(callee: &str, args: Vec<ValueIx>, attrs: CallAttrs) -> InstKind {
  InstKind::Call { callee: callee.to_string(), args, attrs }
}
pub fn i_phi(incoming: Vec<(BlockIx, ValueIx)>) -> InstKind {
  InstKind::Phi { incoming }
}
pub fn i_jump(dest: BlockIx) -> InstKind {
  InstKind::Jump { dest }
}
pub fn i_br(cond: ValueIx, t: BlockIx, f: BlockIx) -> InstKind {
  InstKind::Branch { cond, dests: [t, f] }
}
pub fn i_ret(value: Option<ValueIx>) -> InstKind {
  InstKind::Return { value }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn arithmetic_wraps_at_width() {
    assert_eq!(BinOp::Add.calc(127, 1, 8), Some(-128));
    assert_eq!(BinOp::UDiv.calc(-1, 2, 8), Some(127));
    assert_eq!(BinOp::SRem.calc(7, 0, 32), None);
    assert_eq!(BinOp::LShr.calc(-8, 1, 64), Some(i64::MAX - 3));
    assert!(IntCC::Ult.calc(1, -1, 32));
    assert!(!IntCC::Slt.calc(1, -1, 32));
    assert_eq!(CastOp::SExt.apply(1, Type::I1, Type::I32), -1);
    assert_eq!(CastOp::ZExt.apply(-1, Type::I8, Type::I32), 255);
    assert_eq!(CastOp::Trunc.apply(300, Type::I32, Type::I8), 44);
  }

  #[test]
  fn split_block_moves_tail_and_fixes_phis() {
    let mut f = Func::new("f", Type::Void);
    let n = f.add_param("n", Type::I64);
    let a = f.create_block("a");
    let b = f.create_block("b");
    let zero = f.iconst(Type::I64, 0);
    let x = f.ins(a, i_add(n, zero), Type::I64, "x");
    let j = f.append_inst(a, i_jump(b), Type::Void, "");
    let phi = f.ins(b, i_phi(vec![(a, x)]), Type::I64, "p");
    f.append_inst(b, i_ret(None), Type::Void, "");

    let new_b = f.split_block(a, j, "a.split");
    assert_eq!(f.succs(a).to_vec(), vec![new_b]);
    assert_eq!(f.preds(b), vec![new_b]);
    let phi_inst = f.def_inst(phi).unwrap();
    match f.kind(phi_inst) {
      InstKind::Phi { incoming } => assert_eq!(incoming[0].0, new_b),
      _ => panic!("expected a phi"),
    }
    assert_eq!(f.layout, vec![a, new_b, b]);
  }

  #[test]
  fn names_are_made_unique() {
    let mut f = Func::new("f", Type::Void);
    let b = f.create_block("entry");
    let p = f.add_param("x", Type::I64);
    let v1 = f.ins(b, i_add(p, p), Type::I64, "x");
    assert_eq!(f.value_name(v1), "x.1");
    let b2 = f.create_block("entry");
    assert_eq!(f.block_name(b2), "entry.1");
    assert_eq!(f.iconst(Type::I32, 5), f.iconst(Type::I32, 5));
  }
}
