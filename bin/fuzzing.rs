/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Random kernels for the fuzzers: a loop, maybe nested, over a few arrays,
//! indexed by affine functions of the induction variables, together with
//! arguments under which every access stays in bounds.  Arrays passed in
//! may overlap.

use arbitrary::{Arbitrary, Result, Unstructured};

use restrictify::{
  i_add, i_binary, i_br, i_call, i_cast, i_gep, i_icmp, i_jump, i_load, i_mul,
  i_phi, i_ret, i_select, i_store, i_sub, BinOp, BlockIx, CallAttrs, CastOp,
  Func, GlobalDecl, InstKind, InstrumentationMode, IntCC, Module, Type,
  ValueIx,
};

use crate::test_framework::Arg;

const MAX_EXTRA_PTRS: u8 = 3;
const MAX_STMTS: usize = 6;
const MAX_TRIP: u8 = 16;
const MAX_INNER_TRIP: u8 = 4;
const MAX_SCALE: u8 = 2;
const MAX_OFFSET: u8 = 4;
const MAX_ALIAS_OFFSET: u8 = 8;

/// Elements per array: enough for the largest index plus the largest shift
/// of an aliasing pointer.
pub const ARRAY_LEN: u32 = (MAX_SCALE as u32) * (MAX_TRIP as u32 - 1)
  + (MAX_INNER_TRIP as u32 - 1)
  + MAX_OFFSET as u32
  + MAX_ALIAS_OFFSET as u32
  + 3;

#[derive(Arbitrary, Clone, Copy, Debug)]
enum ElemTy {
  I8,
  I16,
  I32,
  I64,
}

impl ElemTy {
  fn ty(self) -> Type {
    match self {
      ElemTy::I8 => Type::I8,
      ElemTy::I16 => Type::I16,
      ElemTy::I32 => Type::I32,
      ElemTy::I64 => Type::I64,
    }
  }
}

/// `scale * i + j + offset`, or `scale * (n - 1 - i) + ...` when reversed.
#[derive(Arbitrary, Clone, Copy, Debug)]
struct Index {
  scale: u8,
  offset: u8,
  reversed: bool,
  inner: bool,
}

#[derive(Arbitrary, Clone, Copy, Debug)]
enum Op {
  Add,
  Sub,
  Mul,
  Xor,
  And,
  Shl,
  UDiv,
  SRem,
}

impl Op {
  fn binop(self) -> BinOp {
    match self {
      Op::Add => BinOp::Add,
      Op::Sub => BinOp::Sub,
      Op::Mul => BinOp::Mul,
      Op::Xor => BinOp::Xor,
      Op::And => BinOp::And,
      Op::Shl => BinOp::Shl,
      Op::UDiv => BinOp::UDiv,
      Op::SRem => BinOp::SRem,
    }
  }
}

#[derive(Arbitrary, Clone, Copy, Debug)]
enum StmtKind {
  Copy { dst: u8, dst_ix: Index, src: u8, src_ix: Index },
  Combine { dst: u8, dst_ix: Index, a: u8, a_ix: Index, b: u8, b_ix: Index, op: Op },
  Clamp { dst: u8, dst_ix: Index, src: u8, src_ix: Index, limit: i8 },
  Sqrt { dst: u8, dst_ix: Index, src: u8, src_ix: Index },
  Accumulate { src: u8, src_ix: Index },
  Tick,
}

#[derive(Arbitrary, Clone, Copy, Debug)]
struct Stmt {
  kind: StmtKind,
  /// Run only when the low bit of the given element is set.
  guard: Option<(u8, Index)>,
}

struct FuzzingEnv {
  func: Func,
  elem: Type,
  ptrs: Vec<ValueIx>,
  n: ValueIx,
  i: ValueIx,
  j: Option<ValueIx>,
  /// Running sum, when the loop is not nested.
  acc: Option<ValueIx>,
  cur: BlockIx,
  num_blocks: u32,
}

fn patch_phi(f: &mut Func, phi: ValueIx, from: BlockIx, v: ValueIx) {
  if let Some(pi) = f.def_inst(phi) {
    if let InstKind::Phi { incoming } = &mut f.insts[pi].kind {
      incoming.push((from, v));
    }
  }
}

impl FuzzingEnv {
  fn ins(&mut self, kind: InstKind, ty: Type, name: &str) -> ValueIx {
    let cur = self.cur;
    self.func.ins(cur, kind, ty, name)
  }

  fn new_block(&mut self, name: &str) -> BlockIx {
    self.num_blocks += 1;
    self.func.create_block(&format!("{}{}", name, self.num_blocks))
  }

  fn ptr(&self, k: u8) -> ValueIx {
    self.ptrs[k as usize % self.ptrs.len()]
  }

  fn index(&mut self, ix: Index) -> ValueIx {
    let i64t = Type::I64;
    let mut base = self.i;
    if ix.reversed {
      let one = self.func.iconst(i64t, 1);
      let last = self.ins(i_sub(self.n, one), i64t, "last");
      base = self.ins(i_sub(last, self.i), i64t, "rev");
    }
    let mut v = match ix.scale % (MAX_SCALE + 1) {
      0 => self.func.iconst(i64t, 0),
      1 => base,
      s => {
        let c = self.func.iconst(i64t, s as i64);
        self.ins(i_mul(base, c), i64t, "scaled")
      }
    };
    if let (true, Some(j)) = (ix.inner, self.j) {
      v = self.ins(i_add(v, j), i64t, "ij");
    }
    let off = ix.offset % (MAX_OFFSET + 1);
    if off != 0 {
      let c = self.func.iconst(i64t, off as i64);
      v = self.ins(i_add(v, c), i64t, "ix");
    }
    v
  }

  fn addr(&mut self, k: u8, ix: Index) -> ValueIx {
    let p = self.ptr(k);
    let idx = self.index(ix);
    let ty = self.func.value_ty(p);
    self.ins(i_gep(p, idx), ty, "p")
  }

  fn load(&mut self, k: u8, ix: Index) -> ValueIx {
    let p = self.addr(k, ix);
    let elem = self.elem;
    self.ins(i_load(p), elem, "v")
  }

  fn store(&mut self, k: u8, ix: Index, v: ValueIx) {
    let p = self.addr(k, ix);
    let cur = self.cur;
    self.func.append_inst(cur, i_store(v, p), Type::Void, "");
  }

  fn stmt_kind(&mut self, kind: StmtKind) {
    let elem = self.elem;
    match kind {
      StmtKind::Copy { dst, dst_ix, src, src_ix } => {
        let v = self.load(src, src_ix);
        self.store(dst, dst_ix, v);
      }
      StmtKind::Combine { dst, dst_ix, a, a_ix, b, b_ix, op } => {
        let va = self.load(a, a_ix);
        let vb = self.load(b, b_ix);
        let r = self.ins(i_binary(op.binop(), va, vb), elem, "r");
        self.store(dst, dst_ix, r);
      }
      StmtKind::Clamp { dst, dst_ix, src, src_ix, limit } => {
        let v = self.load(src, src_ix);
        let lim = self.func.iconst(elem, limit as i64);
        let big = self.ins(i_icmp(IntCC::Sgt, v, lim), Type::I1, "big");
        let r = self.ins(i_select(big, lim, v), elem, "clamped");
        self.store(dst, dst_ix, r);
      }
      StmtKind::Sqrt { dst, dst_ix, src, src_ix } => {
        let v = self.load(src, src_ix);
        let wide = if elem == Type::I64 {
          v
        } else {
          self.ins(i_cast(CastOp::SExt, v), Type::I64, "wide")
        };
        let attrs = CallAttrs::default();
        let abs = self.ins(i_call("abs", vec![wide], attrs), Type::I64, "abs");
        let root = self.ins(i_call("sqrt", vec![abs], attrs), Type::I64, "root");
        let r = if elem == Type::I64 {
          root
        } else {
          self.ins(i_cast(CastOp::Trunc, root), elem, "narrow")
        };
        self.store(dst, dst_ix, r);
      }
      StmtKind::Accumulate { src, src_ix } => {
        let v = self.load(src, src_ix);
        match self.acc {
          Some(acc) => {
            let sum = self.ins(i_add(acc, v), elem, "acc.next");
            self.acc = Some(sum);
          }
          None => {
            // Nested loops sum into memory instead.
            let old = self.load(0, src_ix);
            let sum = self.ins(i_add(old, v), elem, "sum");
            self.store(0, src_ix, sum);
          }
        }
      }
      StmtKind::Tick => {
        let one = self.func.iconst(Type::I64, 1);
        self.ins(i_call("tick", vec![one], CallAttrs::default()), Type::I64, "tick");
      }
    }
  }

  fn stmt(&mut self, stmt: Stmt) {
    let (c, c_ix) = match stmt.guard {
      None => return self.stmt_kind(stmt.kind),
      Some(g) => g,
    };
    let elem = self.elem;
    let v = self.load(c, c_ix);
    let one = self.func.iconst(elem, 1);
    let zero = self.func.iconst(elem, 0);
    let bit = self.ins(i_binary(BinOp::And, v, one), elem, "bit");
    let set = self.ins(i_icmp(IntCC::Ne, bit, zero), Type::I1, "set");
    let then_b = self.new_block("then");
    let join_b = self.new_block("join");
    let from = self.cur;
    self.func.append_inst(from, i_br(set, then_b, join_b), Type::Void, "");

    let acc_before = self.acc;
    self.cur = then_b;
    self.stmt_kind(stmt.kind);
    let then_end = self.cur;
    self.func.append_inst(then_end, i_jump(join_b), Type::Void, "");
    self.cur = join_b;

    if let (Some(before), Some(after)) = (acc_before, self.acc) {
      if before != after {
        let merged = self.ins(
          i_phi(vec![(from, before), (then_end, after)]),
          elem,
          "acc.merge",
        );
        self.acc = Some(merged);
      }
    }
  }
}

// `@tick` adds its argument to `@counter` and returns the new count.
fn tick_func() -> Func {
  let mut f = Func::new("tick", Type::I64);
  let x = f.add_param("x", Type::I64);
  let entry = f.create_block("entry");
  let counter = f.global("counter", Type::Ptr(Some(8)));
  let c = f.ins(entry, i_load(counter), Type::I64, "c");
  let c1 = f.ins(entry, i_add(c, x), Type::I64, "c1");
  f.append_inst(entry, i_store(c1, counter), Type::Void, "");
  f.append_inst(entry, i_ret(Some(c1)), Type::Void, "");
  f
}

fn build_kernel(elem: ElemTy, num_ptrs: usize, nested: bool, stmts: &[Stmt]) -> Module {
  let elem = elem.ty();
  let ret_ty = if nested { Type::Void } else { elem };
  let mut func = Func::new("kernel", ret_ty);
  let ptr_ty = Type::Ptr(Some(elem.store_size()));
  let ptrs: Vec<ValueIx> =
    (0..num_ptrs).map(|k| func.add_param(&format!("P{}", k), ptr_ty)).collect();
  let n = func.add_param("n", Type::I64);
  let m = if nested { Some(func.add_param("m", Type::I64)) } else { None };

  let entry = func.create_block("entry");
  let head = func.create_block("head");
  let body = func.create_block("body");
  let exit = func.create_block("exit");
  let zero = func.iconst(Type::I64, 0);
  let one = func.iconst(Type::I64, 1);
  let elem_zero = func.iconst(elem, 0);

  func.append_inst(entry, i_jump(head), Type::Void, "");
  let i = func.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "i");
  let acc = if nested {
    None
  } else {
    Some(func.ins(head, i_phi(vec![(entry, elem_zero)]), elem, "acc"))
  };
  let cmp = func.ins(head, i_icmp(IntCC::Slt, i, n), Type::I1, "cmp");
  func.append_inst(head, i_br(cmp, body, exit), Type::Void, "");

  let mut env = FuzzingEnv { func, elem, ptrs, n, i, j: None, acc, cur: body, num_blocks: 0 };

  let latch = match m {
    None => {
      for s in stmts {
        env.stmt(*s);
      }
      env.cur
    }
    Some(m) => {
      let ihead = env.new_block("inner");
      let latch = env.new_block("latch");
      env.func.append_inst(body, i_jump(ihead), Type::Void, "");
      let j = env.func.ins(ihead, i_phi(vec![(body, zero)]), Type::I64, "j");
      let cj = env.func.ins(ihead, i_icmp(IntCC::Slt, j, m), Type::I1, "cj");
      let ibody = env.new_block("ibody");
      env.func.append_inst(ihead, i_br(cj, ibody, latch), Type::Void, "");
      env.j = Some(j);
      env.cur = ibody;
      for s in stmts {
        env.stmt(*s);
      }
      let ilatch = env.cur;
      let j_next = env.func.ins(ilatch, i_add(j, one), Type::I64, "j.next");
      env.func.append_inst(ilatch, i_jump(ihead), Type::Void, "");
      patch_phi(&mut env.func, j, ilatch, j_next);
      latch
    }
  };

  let i_next = env.func.ins(latch, i_add(i, one), Type::I64, "i.next");
  env.func.append_inst(latch, i_jump(head), Type::Void, "");
  patch_phi(&mut env.func, i, latch, i_next);
  if let (Some(phi), Some(last)) = (acc, env.acc) {
    patch_phi(&mut env.func, phi, latch, last);
  }
  env.func.append_inst(exit, i_ret(acc), Type::Void, "");

  let mut module = Module::new();
  module.globals.push(GlobalDecl { name: "counter".to_string(), elem_ty: Type::I64, count: 1 });
  module.funcs.push(Func::new_declaration("abs", Type::I64, &[Type::I64]));
  module.funcs.push(Func::new_declaration("sqrt", Type::I64, &[Type::I64]));
  module.funcs.push(tick_func());
  module.funcs.push(env.func);
  module
}

/// A kernel, the arguments to run it with, and how to version it.
#[derive(Clone, Debug)]
pub struct Kernel {
  pub module: Module,
  pub func: String,
  pub args: Vec<Arg>,
  pub mode: InstrumentationMode,
  pub licm: bool,
}

impl<'a> Arbitrary<'a> for Kernel {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<Kernel> {
    let elem = ElemTy::arbitrary(u)?;
    let num_ptrs = 2 + (u8::arbitrary(u)? % MAX_EXTRA_PTRS) as usize;
    let nested = bool::arbitrary(u)?;
    let num_stmts = 1 + usize::arbitrary(u)? % MAX_STMTS;
    let mut stmts = Vec::with_capacity(num_stmts);
    for _ in 0..num_stmts {
      stmts.push(Stmt::arbitrary(u)?);
    }

    // Pointers either get an array of their own or point into an earlier
    // one.
    let mut args = Vec::new();
    let mut fresh = Vec::new();
    for k in 0..num_ptrs {
      if k == 0 || bool::arbitrary(u)? {
        fresh.push(k);
        args.push(Arg::Array { len: ARRAY_LEN });
      } else {
        let of = fresh[u8::arbitrary(u)? as usize % fresh.len()];
        let offset = (u8::arbitrary(u)? % (MAX_ALIAS_OFFSET + 1)) as i64;
        args.push(Arg::Alias { of, offset });
      }
    }
    args.push(Arg::Int((u8::arbitrary(u)? % (MAX_TRIP + 1)) as i64));
    if nested {
      args.push(Arg::Int(1 + (u8::arbitrary(u)? % MAX_INNER_TRIP) as i64));
    }

    let mode = if bool::arbitrary(u)? {
      InstrumentationMode::Function
    } else {
      InstrumentationMode::Region
    };
    let licm = bool::arbitrary(u)?;
    let module = build_kernel(elem, num_ptrs, nested, &stmts);
    Ok(Kernel { module, func: "kernel".to_string(), args, mode, licm })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::run_func;
  use crate::validator::validate;

  #[test]
  fn kernels_are_well_formed_and_run() {
    let _ = pretty_env_logger::try_init();
    for seed in 0..64u32 {
      let bytes: Vec<u8> = (0..512u32)
        .map(|k| (k.wrapping_mul(2654435761).wrapping_add(seed.wrapping_mul(40503)) >> 13) as u8)
        .collect();
      let mut u = Unstructured::new(&bytes);
      let kernel = Kernel::arbitrary(&mut u).unwrap();
      let f = kernel.module.find_func(&kernel.func).unwrap();
      for g in &kernel.module.funcs {
        validate(&kernel.module, g).unwrap();
      }
      match run_func(&kernel.module, f, "fuzz", &kernel.args) {
        Ok(_) => {}
        Err(crate::test_framework::RunError::DivisionByZero(_)) => {}
        Err(e) => panic!("seed {}: {}\n{}", seed, e, f),
      }
    }
  }
}
