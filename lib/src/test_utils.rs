/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Sample kernels for the unit tests, exported with the `fuzzing` feature.

use crate::data_structures::{BlockIx, Map, ValueIx};
use crate::ir::*;

fn patch_phi(f: &mut Func, phi: ValueIx, from: BlockIx, v: ValueIx) {
  if let Some(pi) = f.def_inst(phi) {
    if let InstKind::Phi { incoming } = &mut f.insts[pi].kind {
      incoming.push((from, v));
    }
  }
}

/// `for (i = start; i <cc> n; i += step) A[i] = 0;` over `i32` elements.
/// Returns the function, `i` and the address stored to.
pub fn counted_loop(cc: IntCC, start: i64, step: i64) -> (Func, ValueIx, ValueIx) {
  let mut f = Func::new("counted", Type::Void);
  let a = f.add_param("A", Type::Ptr(Some(4)));
  let n = f.add_param("n", Type::I64);
  let entry = f.create_block("entry");
  let head = f.create_block("head");
  let body = f.create_block("body");
  let exit = f.create_block("exit");
  let c_start = f.iconst(Type::I64, start);
  let c_step = f.iconst(Type::I64, step);
  let zero = f.iconst(Type::I32, 0);

  f.append_inst(entry, i_jump(head), Type::Void, "");
  let i = f.ins(head, i_phi(vec![(entry, c_start)]), Type::I64, "i");
  let cmp = f.ins(head, i_icmp(cc, i, n), Type::I1, "cmp");
  f.append_inst(head, i_br(cmp, body, exit), Type::Void, "");
  let p = f.ins(body, i_gep(a, i), Type::Ptr(Some(4)), "p");
  f.append_inst(body, i_store(zero, p), Type::Void, "");
  let next = f.ins(body, i_add(i, c_step), Type::I64, "i.next");
  f.append_inst(body, i_jump(head), Type::Void, "");
  f.append_inst(exit, i_ret(None), Type::Void, "");
  patch_phi(&mut f, i, body, next);
  (f, i, p)
}

/// `for (i = 0; i < n; i++) A[i] = B[i + m]; return i;`
pub fn shifted_copy() -> Func {
  let mut f = Func::new("shifted_copy", Type::I64);
  let a = f.add_param("A", Type::Ptr(Some(4)));
  let b = f.add_param("B", Type::Ptr(Some(4)));
  let n = f.add_param("n", Type::I64);
  let m = f.add_param("m", Type::I64);
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
  let im = f.ins(body, i_add(i, m), Type::I64, "im");
  let pb = f.ins(body, i_gep(b, im), Type::Ptr(Some(4)), "pb");
  let v = f.ins(body, i_load(pb), Type::I32, "v");
  let pa = f.ins(body, i_gep(a, i), Type::Ptr(Some(4)), "pa");
  f.append_inst(body, i_store(v, pa), Type::Void, "");
  let next = f.ins(body, i_add(i, one), Type::I64, "i.next");
  f.append_inst(body, i_jump(head), Type::Void, "");
  f.append_inst(exit, i_ret(Some(i)), Type::Void, "");
  patch_phi(&mut f, i, body, next);
  f
}

/// `for (i = 0; i < n; i++) A[i] = B[i];`
pub fn copy_kernel() -> Func {
  let mut f = Func::new("copy", Type::Void);
  let a = f.add_param("A", Type::Ptr(Some(4)));
  let b = f.add_param("B", Type::Ptr(Some(4)));
  let n = f.add_param("n", Type::I64);
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
  let pb = f.ins(body, i_gep(b, i), Type::Ptr(Some(4)), "pb");
  let v = f.ins(body, i_load(pb), Type::I32, "v");
  let pa = f.ins(body, i_gep(a, i), Type::Ptr(Some(4)), "pa");
  f.append_inst(body, i_store(v, pa), Type::Void, "");
  let next = f.ins(body, i_add(i, one), Type::I64, "i.next");
  f.append_inst(body, i_jump(head), Type::Void, "");
  f.append_inst(exit, i_ret(None), Type::Void, "");
  patch_phi(&mut f, i, body, next);
  f
}

/// `for (i = 0; i < n; i++) { T[i % 16] = A[i]; B[i] = T[i % 16]; }`, with
/// `T` allocated on the stack in the entry block.
pub fn staged_kernel() -> Func {
  let mut f = Func::new("staged", Type::Void);
  let a = f.add_param("A", Type::Ptr(Some(4)));
  let b = f.add_param("B", Type::Ptr(Some(4)));
  let n = f.add_param("n", Type::I64);
  let entry = f.create_block("entry");
  let head = f.create_block("head");
  let body = f.create_block("body");
  let exit = f.create_block("exit");
  let zero = f.iconst(Type::I64, 0);
  let one = f.iconst(Type::I64, 1);
  let sixteen = f.iconst(Type::I64, 16);

  let t = f.ins(entry, i_alloca(16), Type::Ptr(Some(4)), "T");
  f.append_inst(entry, i_jump(head), Type::Void, "");
  let i = f.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "i");
  let cmp = f.ins(head, i_icmp(IntCC::Slt, i, n), Type::I1, "cmp");
  f.append_inst(head, i_br(cmp, body, exit), Type::Void, "");
  let k = f.ins(body, i_binary(BinOp::URem, i, sixteen), Type::I64, "k");
  let pa = f.ins(body, i_gep(a, i), Type::Ptr(Some(4)), "pa");
  let v = f.ins(body, i_load(pa), Type::I32, "a");
  let pt = f.ins(body, i_gep(t, k), Type::Ptr(Some(4)), "pt");
  f.append_inst(body, i_store(v, pt), Type::Void, "");
  let w = f.ins(body, i_load(pt), Type::I32, "t");
  let pb = f.ins(body, i_gep(b, i), Type::Ptr(Some(4)), "pb");
  f.append_inst(body, i_store(w, pb), Type::Void, "");
  let next = f.ins(body, i_add(i, one), Type::I64, "i.next");
  f.append_inst(body, i_jump(head), Type::Void, "");
  f.append_inst(exit, i_ret(None), Type::Void, "");
  patch_phi(&mut f, i, body, next);
  f
}

/// Evaluates a value computed by phi-free, memory-free instructions, given
/// the values of the leaves it depends on.
pub fn eval_straight_line(f: &Func, env: &Map<ValueIx, i64>, v: ValueIx) -> i64 {
  if let Some(c) = env.get(&v) {
    return *c;
  }
  if let Some(c) = f.const_value(v) {
    return c;
  }
  let i = match f.def_inst(v) {
    Some(i) => i,
    None => panic!("eval_straight_line: no value for {}", f.display_value(v)),
  };
  let ty = f.value_ty(v).effective();
  let arg_bits = |x: ValueIx| f.value_ty(x).effective().bits();
  match f.kind(i) {
    InstKind::Binary { op, args } => {
      let a = eval_straight_line(f, env, args[0]);
      let b = eval_straight_line(f, env, args[1]);
      match op.calc(a, b, ty.bits()) {
        Some(r) => r,
        None => panic!("eval_straight_line: {} traps", f.display_inst(i)),
      }
    }
    InstKind::Icmp { cc, args } => {
      let a = eval_straight_line(f, env, args[0]);
      let b = eval_straight_line(f, env, args[1]);
      cc.calc(a, b, arg_bits(args[0])) as i64
    }
    InstKind::Select { args } => {
      if eval_straight_line(f, env, args[0]) & 1 != 0 {
        eval_straight_line(f, env, args[1])
      } else {
        eval_straight_line(f, env, args[2])
      }
    }
    InstKind::Cast { op, arg } => {
      let a = eval_straight_line(f, env, *arg);
      op.apply(a, f.value_ty(*arg), f.value_ty(v))
    }
    _ => panic!("eval_straight_line: cannot evaluate {}", f.display_inst(i)),
  }
}
