/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Loop-invariant code motion.
//!
//! Moving invariant address computations and loads out of loops turns
//! values the range collector would otherwise have to prove invariant into
//! values defined before the loop, which is what lets inner-loop regions be
//! characterized on their own.

#![allow(non_snake_case)]

use log::{debug, trace};

use crate::alias::{AliasOracle, AliasResult};
use crate::data_structures::{BlockIx, InstIx, LoopIx, ValueIx};
use crate::interface::FuncAnalyses;
use crate::ir::{Func, InstKind};

// Defined outside the loop, or not an instruction at all.
fn is_defined_outside(func: &Func, an: &FuncAnalyses, l: LoopIx, v: ValueIx) -> bool {
  match func.def_inst(v) {
    None => true,
    Some(i) => match func.inst_block(i) {
      Some(b) => !an.li.contains_block(l, b),
      None => false,
    },
  }
}

// Executed on every iteration that completes.  Instructions that may fault
// are only hoisted from such blocks.
fn always_executes(func: &Func, an: &FuncAnalyses, l: LoopIx, b: BlockIx) -> bool {
  an.li.exiting_blocks(func, l).iter().all(|x| an.dt.dominates(b, *x))
}

struct LoopMemory {
  stored_ptrs: Vec<ValueIx>,
  has_writing_call: bool,
}

fn loop_memory(func: &Func, an: &FuncAnalyses, l: LoopIx) -> LoopMemory {
  let mut res = LoopMemory { stored_ptrs: vec![], has_writing_call: false };
  for b in an.li.blocks_in_layout(func, l) {
    for i in func.block_insts(b) {
      match func.kind(*i) {
        InstKind::Store { ptr, .. } => res.stored_ptrs.push(*ptr),
        InstKind::Call { attrs, .. } if !attrs.read_none => {
          res.has_writing_call = true
        }
        _ => {}
      }
    }
  }
  res
}

fn can_hoist(
  func: &Func, an: &FuncAnalyses, aa: &dyn AliasOracle, l: LoopIx,
  mem: &LoopMemory, i: InstIx,
) -> bool {
  let kind = func.kind(i);
  let operands_invariant =
    kind.operands().iter().all(|v| is_defined_outside(func, an, l, *v));
  if !operands_invariant {
    return false;
  }
  let block = match func.inst_block(i) {
    Some(b) => b,
    None => return false,
  };
  match kind {
    InstKind::Binary { op, .. } => {
      !op.may_trap() || always_executes(func, an, l, block)
    }
    InstKind::Icmp { .. }
    | InstKind::Select { .. }
    | InstKind::Cast { .. }
    | InstKind::Gep { .. } => true,
    InstKind::Load { ptr } => {
      !mem.has_writing_call
        && always_executes(func, an, l, block)
        && mem
          .stored_ptrs
          .iter()
          .all(|s| aa.alias(func, *s, *ptr) == AliasResult::NoAlias)
    }
    _ => false,
  }
}

/// Hoists loop-invariant instructions into loop preheaders, innermost loops
/// first.  Loops without a preheader are left alone.  The control flow is
/// not changed, so `an` stays valid.  Returns the number of instructions
/// moved.
#[inline(never)]
pub fn hoist_loop_invariants(
  func: &mut Func, an: &FuncAnalyses, aa: &dyn AliasOracle,
) -> u32 {
  let mut nHoisted = 0;
  for l in an.li.innermost_first() {
    let preheader = match an.li.preheader(func, l) {
      Some(p) => p,
      None => continue,
    };
    let mem = loop_memory(func, an, l);
    // Hoisting an instruction can make its users invariant.
    loop {
      let mut changed = false;
      for b in an.li.blocks_in_layout(func, l) {
        let insts: Vec<InstIx> = func.block_insts(b).to_vec();
        for i in insts {
          if !can_hoist(func, an, aa, l, &mem, i) {
            continue;
          }
          let at = match func.terminator(preheader) {
            Some(t) => t,
            None => continue,
          };
          trace!(
            "licm: hoisting {} into {}",
            func.display_inst(i),
            func.block_name(preheader)
          );
          func.move_inst_before(i, at);
          nHoisted += 1;
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }
  }
  debug!("licm: {}: hoisted {} instruction(s)", func.name, nHoisted);
  nHoisted
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::alias::BasicAliasOracle;
  use crate::ir::*;

  // for (i = 0; i < n; i++) { q = load pp; A[i] = q[k * 2]; }
  fn invariant_row() -> (Func, Vec<ValueIx>) {
    let mut f = Func::new("row", Type::Void);
    let a = f.add_param("A", Type::Ptr(Some(4)));
    let pp = f.add_param("pp", Type::Ptr(Some(8)));
    let n = f.add_param("n", Type::I64);
    let k = f.add_param("k", Type::I64);
    f.set_noalias(a);
    f.set_noalias(pp);
    let entry = f.create_block("entry");
    let head = f.create_block("head");
    let body = f.create_block("body");
    let exit = f.create_block("exit");
    let zero = f.iconst(Type::I64, 0);
    let one = f.iconst(Type::I64, 1);
    let two = f.iconst(Type::I64, 2);
    f.append_inst(entry, i_jump(head), Type::Void, "");
    let i = f.ins(head, i_phi(vec![(entry, zero)]), Type::I64, "i");
    let q = f.ins(head, i_load(pp), Type::Ptr(Some(4)), "q");
    let k2 = f.ins(head, i_mul(k, two), Type::I64, "k2");
    let cmp = f.ins(head, i_icmp(IntCC::Slt, i, n), Type::I1, "cmp");
    f.append_inst(head, i_br(cmp, body, exit), Type::Void, "");
    let pq = f.ins(body, i_gep(q, k2), Type::Ptr(Some(4)), "pq");
    let v = f.ins(body, i_load(pq), Type::I32, "v");
    let pa = f.ins(body, i_gep(a, i), Type::Ptr(Some(4)), "pa");
    f.append_inst(body, i_store(v, pa), Type::Void, "");
    let next = f.ins(body, i_add(i, one), Type::I64, "i.next");
    f.append_inst(body, i_jump(head), Type::Void, "");
    f.append_inst(exit, i_ret(None), Type::Void, "");
    let pi = f.def_inst(i).unwrap();
    if let InstKind::Phi { incoming } = &mut f.insts[pi].kind {
      incoming.push((body, next));
    }
    (f, vec![q, k2, pq, v, pa])
  }

  #[test]
  fn invariant_loads_and_addresses_move_to_the_preheader() {
    let (mut f, vals) = invariant_row();
    let an = FuncAnalyses::compute(&f).unwrap();
    let entry = f.entry_block().unwrap();
    let n = hoist_loop_invariants(&mut f, &an, &BasicAliasOracle);
    let block_of = |f: &Func, v: ValueIx| f.inst_block(f.def_inst(v).unwrap());
    // q and k2 are invariant; pq only once q is out.
    assert_eq!(n, 3);
    assert_eq!(block_of(&f, vals[0]), Some(entry));
    assert_eq!(block_of(&f, vals[1]), Some(entry));
    assert_eq!(block_of(&f, vals[2]), Some(entry));
    // The load through pq may fault on a zero-trip loop; pa depends on i.
    assert_ne!(block_of(&f, vals[3]), Some(entry));
    assert_ne!(block_of(&f, vals[4]), Some(entry));
    assert!(crate::verify::verify_func(&f).is_ok());
  }

  #[test]
  fn clobbered_loads_stay() {
    let (mut f, vals) = invariant_row();
    // Without noalias, the store to A may overwrite *pp.
    let a = f.params[0];
    let pp = f.params[1];
    f.values[a].noalias = false;
    f.values[pp].noalias = false;
    let an = FuncAnalyses::compute(&f).unwrap();
    let head = f.block_by_name("head").unwrap();
    hoist_loop_invariants(&mut f, &an, &BasicAliasOracle);
    assert_eq!(f.inst_block(f.def_inst(vals[0]).unwrap()), Some(head));
  }
}
