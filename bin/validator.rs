/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Type checks for functions read from text or built by the fuzzer, on top
//! of the library's structural checks.

use std::mem;

use restrictify::{verify_func, Func, InstKind, Module, Type, ValueIx};

use crate::test_framework::{RunError, RunResult};

struct Context<'a> {
  module: &'a Module,
  func: &'a Func,
}

impl<'a> Context<'a> {
  fn ty(&self, v: ValueIx) -> Type {
    self.func.value_ty(v)
  }

  fn expect_int(&self, v: ValueIx, what: &str) -> Result<(), String> {
    if self.ty(v).is_int() {
      Ok(())
    } else {
      Err(format!("{}: {} is not an integer", what, self.func.display_value(v)))
    }
  }

  fn expect_ptr(&self, v: ValueIx, what: &str) -> Result<(), String> {
    if self.ty(v).is_ptr() {
      Ok(())
    } else {
      Err(format!("{}: {} is not a pointer", what, self.func.display_value(v)))
    }
  }

  fn expect_same(&self, a: Type, b: Type, what: &str) -> Result<(), String> {
    if a.effective() == b.effective() {
      Ok(())
    } else {
      Err(format!("{}: {} and {} differ", what, a, b))
    }
  }

  fn check_call(
    &self, callee: &str, args: &[ValueIx], res_ty: Type, what: &str,
  ) -> Result<(), String> {
    let f = match self.module.find_func(callee) {
      Some(f) => f,
      // Library functions are checked by the interpreter.
      None => return Ok(()),
    };
    if f.params.len() != args.len() {
      return Err(format!("{}: @{} takes {} argument(s)", what, callee, f.params.len()));
    }
    for (p, a) in f.params.iter().zip(args.iter()) {
      self.expect_same(f.value_ty(*p), self.ty(*a), what)?;
    }
    self.expect_same(f.ret_ty, res_ty, what)
  }
}

/// Checks `func` structurally, and that each instruction's operands have
/// types it accepts.
pub fn validate(module: &Module, func: &Func) -> Result<(), String> {
  if func.is_declaration {
    return Ok(());
  }
  verify_func(func)?;
  let cx = Context { module, func };

  for b in &func.layout {
    for i in func.block_insts(*b) {
      let what = format!("{}: {}", func.block_name(*b), func.display_inst(*i));
      let what = what.as_str();
      let res_ty = func.insts[*i].result.map(|r| func.value_ty(r)).unwrap_or(Type::Void);
      match func.kind(*i) {
        InstKind::Binary { args, .. } => {
          cx.expect_int(args[0], what)?;
          cx.expect_same(cx.ty(args[0]), res_ty, what)?;
          cx.expect_same(cx.ty(args[1]), res_ty, what)?;
        }
        InstKind::Icmp { args, .. } => {
          cx.expect_same(cx.ty(args[0]), cx.ty(args[1]), what)?;
        }
        InstKind::Select { args } => {
          cx.expect_same(cx.ty(args[0]), Type::I1, what)?;
          cx.expect_same(cx.ty(args[1]), res_ty, what)?;
          cx.expect_same(cx.ty(args[2]), res_ty, what)?;
        }
        InstKind::Cast { arg, .. } => {
          if res_ty == Type::Void || cx.ty(*arg) == Type::Void {
            return Err(format!("{}: cast from or to void", what));
          }
        }
        InstKind::Gep { base, index } => {
          cx.expect_ptr(*base, what)?;
          cx.expect_int(*index, what)?;
        }
        InstKind::Load { ptr } => {
          cx.expect_ptr(*ptr, what)?;
          if res_ty == Type::Void {
            return Err(format!("{}: load of void", what));
          }
        }
        InstKind::Store { ptr, value } => {
          cx.expect_ptr(*ptr, what)?;
          if cx.ty(*value) == Type::Void {
            return Err(format!("{}: store of void", what));
          }
        }
        InstKind::Alloca { .. } => {}
        InstKind::Call { callee, args, .. } => {
          cx.check_call(callee, args, res_ty, what)?;
        }
        InstKind::Phi { incoming } => {
          for (_, v) in incoming {
            cx.expect_same(cx.ty(*v), res_ty, what)?;
          }
        }
        InstKind::Jump { .. } => {}
        InstKind::Branch { cond, .. } => {
          cx.expect_same(cx.ty(*cond), Type::I1, what)?;
        }
        InstKind::Return { value } => {
          let ty = value.map(|v| cx.ty(v)).unwrap_or(Type::Void);
          cx.expect_same(ty, func.ret_ty, what)?;
        }
      }
    }
  }
  Ok(())
}

/// Compares a run of the original function with a run of its transformed
/// version.  Versioning only adds work outside the regions it copies, so
/// unless loop invariants were hoisted the transformed function never runs
/// fewer steps.
pub fn check_results(
  before: &Result<RunResult, RunError>, after: &Result<RunResult, RunError>,
  hoisted: bool,
) -> Result<(), String> {
  match (before, after) {
    (Ok(before), Ok(after)) => {
      if before.ret_value != after.ret_value {
        return Err(format!(
          "return values differ: {:?} before, {:?} after",
          before.ret_value, after.ret_value
        ));
      }
      if before.memory != after.memory {
        let first = before
          .memory
          .iter()
          .zip(after.memory.iter())
          .position(|(a, b)| a != b)
          .unwrap_or_else(|| before.memory.len().min(after.memory.len()));
        return Err(format!("memory differs, first at offset {}", first));
      }
      if !hoisted && before.num_steps > after.num_steps {
        return Err(format!(
          "{} steps before, only {} after",
          before.num_steps, after.num_steps
        ));
      }
      Ok(())
    }
    // Running out of steps depends on how many the checks take.
    (Err(RunError::StepLimit), _) | (_, Err(RunError::StepLimit)) => Ok(()),
    // The copy of a failing instruction has another name.
    (Err(e1), Err(e2)) if mem::discriminant(e1) == mem::discriminant(e2) => Ok(()),
    (Err(e1), Err(e2)) => Err(format!("different failures: {}, then {}", e1, e2)),
    (Ok(_), Err(e)) => Err(format!("failed only after the transformation: {}", e)),
    (Err(e), Ok(_)) => Err(format!("succeeded only after the transformation: {}", e)),
  }
}
