/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Structural and SSA checks on a `Func`.

#![allow(non_snake_case)]

use log::debug;

use crate::cfg::DomTree;
use crate::data_structures::{BlockIx, Set};
use crate::ir::{Func, InstKind, ValueDef};

/// Checks that every block is terminated exactly once at its end, that phis
/// lead their block and name exactly its predecessors, and that every value
/// is defined before each of its uses.  A phi operand counts as used at the
/// end of the incoming block.
#[inline(never)]
pub fn verify_func(func: &Func) -> Result<(), String> {
  let dt = DomTree::from_func(func).map_err(|e| e.to_string())?;

  let mut nChecked = 0;
  for b in &func.layout {
    let name = func.block_name(*b);
    let insts = func.block_insts(*b);
    let mut seen_non_phi = false;
    for (pos, i) in insts.iter().enumerate() {
      let data = &func.insts[*i];
      if data.block != Some(*b) {
        return Err(format!("{}: instruction {:?} thinks it lives elsewhere", name, i));
      }
      let is_last = pos + 1 == insts.len();
      if data.kind.is_terminator() != is_last {
        return Err(format!("{}: misplaced terminator or none at all", name));
      }
      if data.kind.is_phi() {
        if seen_non_phi {
          return Err(format!("{}: phi after a non-phi instruction", name));
        }
      } else {
        seen_non_phi = true;
      }
    }

    let preds = Set::from_vec(func.preds(*b));
    for i in insts {
      match func.kind(*i) {
        InstKind::Phi { incoming } => {
          let from: Vec<BlockIx> = incoming.iter().map(|(ib, _)| *ib).collect();
          let from_set = Set::from_vec(from.clone());
          if from_set.card() != from.len() || !from_set.equals(&preds) {
            return Err(format!(
              "{}: {} does not match the predecessors",
              name,
              func.display_inst(*i)
            ));
          }
          for (ib, iv) in incoming {
            let at = match func.terminator(*ib) {
              Some(t) => t,
              None => return Err(format!("{} is not terminated", func.block_name(*ib))),
            };
            if let ValueDef::Inst(d) = func.values[*iv].def {
              if !dt.inst_dominates(func, d, at) {
                return Err(format!(
                  "{}: {} is not available at the end of {}",
                  name,
                  func.display_value(*iv),
                  func.block_name(*ib)
                ));
              }
            }
            nChecked += 1;
          }
        }
        kind => {
          for v in kind.operands() {
            if let ValueDef::Inst(d) = func.values[v].def {
              if !dt.inst_dominates(func, d, *i) {
                return Err(format!(
                  "{}: {} uses {} before its definition",
                  name,
                  func.display_inst(*i),
                  func.display_value(v)
                ));
              }
            }
            nChecked += 1;
          }
        }
      }
    }
  }
  debug!("verify_func: {}: {} uses checked", func.name, nChecked);
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::ir::*;
  use crate::test_utils::shifted_copy;

  #[test]
  fn well_formed_functions_pass() {
    assert_eq!(verify_func(&shifted_copy()), Ok(()));
  }

  #[test]
  fn use_before_def_is_caught() {
    let mut f = shifted_copy();
    let body = f.block_by_name("body").unwrap();
    // Move the address computation of B[i + m] in front of i + m.
    let pb = f.value_by_name("pb").unwrap();
    let first = f.block_insts(body)[0];
    f.move_inst_before(f.def_inst(pb).unwrap(), first);
    assert!(verify_func(&f).is_err());

    // A value of the loop used in the entry.
    let mut f = shifted_copy();
    let entry = f.entry_block().unwrap();
    let i = f.value_by_name("i").unwrap();
    let jump = f.terminator(entry).unwrap();
    f.insert_inst_before(jump, i_add(i, i), Type::I64, "bad");
    assert!(verify_func(&f).is_err());
  }

  #[test]
  fn phi_inputs_must_match_predecessors() {
    let mut f = shifted_copy();
    let i = f.value_by_name("i").unwrap();
    let phi = f.def_inst(i).unwrap();
    if let InstKind::Phi { incoming } = &mut f.insts[phi].kind {
      incoming.pop();
    }
    assert!(verify_func(&f).is_err());
  }

  #[test]
  fn misplaced_terminators_are_caught() {
    let mut f = shifted_copy();
    let exit = f.block_by_name("exit").unwrap();
    f.append_inst(exit, i_ret(None), Type::Void, "");
    assert!(verify_func(&f).is_err());
  }
}
