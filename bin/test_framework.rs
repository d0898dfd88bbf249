/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! An interpreter for the IR, used to check that versioning preserves the
//! behaviour of a function.
//!
//! Memory is a flat little-endian byte array starting at `MEM_BASE`.  Arrays
//! passed as arguments, globals and stack slots are carved out of it by a
//! bump allocator, in a deterministic order, so that two runs of the same
//! function with the same arguments produce byte-identical memory images.
//!
//! Runs also check the alias scope tags versioning adds: an access tagged
//! `noalias(S)` must not touch a byte that an access in scope `S` touched
//! since the function last passed through a versioning guard.

#![allow(non_snake_case)]

use std::fmt;

use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use restrictify::{
  normalize, BlockIx, Func, InstIx, InstKind, Map, Module, ModuleReport, ScopeIx,
  Type, ValueDef, ValueIx,
};

/// Address of the first byte of memory.
pub const MEM_BASE: i64 = 0x1000;

const MAX_MEM: usize = 1 << 24;
const DEFAULT_MAX_STEPS: u64 = 1_000_000;
const MAX_CALL_DEPTH: u32 = 64;

//=============================================================================
// Arguments and results

/// An argument of a function run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Arg {
  Int(i64),
  /// A fresh array of `len` elements of the parameter's element type,
  /// filled with a fixed pattern.
  Array { len: u32 },
  /// A pointer `offset` elements into the array passed as argument `of`.
  Alias { of: usize, offset: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunError {
  OutOfBounds { addr: i64, size: u32 },
  DivisionByZero(String),
  StepLimit,
  UnknownCallee(String),
  NoReturn(String),
  OutOfMemory,
  Malformed(String),
  /// `inst` touched `addr`, which an access of a scope it is declared
  /// disjoint from touched earlier in the same pass.
  ScopeViolation { addr: i64, inst: String },
}

impl fmt::Display for RunError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RunError::OutOfBounds { addr, size } => {
        write!(fmt, "access of {} byte(s) at {:#x} is out of bounds", size, addr)
      }
      RunError::DivisionByZero(inst) => write!(fmt, "division by zero: {}", inst),
      RunError::StepLimit => write!(fmt, "step limit reached"),
      RunError::UnknownCallee(name) => write!(fmt, "call to unknown function @{}", name),
      RunError::NoReturn(name) => write!(fmt, "call to @{} does not return", name),
      RunError::OutOfMemory => write!(fmt, "out of memory"),
      RunError::Malformed(msg) => write!(fmt, "malformed function: {}", msg),
      RunError::ScopeViolation { addr, inst } => {
        write!(fmt, "{} touches {:#x}, which a disjoint scope touched", inst, addr)
      }
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
  pub ret_value: Option<i64>,
  /// All allocated memory, from `MEM_BASE` on.
  pub memory: Vec<u8>,
  pub num_steps: u64,
  /// Loads and stores executed that carry alias scope metadata.
  pub tagged_accesses: u64,
}

//=============================================================================
// Alias scope checking

/// Names of the versioning guard blocks, per function.
pub type Guards = FxHashMap<String, FxHashSet<String>>;

/// The guard blocks `report` lists.
pub fn guards_of(report: &ModuleReport) -> Guards {
  let mut guards = Guards::default();
  for f in &report.functions {
    for v in &f.versioned {
      guards.entry(f.name.clone()).or_default().insert(v.guard.clone());
    }
  }
  guards
}

// Bytes touched under each scope, per call frame.
type Footprints = FxHashMap<ScopeIx, FxHashSet<i64>>;

fn note_access(
  fp: &mut Footprints, f: &Func, i: InstIx, addr: i64, size: u32,
) -> Result<(), RunError> {
  let data = &f.insts[i];
  let bytes = addr..addr.wrapping_add(size as i64);
  for s in data.noalias.iter() {
    if let Some(touched) = fp.get(s) {
      if let Some(a) = bytes.clone().find(|a| touched.contains(a)) {
        return Err(RunError::ScopeViolation { addr: a, inst: f.display_inst(i) });
      }
    }
  }
  for s in data.alias_scopes.iter() {
    fp.entry(*s).or_insert_with(FxHashSet::default).extend(bytes.clone());
  }
  Ok(())
}

//=============================================================================
// Interpreter state

struct IState<'a> {
  module: &'a Module,
  guards: &'a Guards,
  mem: Vec<u8>,
  globals: Map<String, i64>,
  n_steps: u64,
  max_steps: u64,
  n_tagged: u64,
  rand_state: u64,
  depth: u32,
}

// Byte `k` of a fresh array.
fn pattern_byte(k: usize) -> u8 {
  (k.wrapping_mul(31).wrapping_add(7) % 251) as u8
}

impl<'a> IState<'a> {
  fn new(module: &'a Module, guards: &'a Guards, max_steps: u64) -> Self {
    IState {
      module,
      guards,
      mem: Vec::new(),
      globals: Map::default(),
      n_steps: 0,
      max_steps,
      n_tagged: 0,
      rand_state: 0x2545_f491,
      depth: 0,
    }
  }

  // Allocates `size` bytes, 8-aligned and followed by an 8-byte gap, and
  // returns their address.
  fn alloc(&mut self, size: u64, pattern: bool) -> Result<i64, RunError> {
    let start = (self.mem.len() + 7) & !7;
    let end = start as u64 + size;
    if end + 8 > MAX_MEM as u64 {
      return Err(RunError::OutOfMemory);
    }
    self.mem.resize(start, 0);
    for k in 0..size as usize {
      self.mem.push(if pattern { pattern_byte(start + k) } else { 0 });
    }
    self.mem.resize(end as usize + 8, 0);
    Ok(MEM_BASE + start as i64)
  }

  fn check_addr(&self, addr: i64, size: u32) -> Result<usize, RunError> {
    let off = addr.wrapping_sub(MEM_BASE);
    if off < 0 || (off as u64).saturating_add(size as u64) > self.mem.len() as u64 {
      return Err(RunError::OutOfBounds { addr, size });
    }
    Ok(off as usize)
  }

  fn get_mem(&self, addr: i64, ty: Type) -> Result<i64, RunError> {
    let size = ty.store_size();
    let off = self.check_addr(addr, size)?;
    let mut v: u64 = 0;
    for k in (0..size as usize).rev() {
      v = (v << 8) | self.mem[off + k] as u64;
    }
    Ok(normalize(v as i64, ty.bits()))
  }

  fn set_mem(&mut self, addr: i64, ty: Type, v: i64) -> Result<(), RunError> {
    let size = ty.store_size();
    let off = self.check_addr(addr, size)?;
    let mut v = v as u64;
    for k in 0..size as usize {
      self.mem[off + k] = v as u8;
      v >>= 8;
    }
    Ok(())
  }

  fn memcpy(&mut self, dst: i64, src: i64, len: i64) -> Result<(), RunError> {
    if len <= 0 {
      return Ok(());
    }
    let len32 = if len > u32::MAX as i64 { u32::MAX } else { len as u32 };
    let d = self.check_addr(dst, len32)?;
    let s = self.check_addr(src, len32)?;
    self.mem.copy_within(s..s + len as usize, d);
    Ok(())
  }

  fn global_addr(&mut self, name: &str) -> Result<i64, RunError> {
    if let Some(addr) = self.globals.get(name) {
      return Ok(*addr);
    }
    let size = match self.module.find_global(name) {
      Some(g) => g.elem_ty.store_size() as u64 * g.count as u64,
      None => return Err(RunError::Malformed(format!("unknown global @{}", name))),
    };
    let addr = self.alloc(size, true)?;
    self.globals.insert(name.to_string(), addr);
    Ok(addr)
  }

  fn rand(&mut self) -> i64 {
    self.rand_state =
      self.rand_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    ((self.rand_state >> 33) & 0x7fff_ffff) as i64
  }

  // Library functions the analyses know about.
  fn call_builtin(
    &mut self, name: &str, args: &[i64], ret_ty: Type,
  ) -> Result<Option<i64>, RunError> {
    let arg = |n: usize| args.get(n).cloned().unwrap_or(0);
    let res = match name {
      "abs" => arg(0).wrapping_abs(),
      "sqrt" => {
        let x = arg(0);
        if x <= 0 {
          0
        } else {
          let mut r = (x as f64).sqrt() as i64;
          while r * r > x {
            r -= 1;
          }
          while (r + 1).checked_mul(r + 1).map_or(false, |s| s <= x) {
            r += 1;
          }
          r
        }
      }
      "rand" => self.rand(),
      "memcpy" => {
        self.memcpy(arg(0), arg(1), arg(2))?;
        arg(0)
      }
      _ => return Err(RunError::UnknownCallee(name.to_string())),
    };
    if ret_ty == Type::Void {
      Ok(None)
    } else {
      Ok(Some(normalize(res, ret_ty.effective().bits())))
    }
  }

  fn call(
    &mut self, callee: &str, args: &[i64], ret_ty: Type,
  ) -> Result<Option<i64>, RunError> {
    let module = self.module;
    match module.find_func(callee) {
      Some(f) if !f.is_declaration => {
        if self.depth >= MAX_CALL_DEPTH {
          return Err(RunError::StepLimit);
        }
        self.depth += 1;
        let res = self.run_func_wrk(f, args);
        self.depth -= 1;
        res
      }
      _ => self.call_builtin(callee, args, ret_ty),
    }
  }

  //---------------------------------------------------------------------------
  // Execution

  fn run_func_wrk(&mut self, f: &Func, args: &[i64]) -> Result<Option<i64>, RunError> {
    let mut vals = Map::<ValueIx, i64>::default();
    let mut footprints = Footprints::default();
    let all_guards: &'a Guards = self.guards;
    let guards = all_guards.get(&f.name);
    let mut prev: Option<BlockIx> = None;
    let mut b = match f.entry_block() {
      Some(b) => b,
      None => return Err(RunError::Malformed(format!("@{} has no blocks", f.name))),
    };

    loop {
      if guards.map_or(false, |g| g.contains(f.block_name(b))) {
        trace!("run_func_wrk: @{}: new pass at {}", f.name, f.block_name(b));
        footprints.clear();
      }

      // Phis read their inputs simultaneously.
      let phis = f.phis(b);
      if !phis.is_empty() {
        let from = match prev {
          Some(p) => p,
          None => return Err(RunError::Malformed("phi in the entry block".to_string())),
        };
        let mut updates = vec![];
        for phi in &phis {
          let v = match f.kind(*phi) {
            InstKind::Phi { incoming } => match incoming.iter().find(|(ib, _)| *ib == from) {
              Some((_, v)) => *v,
              None => {
                return Err(RunError::Malformed(format!(
                  "{} has no input from {}",
                  f.display_inst(*phi),
                  f.block_name(from)
                )))
              }
            },
            _ => continue,
          };
          updates.push((f.inst_result(*phi), self.get_value(f, &vals, args, v)?));
        }
        self.n_steps += phis.len() as u64;
        for (res, v) in updates {
          vals.insert(res, v);
        }
      }

      let mut next = None;
      for i in &f.block_insts(b)[phis.len()..] {
        self.n_steps += 1;
        if self.n_steps > self.max_steps {
          return Err(RunError::StepLimit);
        }
        let data = &f.insts[*i];
        let res_ty = data.result.map(|r| f.value_ty(r)).unwrap_or(Type::Void);
        let get = |st: &mut IState, v: ValueIx| st.get_value(f, &vals, args, v);
        let result = match &data.kind {
          InstKind::Binary { op, args: ops } => {
            let a = get(self, ops[0])?;
            let c = get(self, ops[1])?;
            match op.calc(a, c, res_ty.effective().bits()) {
              Some(r) => Some(r),
              None => return Err(RunError::DivisionByZero(f.display_inst(*i))),
            }
          }
          InstKind::Icmp { cc, args: ops } => {
            let a = get(self, ops[0])?;
            let c = get(self, ops[1])?;
            let bits = f.value_ty(ops[0]).effective().bits();
            Some(cc.calc(a, c, bits) as i64)
          }
          InstKind::Select { args: ops } => {
            if get(self, ops[0])? & 1 != 0 {
              Some(get(self, ops[1])?)
            } else {
              Some(get(self, ops[2])?)
            }
          }
          InstKind::Cast { op, arg } => {
            let a = get(self, *arg)?;
            Some(op.apply(a, f.value_ty(*arg), res_ty))
          }
          InstKind::Gep { base, index } => {
            let p = get(self, *base)?;
            let ix = get(self, *index)?;
            let size = f.value_ty(*base).elem_size().unwrap_or(1) as i64;
            Some(p.wrapping_add(ix.wrapping_mul(size)))
          }
          InstKind::Load { ptr } => {
            if !data.alias_scopes.is_empty() {
              self.n_tagged += 1;
            }
            let p = get(self, *ptr)?;
            let v = self.get_mem(p, res_ty)?;
            note_access(&mut footprints, f, *i, p, res_ty.store_size())?;
            Some(v)
          }
          InstKind::Store { ptr, value } => {
            if !data.alias_scopes.is_empty() {
              self.n_tagged += 1;
            }
            let p = get(self, *ptr)?;
            let v = get(self, *value)?;
            self.set_mem(p, f.value_ty(*value), v)?;
            note_access(&mut footprints, f, *i, p, f.value_ty(*value).store_size())?;
            None
          }
          InstKind::Alloca { count } => {
            let size = res_ty.elem_size().unwrap_or(1) as u64 * *count as u64;
            Some(self.alloc(size, false)?)
          }
          InstKind::Call { callee, args: ops, attrs } => {
            if attrs.no_return {
              return Err(RunError::NoReturn(callee.clone()));
            }
            let mut vs = vec![];
            for o in ops {
              vs.push(get(self, *o)?);
            }
            self.call(callee, &vs, res_ty)?
          }
          InstKind::Phi { .. } => {
            return Err(RunError::Malformed(format!(
              "{}: phi after a non-phi instruction",
              f.block_name(b)
            )))
          }
          InstKind::Jump { dest } => {
            next = Some(*dest);
            None
          }
          InstKind::Branch { cond, dests } => {
            let c = get(self, *cond)?;
            next = Some(if c & 1 != 0 { dests[0] } else { dests[1] });
            None
          }
          InstKind::Return { value } => {
            return match value {
              Some(v) => Ok(Some(get(self, *v)?)),
              None => Ok(None),
            };
          }
        };
        if let (Some(r), Some(v)) = (data.result, result) {
          vals.insert(r, v);
        }
      }

      match next {
        Some(n) => {
          prev = Some(b);
          b = n;
        }
        None => {
          return Err(RunError::Malformed(format!(
            "{} is not terminated",
            f.block_name(b)
          )))
        }
      }
    }
  }

  fn get_value(
    &mut self, f: &Func, vals: &Map<ValueIx, i64>, args: &[i64], v: ValueIx,
  ) -> Result<i64, RunError> {
    match &f.values[v].def {
      ValueDef::Param(n) => match args.get(*n as usize) {
        Some(a) => Ok(*a),
        None => Err(RunError::Malformed(format!("missing argument {}", n))),
      },
      ValueDef::Const(c) => Ok(*c),
      ValueDef::Global(name) => self.global_addr(name),
      ValueDef::Undef => Ok(0),
      ValueDef::Inst(_) => match vals.get(&v) {
        Some(x) => Ok(*x),
        None => Err(RunError::Malformed(format!(
          "read of {} before its definition",
          f.display_value(v)
        ))),
      },
    }
  }
}

//=============================================================================
// Entry points

/// Runs `func` on `args`.  Callees are looked up in `module`; calls to
/// `abs`, `sqrt`, `rand` and `memcpy` are handled internally when the module
/// does not define them.
///
/// Scope tags are checked over a whole call: use `run_versioned` for code
/// whose tags are only valid between two versioning guards.
pub fn run_func(
  module: &Module, func: &Func, who: &str, args: &[Arg],
) -> Result<RunResult, RunError> {
  run_func_with_limit(module, func, who, args, &Guards::default(), DEFAULT_MAX_STEPS)
}

/// Runs `func` as transformed by `run_on_module`, which reported `report`.
pub fn run_versioned(
  module: &Module, func: &Func, who: &str, args: &[Arg], report: &ModuleReport,
) -> Result<RunResult, RunError> {
  let guards = guards_of(report);
  run_func_with_limit(module, func, who, args, &guards, DEFAULT_MAX_STEPS)
}

pub fn run_func_with_limit(
  module: &Module, func: &Func, who: &str, args: &[Arg], guards: &Guards,
  max_steps: u64,
) -> Result<RunResult, RunError> {
  let mut istate = IState::new(module, guards, max_steps);
  // Globals first, so that where they live does not depend on when a run
  // first touches them.
  for g in &module.globals {
    istate.global_addr(&g.name)?;
  }
  if args.len() != func.params.len() {
    return Err(RunError::Malformed(format!(
      "@{} takes {} argument(s), {} given",
      func.name,
      func.params.len(),
      args.len()
    )));
  }

  let mut vals: Vec<i64> = Vec::with_capacity(args.len());
  for (n, arg) in args.iter().enumerate() {
    let ty = func.value_ty(func.params[n]);
    let v = match arg {
      Arg::Int(x) => normalize(*x, ty.effective().bits()),
      Arg::Array { len } => {
        let size = ty.elem_size().unwrap_or(1) as u64 * *len as u64;
        istate.alloc(size, true)?
      }
      Arg::Alias { of, offset } => {
        let base = match vals.get(*of) {
          Some(b) => *b,
          None => {
            return Err(RunError::Malformed(format!(
              "argument {} aliases a later argument",
              n
            )))
          }
        };
        let size = func.value_ty(func.params[*of]).elem_size().unwrap_or(1) as i64;
        base.wrapping_add(offset.wrapping_mul(size))
      }
    };
    vals.push(v);
  }

  let ret_value = istate.run_func_wrk(func, &vals)?;
  debug!(
    "run_func: {}: @{} done in {} steps, {} tagged access(es)",
    who, func.name, istate.n_steps, istate.n_tagged
  );
  Ok(RunResult {
    ret_value,
    memory: istate.mem,
    num_steps: istate.n_steps,
    tagged_accesses: istate.n_tagged,
  })
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::parser::parse_content;
  use crate::test_cases::find_test;
  use restrictify::{run_on_module, BasicAliasOracle, Options};
  use Arg::{Alias, Array, Int};

  // Reads A[i + 1] into A[i].  The two accesses are disjoint within one
  // iteration but not across iterations.
  const STEP: &str = r#"
func @step(%A: ptr<4>, %n: i64) -> void {
entry:
  jump guard
guard:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %i.next = add i64 %i, 1
  %pn = gep %A, i64 %i.next
  %v = load i32 %pn !alias.scope(1) !noalias(0)
  %pa = gep %A, i64 %i
  store i32 %v, %pa !alias.scope(0) !noalias(1)
  jump guard
exit:
  ret
}
"#;

  #[test]
  fn scopes_are_checked_within_a_pass() {
    let module = parse_content(STEP).unwrap();
    let f = module.find_func("step").unwrap();
    let args = vec![Array { len: 8 }, Int(7)];

    // Without guards the whole call is one pass: the store to A[1] hits the
    // byte the first load read.
    match run_func(&module, f, "one pass", &args) {
      Err(RunError::ScopeViolation { addr, .. }) => assert_eq!(addr, MEM_BASE + 4),
      other => panic!("unexpected {:?}", other),
    }

    let mut guards = Guards::default();
    guards.entry("step".to_string()).or_default().insert("guard".to_string());
    let res = run_func_with_limit(&module, f, "per iteration", &args, &guards, 1000).unwrap();
    assert_eq!(res.tagged_accesses, 14);
  }

  #[test]
  fn forcing_the_tagged_copy_on_overlapping_arrays_fails() {
    let _ = pretty_env_logger::try_init();
    let case = find_test("copy").unwrap();
    let mut module = case.module.clone();
    let report = run_on_module(&mut module, &BasicAliasOracle, &Options::default()).unwrap();
    let copy = report.functions.iter().find(|f| f.name == "copy").unwrap();
    assert_eq!(copy.versioned.len(), 1);
    let guards = guards_of(&report);
    assert!(guards["copy"].contains(&copy.versioned[0].guard));

    let disjoint = vec![Array { len: 100 }, Array { len: 100 }, Int(100)];
    let shifted = vec![Array { len: 100 }, Alias { of: 0, offset: 1 }, Int(50)];
    let f = module.find_func("copy").unwrap();
    let res = run_versioned(&module, f, "checked", &disjoint, &report).unwrap();
    assert_eq!(res.tagged_accesses, 200);
    let res = run_versioned(&module, f, "checked", &shifted, &report).unwrap();
    assert_eq!(res.tagged_accesses, 0);

    // Take the tagged side whatever the check says.
    let f = module.funcs.iter_mut().find(|f| f.name == "copy").unwrap();
    let guard = f.block_by_name(&copy.versioned[0].guard).unwrap();
    let term = f.terminator(guard).unwrap();
    let yes = f.iconst(Type::I1, 1);
    match &mut f.insts[term].kind {
      InstKind::Branch { cond, .. } => *cond = yes,
      other => panic!("guard ends in {:?}", other),
    }
    let f = module.find_func("copy").unwrap();
    assert!(run_versioned(&module, f, "forced", &disjoint, &report).is_ok());
    match run_versioned(&module, f, "forced", &shifted, &report) {
      Err(RunError::ScopeViolation { .. }) => {}
      other => panic!("unexpected {:?}", other),
    }
  }
}
