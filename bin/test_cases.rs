/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function
/// |all_tests|.  Add new ones there, or drop a `.rfy` file into `tests/`.
use std::path::{Path, PathBuf};

use restrictify::{Func, Module, Type};

use crate::parser;
use crate::test_framework::Arg;
use crate::test_framework::Arg::{Alias, Array, Int};

use self::PathExpect::*;

/// Which copy of a versioned region a run should go through.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PathExpect {
  /// The ranges are disjoint: the tagged original runs, if anything was
  /// versioned.
  Tagged,
  /// The ranges overlap, or the region is not entered: no tagged access
  /// runs.
  Untagged,
  /// The checked pointers do not decide the path.
  Either,
}

/// Arguments to run a test function with.
#[derive(Clone, Debug)]
pub struct Layout {
  pub name: &'static str,
  pub args: Vec<Arg>,
  pub expect: PathExpect,
}

fn layout(name: &'static str, args: Vec<Arg>, expect: PathExpect) -> Layout {
  Layout { name, args, expect }
}

#[derive(Clone, Debug)]
pub struct TestCase {
  pub name: String,
  pub module: Module,
  /// The function to run.
  pub entry: String,
  pub layouts: Vec<Layout>,
}

fn test_case(name: &str, source: &str, layouts: Vec<Layout>) -> TestCase {
  let module = match parser::parse_content(source) {
    Ok(m) => m,
    Err(e) => panic!("test case {} does not parse: {}", name, e.to_string()),
  };
  TestCase { name: name.to_string(), module, entry: name.to_string(), layouts }
}

/// A[i] = B[i]
fn test_copy() -> TestCase {
  test_case(
    "copy",
    r#"
func @copy(%A: ptr<4>, %B: ptr<4>, %n: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pb = gep %B, i64 %i
  %v = load i32 %pb
  %pa = gep %A, i64 %i
  store i32 %v, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 100 }, Array { len: 100 }, Int(100)], Tagged),
      layout("shifted", vec![Array { len: 100 }, Alias { of: 0, offset: 1 }, Int(50)], Untagged),
      layout("same", vec![Array { len: 100 }, Alias { of: 0, offset: 0 }, Int(100)], Untagged),
      layout("empty", vec![Array { len: 1 }, Array { len: 1 }, Int(0)], Untagged),
    ],
  )
}

/// Y[i] = a * X[i] + Y[i]
fn test_saxpy() -> TestCase {
  test_case(
    "saxpy",
    r#"
func @saxpy(%X: ptr<4>, %Y: ptr<4>, %a: i32, %n: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %px = gep %X, i64 %i
  %x = load i32 %px
  %py = gep %Y, i64 %i
  %y = load i32 %py
  %ax = mul i32 %a, %x
  %r = add i32 %ax, %y
  store i32 %r, %py
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 64 }, Array { len: 64 }, Int(3), Int(64)], Tagged),
      layout(
        "overlapping",
        vec![Array { len: 64 }, Alias { of: 0, offset: 7 }, Int(-2), Int(40)],
        Untagged,
      ),
    ],
  )
}

/// s += A[i]; B[i] = s; return s
fn test_prefix_sum() -> TestCase {
  test_case(
    "prefix_sum",
    r#"
func @prefix_sum(%A: ptr<4>, %B: ptr<4>, %n: i64) -> i32 {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %s = phi i32 [0, entry], [%s.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pa = gep %A, i64 %i
  %a = load i32 %pa
  %s.next = add i32 %s, %a
  %pb = gep %B, i64 %i
  store i32 %s.next, %pb
  %i.next = add i64 %i, 1
  jump head
exit:
  ret i32 %s
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 32 }, Array { len: 32 }, Int(32)], Tagged),
      layout("in_place", vec![Array { len: 32 }, Alias { of: 0, offset: 0 }, Int(32)], Untagged),
      layout("ahead", vec![Array { len: 32 }, Alias { of: 0, offset: 1 }, Int(31)], Untagged),
    ],
  )
}

/// A[i] = B[i + m]
fn test_shifted() -> TestCase {
  test_case(
    "shifted",
    r#"
func @shifted(%A: ptr<8>, %B: ptr<8>, %n: i64, %m: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %im = add i64 %i, %m
  %pb = gep %B, i64 %im
  %v = load i64 %pb
  %pa = gep %A, i64 %i
  store i64 %v, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 50 }, Array { len: 60 }, Int(50), Int(10)], Tagged),
      layout("self", vec![Array { len: 60 }, Alias { of: 0, offset: 0 }, Int(50), Int(10)], Untagged),
      layout("back", vec![Array { len: 60 }, Alias { of: 0, offset: 20 }, Int(30), Int(-15)], Untagged),
    ],
  )
}

/// for (i = n - 1; i >= 0; i--) A[i] = B[i + 1]
fn test_reverse() -> TestCase {
  test_case(
    "reverse",
    r#"
func @reverse(%A: ptr<4>, %B: ptr<4>, %n: i64) -> void {
entry:
  %start = sub i64 %n, 1
  jump head
head:
  %i = phi i64 [%start, entry], [%i.next, body]
  %cmp = icmp sge i64 %i, 0
  br %cmp, body, exit
body:
  %i1 = add i64 %i, 1
  %pb = gep %B, i64 %i1
  %v = load i32 %pb
  %pa = gep %A, i64 %i
  store i32 %v, %pa
  %i.next = sub i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 100 }, Array { len: 101 }, Int(100)], Tagged),
      layout("same", vec![Array { len: 100 }, Alias { of: 0, offset: 0 }, Int(99)], Untagged),
    ],
  )
}

/// C[i * m + j] = A[i * m + j] + B[j]
fn test_matadd() -> TestCase {
  test_case(
    "matadd",
    r#"
func @matadd(%C: ptr<4>, %A: ptr<4>, %B: ptr<4>, %n: i64, %m: i64) -> void {
entry:
  jump outer
outer:
  %i = phi i64 [0, entry], [%i.next, latch]
  %ci = icmp slt i64 %i, %n
  br %ci, pre, exit
pre:
  %row = mul i64 %i, %m
  jump inner
inner:
  %j = phi i64 [0, pre], [%j.next, body]
  %cj = icmp slt i64 %j, %m
  br %cj, body, latch
body:
  %k = add i64 %row, %j
  %pa = gep %A, i64 %k
  %a = load i32 %pa
  %pb = gep %B, i64 %j
  %b = load i32 %pb
  %s = add i32 %a, %b
  %pc = gep %C, i64 %k
  store i32 %s, %pc
  %j.next = add i64 %j, 1
  jump inner
latch:
  %i.next = add i64 %i, 1
  jump outer
exit:
  ret
}
"#,
    vec![
      layout(
        "disjoint",
        vec![Array { len: 64 }, Array { len: 64 }, Array { len: 8 }, Int(8), Int(8)],
        Tagged,
      ),
      layout(
        "in_place",
        vec![Array { len: 64 }, Alias { of: 0, offset: 0 }, Alias { of: 0, offset: 3 }, Int(4), Int(8)],
        Untagged,
      ),
    ],
  )
}

/// A[idx[i] & 15] = B[i]
fn test_scatter() -> TestCase {
  test_case(
    "scatter",
    r#"
func @scatter(%A: ptr<4>, %B: ptr<4>, %idx: ptr<8>, %n: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pi = gep %idx, i64 %i
  %k = load i64 %pi
  %km = and i64 %k, 15
  %pb = gep %B, i64 %i
  %v = load i32 %pb
  %pa = gep %A, i64 %km
  store i32 %v, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 16 }, Array { len: 32 }, Array { len: 32 }, Int(32)], Tagged),
      layout(
        "overlapping",
        vec![Array { len: 16 }, Alias { of: 0, offset: 0 }, Array { len: 16 }, Int(16)],
        Either,
      ),
    ],
  )
}

/// A[i] = sqrt(abs(B[i]))
fn test_roots() -> TestCase {
  test_case(
    "roots",
    r#"
declare @abs(%a0: i64) -> i64
declare @sqrt(%a0: i64) -> i64

func @roots(%A: ptr<8>, %B: ptr<8>, %n: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pb = gep %B, i64 %i
  %x = load i64 %pb
  %ax = call i64 @abs(i64 %x)
  %r = call i64 @sqrt(i64 %ax)
  %pa = gep %A, i64 %i
  store i64 %r, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 40 }, Array { len: 40 }, Int(40)], Tagged),
      layout("same", vec![Array { len: 40 }, Alias { of: 0, offset: 0 }, Int(40)], Untagged),
    ],
  )
}

/// A[i] = B[i], counting iterations in a global through a call.
fn test_ticking_copy() -> TestCase {
  test_case(
    "ticking_copy",
    r#"
global @counter: i64 x 1

func @tick(%x: i64) -> i64 {
entry:
  %c = load i64 @counter
  %c1 = add i64 %c, %x
  store i64 %c1, @counter
  ret i64 %c1
}

func @ticking_copy(%A: ptr<4>, %B: ptr<4>, %n: i64) -> i64 {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %t = call i64 @tick(i64 1)
  %pb = gep %B, i64 %i
  %v = load i32 %pb
  %pa = gep %A, i64 %i
  store i32 %v, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  %total = load i64 @counter
  ret i64 %total
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 20 }, Array { len: 20 }, Int(20)], Tagged),
      layout("shifted", vec![Array { len: 20 }, Alias { of: 0, offset: 2 }, Int(18)], Untagged),
    ],
  )
}

/// A[i] = table[i] + 1
fn test_from_table() -> TestCase {
  test_case(
    "from_table",
    r#"
global @table: i32 x 64

func @from_table(%A: ptr<4>, %n: i64) -> void {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pt = gep @table, i64 %i
  %v = load i32 %pt
  %v1 = add i32 %v, 1
  %pa = gep %A, i64 %i
  store i32 %v1, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![layout("disjoint", vec![Array { len: 64 }, Int(64)], Tagged)],
  )
}

/// if (n > 0) do { A[i] = B[i] << 1 } while (++i < n); return i
fn test_guarded() -> TestCase {
  test_case(
    "guarded",
    r#"
func @guarded(%A: ptr<8>, %B: ptr<8>, %n: i64) -> i64 {
entry:
  %pos = icmp sgt i64 %n, 0
  br %pos, loop, done
loop:
  %i = phi i64 [0, entry], [%i.next, loop]
  %pb = gep %B, i64 %i
  %b = load i64 %pb
  %b2 = shl i64 %b, 1
  %pa = gep %A, i64 %i
  store i64 %b2, %pa
  %i.next = add i64 %i, 1
  %more = icmp slt i64 %i.next, %n
  br %more, loop, done
done:
  %r = phi i64 [0, entry], [%i.next, loop]
  ret i64 %r
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 30 }, Array { len: 30 }, Int(30)], Tagged),
      layout("same", vec![Array { len: 30 }, Alias { of: 0, offset: 0 }, Int(30)], Untagged),
      layout("none", vec![Array { len: 1 }, Array { len: 1 }, Int(-4)], Untagged),
    ],
  )
}

/// T[i % 16] = A[i]; B[i] = T[i % 16] ^ 5, with T on the stack.
fn test_staged() -> TestCase {
  test_case(
    "staged",
    r#"
func @staged(%A: ptr<4>, %B: ptr<4>, %n: i64) -> void {
entry:
  %T = alloca i32 x 16
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %k = urem i64 %i, 16
  %pa = gep %A, i64 %i
  %a = load i32 %pa
  %pt = gep %T, i64 %k
  store i32 %a, %pt
  %t = load i32 %pt
  %t1 = xor i32 %t, 5
  %pb = gep %B, i64 %i
  store i32 %t1, %pb
  %i.next = add i64 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 48 }, Array { len: 48 }, Int(48)], Tagged),
      layout("same", vec![Array { len: 48 }, Alias { of: 0, offset: 0 }, Int(48)], Untagged),
    ],
  )
}

/// A[i] = min(sext(B[i]), lim), with a 32-bit induction variable.
fn test_clamp() -> TestCase {
  test_case(
    "clamp",
    r#"
func @clamp(%A: ptr<4>, %B: ptr<2>, %n: i32, %lim: i32) -> void {
entry:
  jump head
head:
  %i = phi i32 [0, entry], [%i.next, body]
  %cmp = icmp slt i32 %i, %n
  br %cmp, body, exit
body:
  %ix = sext i32 %i to i64
  %pb = gep %B, i64 %ix
  %b = load i16 %pb
  %bw = sext i16 %b to i32
  %big = icmp sgt i32 %bw, %lim
  %c = select i32 %big, %lim, %bw
  %pa = gep %A, i64 %ix
  store i32 %c, %pa
  %i.next = add i32 %i, 1
  jump head
exit:
  ret
}
"#,
    vec![
      layout("disjoint", vec![Array { len: 24 }, Array { len: 24 }, Int(24), Int(1000)], Tagged),
      layout("same", vec![Array { len: 24 }, Alias { of: 0, offset: 0 }, Int(24), Int(1000)], Untagged),
    ],
  )
}

// Arguments for functions read from files: a 64-element array for every
// pointer, 16 for every integer.
fn default_layout(func: &Func) -> Layout {
  let args = func
    .params
    .iter()
    .map(|p| match func.value_ty(*p) {
      Type::Ptr(_) => Array { len: 64 },
      _ => Int(16),
    })
    .collect();
  layout("default", args, Either)
}

/// Reads a test case from a file.  Without an `entry`, the last function
/// defined in the file is run.
pub fn test_from_file(path: PathBuf, entry: Option<&str>) -> Result<TestCase, String> {
  let name = match path.file_stem().and_then(|s| s.to_str()) {
    Some(stem) => stem.to_string(),
    None => return Err(format!("bad file name {}", path.display())),
  };
  let module = parser::parse_file(path).map_err(|e| e.to_string())?;
  let func = match entry {
    Some(entry) => module.find_func(entry),
    None => module.funcs.iter().rev().find(|f| !f.is_declaration),
  };
  let func = match func {
    Some(f) => f,
    None => return Err(format!("no function @{} to run", entry.unwrap_or(&name))),
  };
  let layouts = vec![default_layout(func)];
  let entry = func.name.clone();
  Ok(TestCase { name, module, entry, layouts })
}

pub fn all_tests() -> Vec<TestCase> {
  vec![
    test_copy(),
    test_saxpy(),
    test_prefix_sum(),
    test_shifted(),
    test_reverse(),
    test_matadd(),
    test_scatter(),
    test_roots(),
    test_ticking_copy(),
    test_from_table(),
    test_guarded(),
    test_staged(),
    test_clamp(),
  ]
}

pub fn find_test(name: &str) -> Result<TestCase, Vec<String>> {
  let mut all_names = Vec::new();
  for cand in all_tests() {
    if cand.name == name {
      return Ok(cand);
    }
    all_names.push(cand.name);
  }

  fn ends_in_tilde(path: &PathBuf) -> bool {
    match path.to_str() {
      Some(s) => s.ends_with('~'),
      None => false,
    }
  }

  let test_dir = Path::new("tests");
  match test_dir.read_dir() {
    Err(err) => {
      println!("can't read test directory: {}", err);
    }
    Ok(entries) => {
      for entry in entries.flatten() {
        let path = entry.path();
        // Skip editor backup files.
        if ends_in_tilde(&path) {
          continue;
        }
        let basename = match path.file_stem().and_then(|s| s.to_str()) {
          Some(b) => b.to_string(),
          None => continue,
        };
        if basename != name {
          all_names.push(basename);
          continue;
        }
        match test_from_file(path, Some(name)) {
          Ok(case) => return Ok(case),
          Err(msg) => panic!("bad test file {}: {}", name, msg),
        }
      }
    }
  }

  all_names.sort();
  Err(all_names)
}
