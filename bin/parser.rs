/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parser for the textual form of the IR, as printed by `Module`'s and
//! `Func`'s `Display` implementations.
//!
//! ```text
//! global @g: i32 x 16
//! declare @sqrt(%a0: i64) -> i64
//! func @copy(%A: ptr<4> noalias, %B: ptr<4>, %n: i64) -> void {
//! entry:
//!   jump head
//! head:
//!   %i = phi i64 [0, entry], [%i.next, body]   ; forward reference
//!   ...
//! }
//! ```

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::iter::Peekable;
use std::path::PathBuf;
use std::str::CharIndices;

use restrictify::{
  BinOp, BlockIx, CallAttrs, CastOp, Func, GlobalDecl, InstIx, InstKind, IntCC,
  Map, Module, ScopeIx, Type, ValueIx,
};

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse(String),
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

impl ToString for ParseError {
  fn to_string(&self) -> String {
    match self {
      ParseError::IoError(err) => format!("i/o error: {}", err),
      ParseError::Parse(msg) => msg.clone(),
    }
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_file(path: PathBuf) -> ParseResult<Module> {
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  parse_content(&content)
}

pub fn parse_content(source: &str) -> ParseResult<Module> {
  let mut parser = Parser::new(source);
  let mut module = Module::new();
  while !parser.is_done() {
    let keyword = parser.read_ident()?;
    match keyword.as_str() {
      "global" => {
        let global = parser.read_global()?;
        module.globals.push(global);
      }
      "declare" => {
        let (name, params, ret_ty) = parser.read_signature()?;
        let tys: Vec<Type> = params.iter().map(|p| p.ty).collect();
        let mut func = Func::new_declaration(&name, ret_ty, &tys);
        for (v, p) in func.params.clone().iter().zip(params.iter()) {
          if p.noalias {
            func.set_noalias(*v);
          }
        }
        module.funcs.push(func);
      }
      "func" => {
        let parsed = parser.read_func()?;
        let func = lower_func(&module, parsed)?;
        module.funcs.push(func);
      }
      _ => return parser.error("expected global, declare or func"),
    }
  }
  Ok(module)
}

//=============================================================================
// Syntax tree

#[derive(Clone, Debug)]
enum Operand {
  Local(String),
  Global(String),
  Const(i64),
  Undef,
}

#[derive(Clone, Debug)]
enum ParsedKind {
  Binary(BinOp, Operand, Operand),
  Icmp(IntCC, Type, Operand, Operand),
  Select(Operand, Operand, Operand),
  Cast(CastOp, Type, Operand),
  Gep(Operand, Type, Operand),
  Load(Operand),
  Store(Type, Operand, Operand),
  Alloca(u32),
  Call(String, Vec<(Type, Operand)>, CallAttrs),
  Phi(Vec<(Operand, String)>),
  Jump(String),
  Branch(Operand, String, String),
  Return(Option<(Type, Operand)>),
}

#[derive(Clone, Debug)]
struct ParsedInst {
  result: Option<String>,
  /// Result type; `Void` for gep, whose result has the type of its base.
  ty: Type,
  kind: ParsedKind,
  scopes: Vec<u32>,
  noalias: Vec<u32>,
  line: usize,
}

struct ParsedParam {
  name: String,
  ty: Type,
  noalias: bool,
}

struct ParsedFunc {
  name: String,
  params: Vec<ParsedParam>,
  ret_ty: Type,
  blocks: Vec<(String, Vec<ParsedInst>)>,
}

//=============================================================================
// Lexing and parsing

struct Parser<'str> {
  iter: Peekable<CharIndices<'str>>,
  line: usize,
}

impl<'str> Parser<'str> {
  fn new(source: &'str str) -> Self {
    Self { iter: source.char_indices().peekable(), line: 1 }
  }

  fn peek(&mut self) -> Option<char> {
    self.iter.peek().map(|(_, c)| *c)
  }

  fn advance(&mut self) -> Option<char> {
    let c = self.iter.next().map(|(_, c)| c);
    if c == Some('\n') {
      self.line += 1;
    }
    c
  }

  fn skip_whitespace_and_comments(&mut self) {
    while let Some(c) = self.peek() {
      if c.is_whitespace() {
        self.advance();
      } else if c == ';' {
        // A comment runs until the end of the line.
        while let Some(c) = self.advance() {
          if c == '\n' {
            break;
          }
        }
      } else {
        break;
      }
    }
  }

  // Skips blanks, stopping at the end of the line.  Returns whether more
  // tokens follow on this line.
  fn more_on_this_line(&mut self) -> bool {
    while let Some(c) = self.peek() {
      if c == ' ' || c == '\t' || c == '\r' {
        self.advance();
      } else {
        return c != '\n' && c != ';' && c != '}';
      }
    }
    false
  }

  fn read_char(&mut self) -> ParseResult<char> {
    self.skip_whitespace_and_comments();
    match self.advance() {
      Some(c) => Ok(c),
      None => self.error("unexpected end of input"),
    }
  }

  fn try_read_char(&mut self, expected: char) -> bool {
    self.skip_whitespace_and_comments();
    if self.peek() == Some(expected) {
      self.advance();
      true
    } else {
      false
    }
  }

  fn expect_char(&mut self, expected: char) -> ParseResult<()> {
    let c = self.read_char()?;
    if c != expected {
      self.error(&format!("expected char '{}', got '{}'", expected, c))
    } else {
      Ok(())
    }
  }

  fn read_name_chars(&mut self) -> String {
    let mut res = String::new();
    while let Some(c) = self.peek() {
      if !is_name_char(c) {
        break;
      }
      res.push(c);
      self.advance();
    }
    res
  }

  fn try_read_ident(&mut self) -> Option<String> {
    self.skip_whitespace_and_comments();
    match self.peek() {
      Some(c) if is_alpha(c) => Some(self.read_name_chars()),
      _ => None,
    }
  }

  fn read_ident(&mut self) -> ParseResult<String> {
    match self.try_read_ident() {
      Some(ident) => Ok(ident),
      None => self.error("expected identifier or keyword"),
    }
  }

  fn expect_ident(&mut self, expected: &str) -> ParseResult<()> {
    let ident = self.read_ident()?;
    if ident != expected {
      self.error(&format!("expected '{}', got '{}'", expected, ident))
    } else {
      Ok(())
    }
  }

  // `%name` or `@name`.
  fn read_sigil_name(&mut self, sigil: char) -> ParseResult<String> {
    self.expect_char(sigil)?;
    let name = self.read_name_chars();
    if name.is_empty() {
      self.error(&format!("expected a name after '{}'", sigil))
    } else {
      Ok(name)
    }
  }

  fn try_read_int(&mut self) -> ParseResult<Option<i64>> {
    self.skip_whitespace_and_comments();
    let negative = match self.peek() {
      Some('-') => {
        self.advance();
        true
      }
      Some(c) if c.is_ascii_digit() => false,
      _ => return Ok(None),
    };
    let mut value: i128 = 0;
    let mut digits = 0;
    while let Some(c) = self.peek() {
      match c.to_digit(10) {
        Some(d) => {
          value = value * 10 + d as i128;
          if value > (i64::MAX as i128) + 1 {
            return self.error("integer literal out of range");
          }
          digits += 1;
          self.advance();
        }
        None => break,
      }
    }
    if digits == 0 {
      return self.error("expected digits after minus sign");
    }
    let value = if negative { -value } else { value };
    if value > i64::MAX as i128 {
      return self.error("integer literal out of range");
    }
    Ok(Some(value as i64))
  }

  fn read_int(&mut self) -> ParseResult<i64> {
    match self.try_read_int()? {
      Some(v) => Ok(v),
      None => self.error("expected integer"),
    }
  }

  fn read_u32(&mut self) -> ParseResult<u32> {
    let v = self.read_int()?;
    if v < 0 || v > u32::MAX as i64 {
      self.error("expected a non-negative 32-bit integer")
    } else {
      Ok(v as u32)
    }
  }

  fn type_from_ident(&mut self, ident: &str) -> ParseResult<Type> {
    if ident == "void" {
      return Ok(Type::Void);
    }
    if ident == "ptr" {
      if self.peek() == Some('<') {
        self.advance();
        let size = self.read_u32()?;
        self.expect_char('>')?;
        return Ok(Type::Ptr(Some(size)));
      }
      return Ok(Type::Ptr(None));
    }
    if let Some(bits) = ident.strip_prefix('i') {
      if let Ok(bits) = bits.parse::<u8>() {
        if bits >= 1 && bits <= 64 {
          return Ok(Type::Int(bits));
        }
      }
    }
    self.error(&format!("unknown type '{}'", ident))
  }

  fn read_type(&mut self) -> ParseResult<Type> {
    let ident = self.read_ident()?;
    self.type_from_ident(&ident)
  }

  fn read_operand(&mut self) -> ParseResult<Operand> {
    self.skip_whitespace_and_comments();
    match self.peek() {
      Some('%') => Ok(Operand::Local(self.read_sigil_name('%')?)),
      Some('@') => Ok(Operand::Global(self.read_sigil_name('@')?)),
      _ => {
        if let Some(v) = self.try_read_int()? {
          return Ok(Operand::Const(v));
        }
        match self.try_read_ident() {
          Some(ref ident) if ident == "undef" => Ok(Operand::Undef),
          _ => self.error("expected an operand"),
        }
      }
    }
  }

  fn read_typed_operand(&mut self) -> ParseResult<(Type, Operand)> {
    let ty = self.read_type()?;
    let op = self.read_operand()?;
    Ok((ty, op))
  }

  fn read_scope_list(&mut self) -> ParseResult<Vec<u32>> {
    self.expect_char('(')?;
    let mut res = vec![];
    if self.try_read_char(')') {
      return Ok(res);
    }
    loop {
      res.push(self.read_u32()?);
      if self.try_read_char(')') {
        return Ok(res);
      }
      self.expect_char(',')?;
    }
  }

  fn is_done(&mut self) -> bool {
    self.skip_whitespace_and_comments();
    self.peek().is_none()
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse(format!("error at line {}: {}", self.line, msg)))
  }

  //---------------------------------------------------------------------------
  // Top-level items

  // `@g: i32 x 16`, after the `global` keyword.
  fn read_global(&mut self) -> ParseResult<GlobalDecl> {
    let name = self.read_sigil_name('@')?;
    self.expect_char(':')?;
    let elem_ty = self.read_type()?;
    self.expect_ident("x")?;
    let count = self.read_u32()?;
    Ok(GlobalDecl { name, elem_ty, count })
  }

  // `@name(%a: ty [noalias], ...) -> ty`
  fn read_signature(&mut self) -> ParseResult<(String, Vec<ParsedParam>, Type)> {
    let name = self.read_sigil_name('@')?;
    self.expect_char('(')?;
    let mut params = vec![];
    if !self.try_read_char(')') {
      loop {
        self.skip_whitespace_and_comments();
        let pname = self.read_sigil_name('%')?;
        self.expect_char(':')?;
        let ty = self.read_type()?;
        let mut noalias = false;
        if self.more_on_this_line() && self.peek() != Some(',') && self.peek() != Some(')') {
          self.expect_ident("noalias")?;
          noalias = true;
        }
        params.push(ParsedParam { name: pname, ty, noalias });
        if self.try_read_char(')') {
          break;
        }
        self.expect_char(',')?;
      }
    }
    self.expect_char('-')?;
    self.expect_char('>')?;
    let ret_ty = self.read_type()?;
    Ok((name, params, ret_ty))
  }

  fn read_func(&mut self) -> ParseResult<ParsedFunc> {
    let (name, params, ret_ty) = self.read_signature()?;
    self.expect_char('{')?;
    let mut blocks: Vec<(String, Vec<ParsedInst>)> = vec![];
    loop {
      if self.try_read_char('}') {
        break;
      }
      self.skip_whitespace_and_comments();
      let line = self.line;
      let result = if self.peek() == Some('%') {
        let name = self.read_sigil_name('%')?;
        self.expect_char('=')?;
        Some(name)
      } else {
        None
      };
      let opcode = self.read_ident()?;
      if result.is_none() && self.peek() == Some(':') {
        self.advance();
        blocks.push((opcode, vec![]));
        continue;
      }
      let inst = self.read_inst(result, &opcode, line)?;
      match blocks.last_mut() {
        Some((_, insts)) => insts.push(inst),
        None => return self.error("instruction outside of a block"),
      }
    }
    Ok(ParsedFunc { name, params, ret_ty, blocks })
  }

  fn read_inst(
    &mut self, result: Option<String>, opcode: &str, line: usize,
  ) -> ParseResult<ParsedInst> {
    let mut ty = Type::Void;
    let kind = if let Some(op) = BinOp::from_name(opcode) {
      ty = self.read_type()?;
      let lhs = self.read_operand()?;
      self.expect_char(',')?;
      let rhs = self.read_operand()?;
      ParsedKind::Binary(op, lhs, rhs)
    } else if let Some(op) = CastOp::from_name(opcode) {
      let (from, arg) = self.read_typed_operand()?;
      self.expect_ident("to")?;
      ty = self.read_type()?;
      ParsedKind::Cast(op, from, arg)
    } else {
      match opcode {
        "icmp" => {
          let cc_name = self.read_ident()?;
          let cc = match IntCC::from_name(&cc_name) {
            Some(cc) => cc,
            None => return self.error(&format!("unknown condition '{}'", cc_name)),
          };
          let (arg_ty, lhs) = self.read_typed_operand()?;
          self.expect_char(',')?;
          let rhs = self.read_operand()?;
          ty = Type::I1;
          ParsedKind::Icmp(cc, arg_ty, lhs, rhs)
        }
        "select" => {
          ty = self.read_type()?;
          let c = self.read_operand()?;
          self.expect_char(',')?;
          let t = self.read_operand()?;
          self.expect_char(',')?;
          let f = self.read_operand()?;
          ParsedKind::Select(c, t, f)
        }
        "gep" => {
          let base = self.read_operand()?;
          self.expect_char(',')?;
          let (index_ty, index) = self.read_typed_operand()?;
          ParsedKind::Gep(base, index_ty, index)
        }
        "load" => {
          ty = self.read_type()?;
          ParsedKind::Load(self.read_operand()?)
        }
        "store" => {
          let (value_ty, value) = self.read_typed_operand()?;
          self.expect_char(',')?;
          let ptr = self.read_operand()?;
          ParsedKind::Store(value_ty, value, ptr)
        }
        "alloca" => {
          self.skip_whitespace_and_comments();
          let elem_size = if self.try_read_char('[') {
            let n = self.read_u32()?;
            self.expect_char(']')?;
            Some(n)
          } else if self.try_read_char('?') {
            None
          } else {
            Some(self.read_type()?.store_size())
          };
          self.expect_ident("x")?;
          let count = self.read_u32()?;
          ty = Type::Ptr(elem_size);
          ParsedKind::Alloca(count)
        }
        "call" => {
          ty = self.read_type()?;
          let callee = self.read_sigil_name('@')?;
          self.expect_char('(')?;
          let mut args = vec![];
          if !self.try_read_char(')') {
            loop {
              args.push(self.read_typed_operand()?);
              if self.try_read_char(')') {
                break;
              }
              self.expect_char(',')?;
            }
          }
          let mut attrs = CallAttrs::default();
          while self.more_on_this_line() && self.peek() != Some('!') {
            match self.read_ident()?.as_str() {
              "readnone" => attrs.read_none = true,
              "noreturn" => attrs.no_return = true,
              other => return self.error(&format!("unknown call attribute '{}'", other)),
            }
          }
          ParsedKind::Call(callee, args, attrs)
        }
        "phi" => {
          ty = self.read_type()?;
          let mut incoming = vec![];
          loop {
            self.expect_char('[')?;
            let v = self.read_operand()?;
            self.expect_char(',')?;
            let b = self.read_ident()?;
            self.expect_char(']')?;
            incoming.push((v, b));
            if !self.more_on_this_line() || self.peek() != Some(',') {
              break;
            }
            self.expect_char(',')?;
          }
          ParsedKind::Phi(incoming)
        }
        "jump" => ParsedKind::Jump(self.read_ident()?),
        "br" => {
          let cond = self.read_operand()?;
          self.expect_char(',')?;
          let t = self.read_ident()?;
          self.expect_char(',')?;
          let f = self.read_ident()?;
          ParsedKind::Branch(cond, t, f)
        }
        "ret" => {
          if self.more_on_this_line() && self.peek() != Some('!') {
            ParsedKind::Return(Some(self.read_typed_operand()?))
          } else {
            ParsedKind::Return(None)
          }
        }
        _ => return self.error(&format!("unknown instruction '{}'", opcode)),
      }
    };

    if result.is_some() == (ty == Type::Void && !matches!(kind, ParsedKind::Gep(..))) {
      return self.error(&format!("'{}' and its result do not match", opcode));
    }

    let mut scopes = vec![];
    let mut noalias = vec![];
    while self.more_on_this_line() && self.peek() == Some('!') {
      self.advance();
      match self.read_name_chars().as_str() {
        "alias.scope" => scopes = self.read_scope_list()?,
        "noalias" => noalias = self.read_scope_list()?,
        other => return self.error(&format!("unknown metadata '{}'", other)),
      }
    }

    Ok(ParsedInst { result, ty, kind, scopes, noalias, line })
  }
}

fn is_alpha(c: char) -> bool {
  c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

//=============================================================================
// Lowering into a `Func`

fn lowering_error<T>(line: usize, msg: &str) -> ParseResult<T> {
  Err(ParseError::Parse(format!("error at line {}: {}", line, msg)))
}

// Result types of every named value, so that forward references get a
// placeholder of the right type.  A gep has the type of its base, which may
// itself be a gep defined later in the text.
fn value_types(module: &Module, parsed: &ParsedFunc) -> Map<String, Type> {
  let mut types = Map::<String, Type>::default();
  for p in &parsed.params {
    types.insert(p.name.clone(), p.ty);
  }
  let mut geps = vec![];
  for (_, insts) in &parsed.blocks {
    for inst in insts {
      if let Some(name) = &inst.result {
        match &inst.kind {
          ParsedKind::Gep(base, _, _) => geps.push((name.clone(), base.clone())),
          _ => {
            types.insert(name.clone(), inst.ty);
          }
        }
      }
    }
  }
  loop {
    let mut changed = false;
    for (name, base) in &geps {
      if types.contains_key(name) {
        continue;
      }
      let ty = match base {
        Operand::Local(b) => types.get(b).cloned(),
        Operand::Global(g) => Some(module.find_global(g).map_or(Type::Ptr(None), |g| g.ptr_ty())),
        _ => Some(Type::Ptr(None)),
      };
      if let Some(ty) = ty {
        types.insert(name.clone(), ty);
        changed = true;
      }
    }
    if !changed {
      break;
    }
  }
  types
}

struct Lowering<'m> {
  module: &'m Module,
  func: Func,
  types: Map<String, Type>,
  values: Map<String, ValueIx>,
  blocks: Map<String, BlockIx>,
  // Operand `n` of an instruction refers to a value defined later.
  fixups: Vec<(InstIx, usize, String, usize)>,
}

impl<'m> Lowering<'m> {
  fn block(&self, name: &str, line: usize) -> ParseResult<BlockIx> {
    match self.blocks.get(name) {
      Some(b) => Ok(*b),
      None => lowering_error(line, &format!("unknown block '{}'", name)),
    }
  }

  // Resolves `op`, used with type `ty`.  Unknown locals become placeholders
  // recorded in `pending`, in operand order.
  fn operand(
    &mut self, op: &Operand, ty: Type, pending: &mut Vec<(usize, String)>,
    pos: usize,
  ) -> ValueIx {
    match op {
      Operand::Local(name) => match self.values.get(name) {
        Some(v) => *v,
        None => {
          pending.push((pos, name.clone()));
          let ty = self.types.get(name).cloned().unwrap_or(ty);
          self.func.undef(ty)
        }
      },
      Operand::Global(name) => {
        let ty = match self.module.find_global(name) {
          Some(g) => g.ptr_ty(),
          None => Type::Ptr(None),
        };
        self.func.global(name, ty)
      }
      Operand::Const(c) => self.func.iconst(ty, *c),
      Operand::Undef => self.func.undef(ty),
    }
  }

  fn local_ty(&self, op: &Operand, default: Type) -> Type {
    match op {
      Operand::Local(name) => self.types.get(name).cloned().unwrap_or(default),
      Operand::Global(name) => match self.module.find_global(name) {
        Some(g) => g.ptr_ty(),
        None => default,
      },
      _ => default,
    }
  }

  fn lower_inst(&mut self, b: BlockIx, inst: &ParsedInst) -> ParseResult<()> {
    let mut pending = vec![];
    let ptr = Type::Ptr(None);
    let mut ty = inst.ty;
    let kind = match &inst.kind {
      ParsedKind::Binary(op, lhs, rhs) => {
        let lhs = self.operand(lhs, ty, &mut pending, 0);
        let rhs = self.operand(rhs, ty, &mut pending, 1);
        InstKind::Binary { op: *op, args: [lhs, rhs] }
      }
      ParsedKind::Icmp(cc, arg_ty, lhs, rhs) => {
        let lhs = self.operand(lhs, *arg_ty, &mut pending, 0);
        let rhs = self.operand(rhs, *arg_ty, &mut pending, 1);
        InstKind::Icmp { cc: *cc, args: [lhs, rhs] }
      }
      ParsedKind::Select(c, t, f) => {
        let c = self.operand(c, Type::I1, &mut pending, 0);
        let t = self.operand(t, ty, &mut pending, 1);
        let f = self.operand(f, ty, &mut pending, 2);
        InstKind::Select { args: [c, t, f] }
      }
      ParsedKind::Cast(op, from, arg) => {
        let arg = self.operand(arg, *from, &mut pending, 0);
        InstKind::Cast { op: *op, arg }
      }
      ParsedKind::Gep(base, index_ty, index) => {
        ty = self.local_ty(base, ptr);
        let base = self.operand(base, ptr, &mut pending, 0);
        let index = self.operand(index, *index_ty, &mut pending, 1);
        InstKind::Gep { base, index }
      }
      ParsedKind::Load(p) => InstKind::Load { ptr: self.operand(p, ptr, &mut pending, 0) },
      ParsedKind::Store(value_ty, value, p) => {
        let value = self.operand(value, *value_ty, &mut pending, 0);
        let p = self.operand(p, ptr, &mut pending, 1);
        InstKind::Store { ptr: p, value }
      }
      ParsedKind::Alloca(count) => InstKind::Alloca { count: *count },
      ParsedKind::Call(callee, args, attrs) => {
        let mut vals = vec![];
        for (n, (arg_ty, arg)) in args.iter().enumerate() {
          vals.push(self.operand(arg, *arg_ty, &mut pending, n));
        }
        InstKind::Call { callee: callee.clone(), args: vals, attrs: *attrs }
      }
      ParsedKind::Phi(incoming) => {
        let mut res = vec![];
        for (n, (v, from)) in incoming.iter().enumerate() {
          let from = self.block(from, inst.line)?;
          res.push((from, self.operand(v, ty, &mut pending, n)));
        }
        InstKind::Phi { incoming: res }
      }
      ParsedKind::Jump(dest) => InstKind::Jump { dest: self.block(dest, inst.line)? },
      ParsedKind::Branch(cond, t, f) => {
        let cond = self.operand(cond, Type::I1, &mut pending, 0);
        let dests = [self.block(t, inst.line)?, self.block(f, inst.line)?];
        InstKind::Branch { cond, dests }
      }
      ParsedKind::Return(value) => {
        let value = match value {
          Some((vty, v)) => Some(self.operand(v, *vty, &mut pending, 0)),
          None => None,
        };
        InstKind::Return { value }
      }
    };

    let name = inst.result.clone().unwrap_or_default();
    let i = self.func.append_inst(b, kind, ty, &name);
    if let Some(name) = &inst.result {
      let v = self.func.inst_result(i);
      if self.values.insert(name.clone(), v).is_some() {
        return lowering_error(inst.line, &format!("%{} is defined twice", name));
      }
    }
    for (pos, name) in pending {
      self.fixups.push((i, pos, name, inst.line));
    }

    let max_scope = inst.scopes.iter().chain(inst.noalias.iter()).max();
    if let Some(max_scope) = max_scope {
      while self.func.scopes.len() <= *max_scope {
        let n = self.func.scopes.len();
        let domain = self.func.name.clone();
        self.func.create_alias_scope(&domain, &format!("scope {}", n));
      }
    }
    for s in &inst.scopes {
      self.func.insts[i].alias_scopes.push(ScopeIx::new(*s));
    }
    for s in &inst.noalias {
      self.func.insts[i].noalias.push(ScopeIx::new(*s));
    }
    Ok(())
  }

  fn apply_fixups(&mut self) -> ParseResult<()> {
    for (i, pos, name, line) in std::mem::take(&mut self.fixups) {
      let v = match self.values.get(&name) {
        Some(v) => *v,
        None => return lowering_error(line, &format!("%{} is never defined", name)),
      };
      let mut n = 0;
      self.func.insts[i].kind.map_operands(|old| {
        let new = if n == pos { v } else { old };
        n += 1;
        new
      });
    }
    Ok(())
  }
}

fn lower_func(module: &Module, parsed: ParsedFunc) -> ParseResult<Func> {
  let types = value_types(module, &parsed);
  let mut lowering = Lowering {
    module,
    func: Func::new(&parsed.name, parsed.ret_ty),
    types,
    values: Map::default(),
    blocks: Map::default(),
    fixups: vec![],
  };
  for p in &parsed.params {
    let v = lowering.func.add_param(&p.name, p.ty);
    if p.noalias {
      lowering.func.set_noalias(v);
    }
    if lowering.values.insert(p.name.clone(), v).is_some() {
      return lowering_error(0, &format!("duplicate parameter %{}", p.name));
    }
  }
  for (name, _) in &parsed.blocks {
    let b = lowering.func.create_block(name);
    if lowering.blocks.insert(name.clone(), b).is_some() {
      return lowering_error(0, &format!("duplicate block '{}'", name));
    }
  }
  for (name, insts) in &parsed.blocks {
    let b = lowering.blocks[name];
    for inst in insts {
      lowering.lower_inst(b, inst)?;
    }
  }
  lowering.apply_fixups()?;
  Ok(lowering.func)
}

#[cfg(test)]
mod test {
  use super::*;

  const COPY: &str = r#"
; A[i] = B[i]
func @copy(%A: ptr<4> noalias, %B: ptr<4>, %n: i64) -> i64 {
entry:
  jump head
head:
  %i = phi i64 [0, entry], [%i.next, body]
  %cmp = icmp slt i64 %i, %n
  br %cmp, body, exit
body:
  %pb = gep %B, i64 %i
  %v = load i32 %pb !alias.scope(1) !noalias(0)
  %pa = gep %A, i64 %i
  store i32 %v, %pa
  %i.next = add i64 %i, 1
  jump head
exit:
  ret i64 %i
}
"#;

  #[test]
  fn parses_a_loop() {
    let module = parse_content(COPY).unwrap();
    assert_eq!(module.funcs.len(), 1);
    let f = &module.funcs[0];
    assert_eq!(f.layout.len(), 4);
    assert!(f.values[f.params[0]].noalias);
    assert!(!f.values[f.params[1]].noalias);
    let i = f.value_by_name("i").unwrap();
    let next = f.value_by_name("i.next").unwrap();
    match f.kind(f.def_inst(i).unwrap()) {
      InstKind::Phi { incoming } => assert_eq!(incoming[1].1, next),
      other => panic!("unexpected {:?}", other),
    }
    let pb = f.value_by_name("pb").unwrap();
    assert_eq!(f.value_ty(pb), Type::Ptr(Some(4)));
    assert_eq!(f.scopes.len(), 2);
    let load = f.users(pb)[0];
    assert_eq!(f.insts[load].alias_scopes.len(), 1);
    assert!(restrictify::verify_func(f).is_ok());
  }

  #[test]
  fn printing_and_parsing_agree() {
    let mut module = parse_content(COPY).unwrap();
    module.globals.push(GlobalDecl { name: "g".to_string(), elem_ty: Type::I32, count: 8 });
    module.funcs.push(Func::new_declaration("sqrt", Type::I64, &[Type::I64]));
    let printed = format!("{}", module);
    let reparsed = parse_content(&printed).unwrap();
    assert_eq!(printed, format!("{}", reparsed));
  }

  #[test]
  fn errors_carry_a_line() {
    let src = "func @f() -> void {\nentry:\n  jump nowhere\n}\n";
    match parse_content(src) {
      Err(ParseError::Parse(msg)) => assert!(msg.contains("line 3"), "{}", msg),
      other => panic!("unexpected {:?}", other.map(|m| m.funcs.len())),
    }
    assert!(parse_content("func @f() -> void {\nentry:\n  ret\n  %x = add i64 %y, 1\n}").is_err());
    assert!(parse_content("bogus").is_err());
  }
}
