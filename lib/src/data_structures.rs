/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate.

#![allow(non_snake_case)]

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Index;
use std::ops::IndexMut;
use std::slice::{Iter, IterMut};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

#[derive(Clone)]
pub struct Set<T> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  #[inline(never)]
  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  #[inline(never)]
  pub fn card(&self) -> usize {
    self.set.len()
  }

  #[inline(never)]
  pub fn insert(&mut self, item: T) {
    self.set.insert(item);
  }

  #[inline(never)]
  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  #[inline(never)]
  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  #[inline(never)]
  pub fn intersect(&mut self, other: &Self) {
    let mut res = FxHashSet::<T>::default();
    for item in self.set.iter() {
      if other.set.contains(item) {
        res.insert(*item);
      }
    }
    self.set = res;
  }

  #[inline(never)]
  pub fn union(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.insert(*item);
    }
  }

  #[inline(never)]
  pub fn intersects(&self, other: &Self) -> bool {
    !self.set.is_disjoint(&other.set)
  }

  #[inline(never)]
  pub fn is_subset_of(&self, other: &Self) -> bool {
    self.set.is_subset(&other.set)
  }

  #[inline(never)]
  pub fn to_vec(&self) -> Vec<T> {
    let mut res = Vec::<T>::new();
    for item in self.set.iter() {
      res.push(*item)
    }
    // Don't delete this.  It is important.
    res.sort_unstable();
    res
  }

  #[inline(never)]
  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }

  #[inline(never)]
  pub fn equals(&self, other: &Self) -> bool {
    self.set == other.set
  }

  pub fn iter(&self) -> SetIter<T> {
    SetIter { set_iter: self.set.iter() }
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  #[inline(never)]
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Print the elements in some way which depends only on what is
    // present in the set, and not on any other factor.
    let sorted_vec = self.to_vec();
    let mut s = "{".to_string();
    for i in 0..sorted_vec.len() {
      if i > 0 {
        s = s + &", ".to_string();
      }
      s = s + &format!("{:?}", &sorted_vec[i]);
    }
    s = s + &"}".to_string();
    write!(fmt, "{}", s)
  }
}

pub struct SetIter<'a, T> {
  set_iter: std::collections::hash_set::Iter<'a, T>,
}
impl<'a, T> Iterator for SetIter<'a, T> {
  type Item = &'a T;
  fn next(&mut self) -> Option<Self::Item> {
    self.set_iter.next()
  }
}

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in startEnt .dotdot( endPlus1Ent ) {
//   }
//
// until such time as |trait Step| is available in stable Rust.

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct MyRange<T> {
  first: T,
  lastPlus1: T,
  len: usize,
}
impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}
impl<T: Copy + Eq + Ord + PlusOne> MyRange<T> {
  /// Create a new range object.
  pub fn new(from: T, len: usize) -> MyRange<T> {
    let mut lastPlus1 = from;
    for _ in 0..len {
      lastPlus1 = lastPlus1.plus_one();
    }
    MyRange { first: from, lastPlus1, len }
  }

  pub fn first(&self) -> T {
    assert!(self.len > 0);
    self.first
  }

  pub fn len(&self) -> usize {
    self.len
  }
}

pub struct MyIterator<T> {
  range: MyRange<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.lastPlus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}
impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + Eq + Ord + PlusOne + From<u32>,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  /// Pushes an element and hands back the index it lives at.
  pub fn push(&mut self, item: Ty) -> TyIx {
    let ix = TyIx::from(self.len());
    self.vek.push(item);
    ix
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
  pub fn range(&self) -> MyRange<TyIx> {
    MyRange::new(TyIx::from(0), self.len() as usize)
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    // Firstly, the indexing type (TypeIx)
    pub struct $TypeIx(u32);
    impl $TypeIx {
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      pub fn get(self) -> u32 {
        self.0
      }
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 - delta)
      }
      pub fn dotdot(&self, lastPlus1: $TypeIx) -> MyRange<$TypeIx> {
        let len = (lastPlus1.0 - self.0) as usize;
        MyRange::new(*self, len)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.0)
      }
    }
    impl PlusOne for $TypeIx {
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl From<$TypeIx> for u32 {
      fn from(ix: $TypeIx) -> u32 {
        ix.0
      }
    }
    impl From<u32> for $TypeIx {
      fn from(n: u32) -> $TypeIx {
        $TypeIx(n)
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

generate_boilerplate!(ValueIx, "v");

generate_boilerplate!(LoopIx, "L");

generate_boilerplate!(RegionIx, "R");

generate_boilerplate!(ScevIx, "s");

generate_boilerplate!(ScopeIx, "scope");

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn set_to_vec_is_sorted() {
    let s = Set::from_vec(vec![BlockIx::new(3), BlockIx::new(1), BlockIx::new(2)]);
    assert_eq!(s.to_vec(), vec![BlockIx::new(1), BlockIx::new(2), BlockIx::new(3)]);
    assert_eq!(format!("{:?}", s), "{b1, b2, b3}");
  }

  #[test]
  fn typed_ix_vec_push_returns_index() {
    let mut v = TypedIxVec::<ValueIx, u32>::new();
    let a = v.push(10);
    let b = v.push(20);
    assert_eq!(a, ValueIx::new(0));
    assert_eq!(b, ValueIx::new(1));
    assert_eq!(v[b], 20);
    let all: Vec<ValueIx> = v.range().into_iter().collect();
    assert_eq!(all, vec![a, b]);
  }

  #[test]
  fn set_ops() {
    let mut s = Set::from_vec(vec![LoopIx::new(0), LoopIx::new(1)]);
    let t = Set::unit(LoopIx::new(1));
    assert!(t.is_subset_of(&s));
    assert!(s.intersects(&t));
    s.intersect(&t);
    assert_eq!(s.card(), 1);
    assert!(s.equals(&t));
  }
}
