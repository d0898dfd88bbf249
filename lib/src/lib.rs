/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the restrictify library.

// Make the sample kernels public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod test_utils;
#[cfg(all(test, not(feature = "fuzzing")))]
mod test_utils;

mod alias;
mod bounds;
mod cfg;
mod clone;
mod data_structures;
mod instrument;
mod interface;
mod ir;
mod licm;
mod loops;
mod range_analysis;
mod regions;
mod scev;
mod verify;

pub use crate::interface::*;
