/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the restrictify library.

#![allow(non_snake_case)]

use log::info;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

// Stuff that is defined by the library

// Sets, maps and typed indices.

pub use crate::data_structures::{
  BlockIx, InstIx, LoopIx, Map, RegionIx, ScevIx, ScopeIx, Set, TypedIxVec,
  ValueIx,
};

// The IR and its analyses.

pub use crate::cfg::{AnalysisError, CFGInfo, DomTree, PostDomTree};
pub use crate::ir::*;
pub use crate::loops::LoopInfo;
pub use crate::regions::RegionInfo;
pub use crate::scev::{ScalarEvolution, ScevKind};

// Alias queries.  Clients with a better alias analysis implement
// `AliasOracle` themselves.

pub use crate::alias::{
  select_pairs, AliasOracle, AliasResult, AliasSetTracker, BasicAliasOracle,
  ConservativeAliasOracle,
};

// Bounds, range collection and versioning.

pub use crate::bounds::{is_invariant, BoundBuilder, BoundValue};
pub use crate::clone::{clone_region, ClonedRegion};
pub use crate::instrument::{
  can_instrument, instrument_function, InstrumentStats, InstrumentationMode,
  VersionedRegion,
};
pub use crate::licm::hoist_loop_invariants;
pub use crate::range_analysis::{
  AccessKind, PtrRangeAnalysis, PtrRangeInfo, RangeStats, RegionRangeInfo,
};
pub use crate::verify::verify_func;

//=============================================================================
// Per-function analyses

/// The structural analyses every pass of the library works from.  The
/// versioning engine keeps `dt`, `li` and `ri` up to date; `pdt` is only
/// valid until the first region is versioned.  Anything else that edits the
/// function's control flow must recompute them.
#[derive(Clone, Debug)]
pub struct FuncAnalyses {
  pub dt: DomTree,
  pub pdt: PostDomTree,
  pub li: LoopInfo,
  pub ri: RegionInfo,
}

impl FuncAnalyses {
  #[inline(never)]
  pub fn compute(func: &Func) -> Result<Self, AnalysisError> {
    let cfg = CFGInfo::create(func)?;
    let dt = DomTree::create(func, &cfg);
    let pdt = PostDomTree::create(func, &cfg);
    let li = LoopInfo::create(func, &cfg, &dt);
    let ri = RegionInfo::create(func, &cfg, &dt, &pdt);
    Ok(Self { dt, pdt, li, ri })
  }
}

//=============================================================================
// Options

/// Options for the library entry points.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Options {
  /// Which regions get versioned.
  pub mode: InstrumentationMode,

  /// Report statistics through the `log` facade at `info` level.
  pub stats: bool,

  /// Hoist loop-invariant computations into preheaders before collecting
  /// range info.
  pub licm: bool,

  /// Retry regions lacking full side-effect info without their first block.
  pub reduce_regions: bool,

  /// Verify each transformed function.  A failure is reported as
  /// `AnalysisError::VerifierFailed`.
  pub verify: bool,

  /// Upper bounds on the backedge-taken count of loops whose count is not
  /// computable, keyed by the name of the loop header.
  pub trip_count_hints: Vec<(String, i64)>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      mode: InstrumentationMode::Region,
      stats: false,
      licm: false,
      reduce_regions: false,
      verify: cfg!(debug_assertions),
      trip_count_hints: vec![],
    }
  }
}

//=============================================================================
// Reports

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PtrReport {
  pub name: String,
  pub elem_size: u32,
  pub accesses: u32,
  pub access_kind: AccessKind,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RegionReport {
  /// `entry => exit`, as of collection time.
  pub name: String,
  pub has_full_side_effect_info: bool,
  pub base_ptrs: Vec<PtrReport>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VersionReport {
  pub region: String,
  pub guard: String,
  pub clone_entry: String,
  pub checks: u32,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FunctionReport {
  pub name: String,
  pub regions: Vec<RegionReport>,
  pub versioned: Vec<VersionReport>,
  pub hoisted: u32,
  pub range_stats: RangeStats,
  pub instrument_stats: InstrumentStats,
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ModuleReport {
  pub functions: Vec<FunctionReport>,
  pub range_stats: RangeStats,
  pub instrument_stats: InstrumentStats,
}

fn region_reports(
  func: &Func, an: &FuncAnalyses, pra: &PtrRangeAnalysis,
) -> Vec<RegionReport> {
  let mut res = vec![];
  for r in an.ri.preorder() {
    let info = match pra.info(r) {
      Some(info) => info,
      None => continue,
    };
    let base_ptrs = info
      .sorted_base_ptrs()
      .into_iter()
      .map(|p| {
        let data = &info.base_ptrs[&p];
        PtrReport {
          name: func.display_value(p),
          elem_size: data.elem_size,
          accesses: data.access_insts.len() as u32,
          access_kind: data.access_kind,
        }
      })
      .collect();
    res.push(RegionReport {
      name: an.ri.name(func, r),
      has_full_side_effect_info: info.has_full_side_effect_info,
      base_ptrs,
    });
  }
  res
}

//=============================================================================
// Entry points

fn trip_count_hints(
  func: &Func, an: &FuncAnalyses, se: &mut ScalarEvolution, opts: &Options,
) -> Map<LoopIx, ScevIx> {
  let mut res = Map::default();
  for (header, count) in &opts.trip_count_hints {
    for l in an.li.loops.range() {
      if func.block_name(an.li.header(l)) == header.as_str() {
        res.insert(l, se.constant(Type::I64, *count));
      }
    }
  }
  res
}

fn analyze_function_wrk(
  module: &Module, func: &mut Func, aa: &dyn AliasOracle, opts: &Options,
) -> Result<(FuncAnalyses, ScalarEvolution, PtrRangeAnalysis, u32), AnalysisError>
{
  let mut an = FuncAnalyses::compute(func)?;
  let mut hoisted = 0;
  if opts.licm {
    hoisted = hoist_loop_invariants(func, &an, aa);
    if hoisted > 0 {
      an = FuncAnalyses::compute(func)?;
    }
  }
  let mut se = ScalarEvolution::new();
  let mut pra = PtrRangeAnalysis::new();
  let counts = trip_count_hints(func, &an, &mut se, opts);
  pra.set_artificial_be_counts(counts);
  pra.run(module, func, &mut se, &mut an, aa, opts.reduce_regions);
  Ok((an, se, pra, hoisted))
}

/// Runs the optional LICM pre-pass and collects range info for every region
/// of `func`, without versioning anything.  `module` is used to look up
/// callees.
pub fn analyze_function(
  module: &Module, func: &mut Func, aa: &dyn AliasOracle, opts: &Options,
) -> Result<(FuncAnalyses, ScalarEvolution, PtrRangeAnalysis), AnalysisError> {
  let (an, se, pra, _) = analyze_function_wrk(module, func, aa, opts)?;
  Ok((an, se, pra))
}

/// Collects range info for `func` and versions the regions selected by
/// `opts.mode`: each gets a run-time disjointness check choosing between the
/// original region, tagged with alias scopes, and an untagged clone.
#[inline(never)]
pub fn run_on_function(
  module: &Module, func: &mut Func, aa: &dyn AliasOracle, opts: &Options,
) -> Result<FunctionReport, AnalysisError> {
  let (mut an, mut se, pra, hoisted) =
    analyze_function_wrk(module, func, aa, opts)?;
  let regions = region_reports(func, &an, &pra);

  let mut claimed = Set::<BlockIx>::empty();
  let mut istats = InstrumentStats::default();
  istats.total_loops = an.li.num_loops() as u32;
  let versioned = instrument_function(
    func,
    &mut se,
    &mut an,
    &pra,
    aa,
    opts.mode,
    &mut claimed,
    &mut istats,
  );
  let versioned = versioned
    .iter()
    .map(|v| VersionReport {
      region: an.ri.name(func, v.region),
      guard: func.block_name(v.guard).to_string(),
      clone_entry: func.block_name(v.clone_entry).to_string(),
      checks: v.checks,
    })
    .collect();

  if opts.verify {
    verify_func(func).map_err(AnalysisError::VerifierFailed)?;
  }
  if opts.stats {
    info!(
      "restrictify: {}: {} of {} accesses analyzed, {} of {} regions with full info",
      func.name,
      pra.stats.analyzed_accesses,
      pra.stats.memory_accesses,
      pra.stats.regions_with_full_info,
      pra.stats.regions
    );
    info!(
      "restrictify: {}: {} region(s) cloned, {} of {} loop(s) cloned, {} check(s)",
      func.name,
      istats.cloned_regions,
      istats.cloned_loops,
      istats.total_loops,
      istats.pairwise_checks
    );
  }

  Ok(FunctionReport {
    name: func.name.clone(),
    regions,
    versioned,
    hoisted,
    range_stats: pra.stats.clone(),
    instrument_stats: istats,
  })
}

/// Runs `run_on_function` on every defined function of `module`, in order.
/// Callees are looked up in the module as it was before any function was
/// transformed.
pub fn run_on_module(
  module: &mut Module, aa: &dyn AliasOracle, opts: &Options,
) -> Result<ModuleReport, AnalysisError> {
  let callees = module.clone();
  let mut report = ModuleReport::default();
  for func in module.funcs.iter_mut() {
    if func.is_declaration {
      continue;
    }
    let fr = run_on_function(&callees, func, aa, opts)?;
    report.range_stats.accumulate(&fr.range_stats);
    report.instrument_stats.accumulate(&fr.instrument_stats);
    report.functions.push(fr);
  }
  if opts.stats {
    info!(
      "restrictify: module: {} function(s), {} region(s) cloned, {} check(s)",
      report.functions.len(),
      report.instrument_stats.cloned_regions,
      report.instrument_stats.pairwise_checks
    );
  }
  Ok(report)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_utils::{copy_kernel, shifted_copy};

  #[test]
  fn malformed_functions_are_rejected() {
    let module = Module::new();
    let aa = BasicAliasOracle;
    let opts = Options::default();

    let mut empty = Func::new("empty", Type::Void);
    match run_on_function(&module, &mut empty, &aa, &opts) {
      Err(AnalysisError::EmptyFunction) => {}
      other => panic!("unexpected {:?}", other.map(|r| r.name)),
    }

    let mut unterminated = Func::new("unterminated", Type::Void);
    let b = unterminated.create_block("entry");
    let x = unterminated.iconst(Type::I64, 1);
    unterminated.ins(b, i_add(x, x), Type::I64, "y");
    assert!(matches!(
      run_on_function(&module, &mut unterminated, &aa, &opts),
      Err(AnalysisError::MalformedBlock { .. })
    ));

    let mut unreachable = Func::new("unreachable", Type::Void);
    let b0 = unreachable.create_block("entry");
    let b1 = unreachable.create_block("dead");
    unreachable.append_inst(b0, i_ret(None), Type::Void, "");
    unreachable.append_inst(b1, i_ret(None), Type::Void, "");
    assert!(matches!(
      run_on_function(&module, &mut unreachable, &aa, &opts),
      Err(AnalysisError::UnreachableBlocks)
    ));
  }

  #[test]
  fn analyses_can_be_kept_across_versioning() {
    let module = Module::new();
    let mut f = copy_kernel();
    let before = FuncAnalyses::compute(&f).unwrap().clone();
    let head = f.block_by_name("head").unwrap();
    let exit = f.block_by_name("exit").unwrap();
    run_on_function(&module, &mut f, &BasicAliasOracle, &Options::default()).unwrap();
    // The copy still describes the function as it was.
    assert!(before.pdt.post_dominates(exit, head));
    assert_eq!(before.li.num_loops(), 1);
    let after = FuncAnalyses::compute(&f).unwrap();
    assert_eq!(after.li.num_loops(), 2);
    assert!(after.ri.num_regions() > before.ri.num_regions());
  }

  #[test]
  fn module_reports_add_up() {
    let mut module = Module::new();
    module.funcs.push(copy_kernel());
    module.funcs.push(Func::new_declaration("sqrt", Type::I64, &[Type::I64]));
    module.funcs.push(shifted_copy());
    let opts = Options { verify: true, stats: true, ..Options::default() };
    let report = run_on_module(&mut module, &BasicAliasOracle, &opts).unwrap();
    assert_eq!(report.functions.len(), 2);
    assert_eq!(report.functions[0].name, "copy");
    assert_eq!(report.instrument_stats.cloned_regions, 2);
    let total: u32 =
      report.functions.iter().map(|f| f.instrument_stats.pairwise_checks).sum();
    assert_eq!(report.instrument_stats.pairwise_checks, total);
    let top = &report.functions[0].regions[0];
    assert!(top.has_full_side_effect_info);
    assert_eq!(top.base_ptrs.len(), 2);
    assert_eq!(top.base_ptrs[0].name, "%A");
    assert_eq!(top.base_ptrs[0].access_kind, AccessKind::Store);
  }

  #[test]
  fn trip_count_hints_make_unbounded_loops_analyzable() {
    let module = Module::new();
    let (mut f, _, _) = crate::test_utils::counted_loop(IntCC::Eq, 0, 1);
    let aa = BasicAliasOracle;
    let (an, _, pra) =
      analyze_function(&module, &mut f.clone(), &aa, &Options::default())
        .unwrap();
    assert!(!pra.info(an.ri.top_level()).unwrap().has_full_side_effect_info);

    let opts = Options {
      trip_count_hints: vec![("head".to_string(), 100)],
      ..Options::default()
    };
    let (an, _, pra) = analyze_function(&module, &mut f, &aa, &opts).unwrap();
    assert!(pra.info(an.ri.top_level()).unwrap().has_full_side_effect_info);
  }
}
