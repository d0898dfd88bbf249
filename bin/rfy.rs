/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use std::path::PathBuf;

use clap;
use log::{error, info};
use pretty_env_logger;
use serde::{Deserialize, Serialize};

use restrictify::{
  run_on_module, AliasOracle, BasicAliasOracle, ConservativeAliasOracle,
  InstrumentationMode, ModuleReport, Options,
};
use rfy::test_cases::{find_test, test_from_file, PathExpect, TestCase};
use rfy::test_framework::{run_func, run_versioned, RunResult};
use rfy::validator::{check_results, validate};

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("restrictify-util")
    .about("runs restrictify's region versioning on test kernels")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required_unless_present("file")
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("file")
        .short('f')
        .takes_value(true)
        .help("file with a module to transform"),
    )
    .arg(
      clap::Arg::new("entry")
        .short('e')
        .takes_value(true)
        .requires("file")
        .help("function of the file to run (the last one if not set)"),
    )
    .arg(
      clap::Arg::new("mode")
        .short('m')
        .takes_value(true)
        .possible_values(["region", "function"])
        .help("which regions to version (region if not set)"),
    )
    .arg(clap::Arg::new("stats").long("stats").help("log statistics"))
    .arg(clap::Arg::new("licm").long("licm").help("hoist loop invariants first"))
    .arg(
      clap::Arg::new("reduce")
        .long("reduce")
        .help("retry regions without their first block"),
    )
    .arg(
      clap::Arg::new("conservative")
        .long("conservative")
        .help("assume every two pointers may alias"),
    )
    .arg(
      clap::Arg::new("dump")
        .long("dump")
        .takes_value(true)
        .help("write the report and the runs, bincode-encoded, to this file"),
    );
  let matches = app.get_matches();

  let mode = match matches.value_of("mode") {
    Some("function") => InstrumentationMode::Function,
    _ => InstrumentationMode::Region,
  };
  let opts = Options {
    mode,
    stats: matches.is_present("stats"),
    licm: matches.is_present("licm"),
    reduce_regions: matches.is_present("reduce"),
    verify: true,
    ..Options::default()
  };
  let aa: &dyn AliasOracle = if matches.is_present("conservative") {
    &ConservativeAliasOracle
  } else {
    &BasicAliasOracle
  };

  let case = match (matches.value_of("test"), matches.value_of("file")) {
    (Some(name), _) => match find_test(name) {
      Ok(case) => case,
      Err(available) => {
        error!("can't find test case with name '{}'", name);
        println!("available test cases are:");
        for name in available {
          println!("     {}", name);
        }
        return;
      }
    },
    (None, Some(path)) => {
      match test_from_file(PathBuf::from(path), matches.value_of("entry")) {
        Ok(case) => case,
        Err(msg) => {
          error!("{}", msg);
          return;
        }
      }
    }
    (None, None) => unreachable!(),
  };

  let run = match run_case(&case, &opts, aa, true) {
    Ok(run) => run,
    Err(msg) => {
      println!("{}: FAILED: {}", case.name, msg);
      std::process::exit(1);
    }
  };

  print_report(&run.report);

  if let Some(path) = matches.value_of("dump") {
    match bincode::serialize(&run) {
      Ok(bytes) => {
        if let Err(err) = std::fs::write(path, bytes) {
          error!("can't write {}: {}", path, err);
        }
      }
      Err(err) => error!("can't encode the report: {}", err),
    }
  }
}

fn print_report(report: &ModuleReport) {
  println!("");
  for f in &report.functions {
    for r in &f.regions {
      let ptrs: Vec<String> = r.base_ptrs.iter().map(|p| p.name.clone()).collect();
      println!(
        "{}: region {}: {} ({})",
        f.name,
        r.name,
        if r.has_full_side_effect_info { "full info" } else { "partial info" },
        ptrs.join(", ")
      );
    }
    for v in &f.versioned {
      println!(
        "{}: versioned {}: {} check(s) in {}, copy at {}",
        f.name, v.region, v.checks, v.guard, v.clone_entry
      );
    }
  }
  println!(
    "{} region(s) cloned, {} of {} loop(s), {} check(s)",
    report.instrument_stats.cloned_regions,
    report.instrument_stats.cloned_loops,
    report.instrument_stats.total_loops,
    report.instrument_stats.pairwise_checks
  );
}

/// What `--dump` writes.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct CaseRun {
  case: String,
  report: ModuleReport,
  /// The versioned entry function's run on each layout.
  runs: Vec<(String, RunResult)>,
}

/// Versions the test case's module, then runs its entry function before and
/// after on every layout of the test case and compares the results.
fn run_case(
  case: &TestCase, opts: &Options, aa: &dyn AliasOracle, verbose: bool,
) -> Result<CaseRun, String> {
  let original = case.module.clone();
  for f in &original.funcs {
    validate(&original, f)?;
  }
  let mut module = original.clone();
  let report = run_on_module(&mut module, aa, opts).map_err(|e| e.to_string())?;
  if verbose {
    print!("{}", original);
    println!("");
    print!("{}", module);
  }

  let (before_f, after_f) = match (original.find_func(&case.entry), module.find_func(&case.entry)) {
    (Some(b), Some(a)) => (b, a),
    _ => return Err(format!("no function @{}", case.entry)),
  };
  let hoisted = report.functions.iter().any(|f| f.hoisted > 0);
  // Whether the guard picks a side at all.
  let versioned =
    report.functions.iter().any(|f| f.name == case.entry && !f.versioned.is_empty());

  let mut runs = vec![];
  for layout in &case.layouts {
    let before = run_func(&original, before_f, "before versioning", &layout.args);
    let after = run_versioned(&module, after_f, "after versioning", &layout.args, &report);
    check_results(&before, &after, hoisted).map_err(|msg| format!("{}: {}", layout.name, msg))?;

    if let Ok(after) = after {
      let ok = match layout.expect {
        PathExpect::Tagged => !versioned || after.tagged_accesses > 0,
        PathExpect::Untagged => after.tagged_accesses == 0,
        PathExpect::Either => true,
      };
      if !ok {
        return Err(format!(
          "{}: expected {:?}, ran {} tagged access(es)",
          layout.name, layout.expect, after.tagged_accesses
        ));
      }
      info!(
        "{}/{}: {} steps, {} tagged access(es)",
        case.name, layout.name, after.num_steps, after.tagged_accesses
      );
      if verbose {
        println!(
          "{}: {:?}, {} steps, {} tagged access(es)",
          layout.name, after.ret_value, after.num_steps, after.tagged_accesses
        );
      }
      runs.push((layout.name.to_string(), after));
    }
  }
  Ok(CaseRun { case: case.name.clone(), report, runs })
}

#[cfg(test)]
mod test_utils {
  use super::*;

  pub fn check_with(name: &str, opts: &Options) -> ModuleReport {
    let _ = pretty_env_logger::try_init();
    let case = find_test(name).unwrap();
    match run_case(&case, opts, &BasicAliasOracle, false) {
      Ok(run) => run.report,
      Err(msg) => panic!("{}: {}", name, msg),
    }
  }

  /// Checks every mode and pre-pass combination.  Returns the number of
  /// regions versioned with the default options.
  pub fn check(name: &str) -> u32 {
    let opts = Options { verify: true, ..Options::default() };
    let report = check_with(name, &opts);
    for mode in &[InstrumentationMode::Region, InstrumentationMode::Function] {
      for licm in &[false, true] {
        for reduce in &[false, true] {
          let opts = Options {
            mode: *mode,
            licm: *licm,
            reduce_regions: *reduce,
            verify: true,
            ..Options::default()
          };
          check_with(name, &opts);
        }
      }
    }
    let case = find_test(name).unwrap();
    let conservative = run_case(&case, &opts, &ConservativeAliasOracle, false);
    if let Err(msg) = conservative {
      panic!("{} with no alias info: {}", name, msg);
    }
    report.instrument_stats.cloned_regions
  }
}

#[test]
fn copy() {
  assert_eq!(test_utils::check("copy"), 1);
}

#[test]
fn saxpy() {
  assert_eq!(test_utils::check("saxpy"), 1);
}

#[test]
fn prefix_sum() {
  assert_eq!(test_utils::check("prefix_sum"), 1);
}

#[test]
fn shifted() {
  test_utils::check("shifted");
}

#[test]
fn reverse() {
  test_utils::check("reverse");
}

#[test]
fn matadd() {
  test_utils::check("matadd");
}

#[test]
fn scatter() {
  // The store address depends on a load: nothing to version.
  assert_eq!(test_utils::check("scatter"), 0);
}

#[test]
fn roots() {
  test_utils::check("roots");
}

#[test]
fn ticking_copy() {
  // The call writes memory the accesses don't describe.
  assert_eq!(test_utils::check("ticking_copy"), 0);
}

#[test]
fn from_table() {
  test_utils::check("from_table");
}

#[test]
fn guarded() {
  test_utils::check("guarded");
}

#[test]
fn staged() {
  test_utils::check("staged");
}

#[test]
fn clamp() {
  test_utils::check("clamp");
}

#[test]
fn stencil() {
  test_utils::check("stencil");
}

#[test]
fn strided() {
  test_utils::check("strided");
}

#[test]
fn transformed_modules_reparse() {
  let _ = pretty_env_logger::try_init();
  let case = find_test("prefix_sum").unwrap();
  let mut module = case.module.clone();
  let report = run_on_module(&mut module, &BasicAliasOracle, &Options::default()).unwrap();
  let printed = format!("{}", module);
  let reparsed = rfy::parser::parse_content(&printed).unwrap();
  let f1 = module.find_func("prefix_sum").unwrap();
  let f2 = reparsed.find_func("prefix_sum").unwrap();
  validate(&reparsed, f2).unwrap();
  for layout in &case.layouts {
    let r1 = run_versioned(&module, f1, "printed", &layout.args, &report).unwrap();
    let r2 = run_versioned(&reparsed, f2, "reparsed", &layout.args, &report).unwrap();
    assert_eq!(r1, r2);
  }
}

#[test]
fn dumps_survive_encoding() {
  let case = find_test("saxpy").unwrap();
  let run = run_case(&case, &Options::default(), &BasicAliasOracle, false).unwrap();
  let bytes = bincode::serialize(&run).unwrap();
  let decoded: CaseRun = bincode::deserialize(&bytes).unwrap();
  assert_eq!(decoded, run);
  let saxpy = decoded.report.functions.iter().find(|f| f.name == "saxpy").unwrap();
  assert_eq!(saxpy.versioned.len(), 1);
  let names: Vec<&str> = decoded.runs.iter().map(|(name, _)| name.as_str()).collect();
  assert_eq!(names, vec!["disjoint", "overlapping"]);
  assert!(decoded.runs[0].1.tagged_accesses > 0);
  assert_eq!(decoded.runs[1].1.tagged_accesses, 0);
}
