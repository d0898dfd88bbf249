#![no_main]
use libfuzzer_sys::fuzz_target;

use restrictify::{self, AnalysisError, BasicAliasOracle};
use rfy::fuzzing::Kernel;

fuzz_target!(|kernel: Kernel| {
    let mut module = kernel.module;

    let opts = restrictify::Options {
        mode: kernel.mode,
        licm: kernel.licm,
        verify: true,
        ..Default::default()
    };

    match restrictify::run_on_module(&mut module, &BasicAliasOracle, &opts) {
        Ok(report) => {
            let versioned: usize = report.functions.iter().map(|f| f.versioned.len()).sum();
            assert_eq!(versioned as u32, report.instrument_stats.cloned_regions);
        }
        Err(AnalysisError::VerifierFailed(msg)) => {
            panic!("versioning produced a malformed function: {}\n{}", msg, module);
        }
        Err(err) => {
            println!("analysis error: {}", err.to_string());
        }
    }
});
