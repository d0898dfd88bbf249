#![no_main]
use libfuzzer_sys::fuzz_target;

use restrictify::{self, BasicAliasOracle};
use rfy::{fuzzing::Kernel, test_framework, validator};

fuzz_target!(|kernel: Kernel| {
    let original = kernel.module.clone();
    let func = match original.find_func(&kernel.func) {
        Some(func) => func,
        None => return,
    };
    let expected = test_framework::run_func(&original, func, "before versioning", &kernel.args);

    let opts = restrictify::Options {
        mode: kernel.mode,
        licm: kernel.licm,
        verify: true,
        ..Default::default()
    };

    let mut module = kernel.module;
    let report = match restrictify::run_on_module(&mut module, &BasicAliasOracle, &opts) {
        Ok(report) => report,
        Err(err) => panic!("versioning failed: {}", err.to_string()),
    };
    let func = match module.find_func(&kernel.func) {
        Some(func) => func,
        None => panic!("versioning lost @{}", kernel.func),
    };
    let observed =
        test_framework::run_versioned(&module, func, "after versioning", &kernel.args, &report);

    if let Err(msg) = validator::check_results(&expected, &observed, kernel.licm) {
        panic!("{}\n{}", msg, module);
    }
});
