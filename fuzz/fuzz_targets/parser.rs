#![no_main]
use libfuzzer_sys::fuzz_target;

use rfy::{parser, validator};

fuzz_target!(|data: &[u8]| {
    let source = match std::str::from_utf8(data) {
        Ok(source) => source,
        Err(_) => return,
    };
    let module = match parser::parse_content(source) {
        Ok(module) => module,
        Err(_) => return,
    };
    for func in &module.funcs {
        if validator::validate(&module, func).is_err() {
            return;
        }
    }

    // Printing is stable once names have been through the parser.
    let printed = format!("{}", module);
    let reparsed = match parser::parse_content(&printed) {
        Ok(module) => module,
        Err(err) => panic!("can't reparse a printed module: {}\n{}", err.to_string(), printed),
    };
    assert_eq!(printed, format!("{}", reparsed));
});
