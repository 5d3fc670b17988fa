#![no_main]

use libfuzzer_sys::fuzz_target;
use panopticon::predicate::Predicate;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = Predicate::from_expr(input);
    }
});
