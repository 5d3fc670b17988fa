#![no_main]

use libfuzzer_sys::fuzz_target;
use panopticon::post;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Truncated streams are repaired before parsing; neither step may panic
        if let Ok(mut document) = post::parse_trace(input) {
            if let Some(events) = document.as_array_mut() {
                post::flatten_events(events);
            }
        }
    }
});
