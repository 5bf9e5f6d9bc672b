#![no_main]

use libfuzzer_sys::fuzz_target;
use xactwatch_core::config::parse_duration;

fuzz_target!(|data: &[u8]| {
    if data.len() > 256 {
        return;
    }

    let input = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return,
    };

    // Must never panic; overflow and garbage are config errors.
    let _ = parse_duration(input);
});
