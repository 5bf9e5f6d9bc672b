#![no_main]

use libfuzzer_sys::fuzz_target;
use xactwatch_core::config::FileConfig;

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    let input = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return,
    };

    // Duration fields are parsed during deserialization; none of it may
    // panic.
    let _: Result<FileConfig, _> = toml::from_str(input);
});
