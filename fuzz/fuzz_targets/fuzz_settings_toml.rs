//! Fuzz target for daemon.toml parsing and run validation.
//!
//! Parsing and validation should only ever return errors, never panic.

#![no_main]

use labstats_config::{validate_for_run, Settings};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(settings) = Settings::from_toml_str(content) {
        let _ = settings.marker_dir();
        let _ = validate_for_run(&settings);
    }
});
