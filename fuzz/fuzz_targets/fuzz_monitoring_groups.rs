//! Fuzz target for monitoring-service response parsing.

#![no_main]

use labstats_core::collab::monitoring::parse_groups;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(groups) = parse_groups(body) {
        for group in &groups {
            let _ = group.counts();
        }
    }
});
