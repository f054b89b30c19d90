//! Fuzz target for spot API candidate responses.
//!
//! Every readable record must survive join-key lookup, degrading and
//! re-serialization without panicking, and unreadable entries must never
//! take readable ones down with them.

#![no_main]

use labstats_common::MergedRecord;
use labstats_core::collab::spot_api::parse_candidates;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(batch) = parse_candidates(body) else {
        return;
    };
    if let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(body) {
        assert_eq!(batch.records.len() + batch.rejected.len(), entries.len());
    }
    for record in batch.records {
        let _ = record.labstats_id();
        let merged = MergedRecord::degraded(record);
        assert_eq!(merged.record().augmented_key_count(), 0);
        let _ = merged.to_upload_item();
    }
});
