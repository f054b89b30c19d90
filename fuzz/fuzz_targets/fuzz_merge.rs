//! Fuzz target for the merge step.
//!
//! Whatever the records and groups look like, every merged record carries
//! either all three derived fields or none of them.

#![no_main]

use arbitrary::Arbitrary;
use labstats_common::{CandidateRecord, StatGroup, LABSTATS_ID_KEY};
use labstats_core::merge::merge_records;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Spot {
    id: u32,
    join_key: Option<String>,
    stale_fields: u8,
}

#[derive(Debug, Arbitrary)]
struct Group {
    name: String,
    available: i64,
    total: i64,
    off: i64,
}

#[derive(Debug, Arbitrary)]
struct MergeInput {
    spots: Vec<Spot>,
    groups: Option<Vec<Group>>,
}

fuzz_target!(|input: MergeInput| {
    let records: Vec<CandidateRecord> = input
        .spots
        .iter()
        .map(|spot| {
            let mut record = CandidateRecord::new(u64::from(spot.id));
            if let Some(key) = &spot.join_key {
                record = record.with_info(LABSTATS_ID_KEY, key.as_str());
            }
            for key in labstats_common::AUGMENTED_KEYS
                .iter()
                .take(usize::from(spot.stale_fields % 4))
            {
                record = record.with_info(key, 1);
            }
            record
        })
        .collect();
    let groups: Option<Vec<StatGroup>> = input.groups.map(|groups| {
        groups
            .into_iter()
            .map(|g| StatGroup::new(g.name, g.available, g.total, g.off))
            .collect()
    });

    let count = records.len();
    let outcome = merge_records(records, groups.as_deref());
    assert_eq!(outcome.merged.len(), count);
    for merged in &outcome.merged {
        let present = merged.record().augmented_key_count();
        assert!(present == 0 || present == 3);
    }
});
