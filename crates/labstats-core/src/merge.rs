//! Join candidate records with labstats groups.
//!
//! Every candidate comes out as exactly one [`MergedRecord`]: augmented when
//! its group was found with valid counts, degraded otherwise. A failure on
//! one record never affects the others.

use std::collections::HashMap;

use labstats_common::{CandidateRecord, MergedRecord, RecordError, StatGroup};

/// Result of merging one batch.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// One entry per candidate, in fetch order.
    pub merged: Vec<MergedRecord>,
    /// Why individual records were degraded. Empty when the stats fetch
    /// failed as a whole; that case degrades everything without a per-record
    /// cause.
    pub record_errors: Vec<RecordError>,
    /// Whether group statistics were available for this batch.
    pub stats_available: bool,
}

impl MergeOutcome {
    pub fn augmented_count(&self) -> usize {
        self.merged.iter().filter(|m| m.is_augmented()).count()
    }

    pub fn degraded_count(&self) -> usize {
        self.merged.len() - self.augmented_count()
    }
}

/// Group lookup by name. The first group with a given name wins.
pub fn index_groups(groups: &[StatGroup]) -> HashMap<&str, &StatGroup> {
    let mut index = HashMap::with_capacity(groups.len());
    for group in groups {
        index.entry(group.name.as_str()).or_insert(group);
    }
    index
}

/// Merge one record against an index.
pub fn merge_one(
    record: CandidateRecord,
    index: &HashMap<&str, &StatGroup>,
) -> (MergedRecord, Option<RecordError>) {
    let counts = record.labstats_id().and_then(|labstats_id| {
        let group = index
            .get(labstats_id)
            .ok_or_else(|| RecordError::NoMatchingGroup {
                spot: record.id.clone(),
                group: labstats_id.to_string(),
            })?;
        group.counts()
    });

    match counts {
        Ok(counts) => (MergedRecord::augmented(record, counts), None),
        Err(e) => (MergedRecord::degraded(record), Some(e)),
    }
}

/// Merge a batch. `groups` is `None` when the stats fetch failed, which
/// degrades every record.
pub fn merge_records(
    candidates: Vec<CandidateRecord>,
    groups: Option<&[StatGroup]>,
) -> MergeOutcome {
    let Some(groups) = groups else {
        return MergeOutcome {
            merged: candidates.into_iter().map(MergedRecord::degraded).collect(),
            record_errors: Vec::new(),
            stats_available: false,
        };
    };

    let index = index_groups(groups);
    let mut outcome = MergeOutcome {
        merged: Vec::with_capacity(candidates.len()),
        record_errors: Vec::new(),
        stats_available: true,
    };
    for record in candidates {
        let (merged, error) = merge_one(record, &index);
        outcome.merged.push(merged);
        outcome.record_errors.extend(error);
    }
    outcome
}
