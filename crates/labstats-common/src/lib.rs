//! Labstats daemon common types, identities, and errors.
//!
//! This crate provides the domain types shared by the config and core crates:
//! - Instance and spot identity types
//! - Candidate records, stat groups, and the all-or-nothing merged record
//! - The error taxonomy used to decide what is fatal and what degrades

pub mod error;
pub mod id;
pub mod record;

pub use error::{Error, ErrorCategory, RecordError, Result};
pub use id::{InstanceId, SpotId};
pub use record::{
    CandidateRecord, GroupCounts, MergedRecord, StatGroup, UploadItem, AUGMENTED_KEYS,
    AUTO_AVAILABLE_KEY, AUTO_OFF_KEY, AUTO_TOTAL_KEY, LABSTATS_ID_KEY,
};
