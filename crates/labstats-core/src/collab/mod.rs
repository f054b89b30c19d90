//! External collaborators of the polling loop.
//!
//! The loop only sees the three traits here; the HTTP implementations live
//! in [`spot_api`] and [`monitoring`], and request signing in [`signer`].
//! Tests substitute in-memory fakes.

pub mod monitoring;
pub mod signer;
pub mod spot_api;

pub use monitoring::MonitoringClient;
pub use signer::{OAuth1Signer, RequestSigner};
pub use spot_api::SpotApiClient;

use labstats_common::{CandidateRecord, RecordError, SpotId, StatGroup, UploadItem};
use serde::Serialize;
use thiserror::Error;

/// How a single call to a collaborator failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// Connection, DNS, TLS, or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// The response body was not what we expected.
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl From<ureq::Error> for CallFailure {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => CallFailure::Status {
                status,
                url: response.get_url().to_string(),
            },
            ureq::Error::Transport(transport) => CallFailure::Transport(transport.to_string()),
        }
    }
}

/// Failure of one collaborator, tagged with which one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("spot API: {0}")]
    SpotApi(CallFailure),

    #[error("monitoring service: {0}")]
    Monitoring(CallFailure),

    #[error("upload: {0}")]
    Upload(CallFailure),
}

impl CollaboratorError {
    /// Short label for logs and metrics.
    pub fn source_name(&self) -> &'static str {
        match self {
            CollaboratorError::SpotApi(_) => "spot_api",
            CollaboratorError::Monitoring(_) => "monitoring",
            CollaboratorError::Upload(_) => "upload",
        }
    }
}

impl From<CollaboratorError> for labstats_common::Error {
    fn from(err: CollaboratorError) -> Self {
        labstats_common::Error::Collaborator(err.to_string())
    }
}

/// Candidates from one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateBatch {
    pub records: Vec<CandidateRecord>,
    /// Entries that could not be read; they are left out of the cycle.
    pub rejected: Vec<RecordError>,
}

/// Source of candidate records.
pub trait SpotSource {
    /// Records flagged as having labstats data.
    ///
    /// `Err` only when the response as a whole is unusable.
    fn fetch_candidates(&self) -> Result<CandidateBatch, CollaboratorError>;
}

/// Source of live group statistics.
pub trait StatsSource {
    fn fetch_groups(&self) -> Result<Vec<StatGroup>, CollaboratorError>;
}

/// Destination for merged records.
pub trait UploadSink {
    /// Upload one batch, one attempt per item.
    ///
    /// `Err` means nothing was uploaded; per-item failures are reported in
    /// the [`UploadReport`].
    fn upload(&self, items: &[UploadItem]) -> Result<UploadReport, CollaboratorError>;
}

/// One item the sink could not store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadFailure {
    pub id: SpotId,
    pub error: String,
}

/// Outcome of one batch upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failures: Vec<UploadFailure>,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.uploaded == self.attempted
    }
}
