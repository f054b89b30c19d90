//! HTTP client for the spot API: candidate fetch and per-spot upload.

use std::time::Duration;

use labstats_common::{CandidateRecord, RecordError, SpotId, UploadItem};
use labstats_config::DaemonSettings;
use serde_json::Value;

use super::signer::{percent_encode, OAuth1Signer, RequestSigner};
use super::{
    CallFailure, CandidateBatch, CollaboratorError, SpotSource, UploadFailure, UploadReport,
    UploadSink,
};

/// Query selecting spots that carry labstats data.
pub const CANDIDATE_QUERY: &str = "extended_info:has_labstats=true";

const USER_AGENT: &str = concat!("labstats/", env!("CARGO_PKG_VERSION"));

/// Parse a candidate listing.
///
/// The body must be a JSON array; each element is read on its own so one
/// bad entry is rejected without losing the rest of the batch.
pub fn parse_candidates(body: &str) -> Result<CandidateBatch, serde_json::Error> {
    let entries: Vec<Value> = serde_json::from_str(body)?;
    let mut batch = CandidateBatch::default();
    for entry in entries {
        let spot = match entry.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(id) => id.to_string(),
            None => "<no id>".to_string(),
        };
        match serde_json::from_value::<CandidateRecord>(entry) {
            Ok(record) => batch.records.push(record),
            Err(e) => batch.rejected.push(RecordError::MalformedCandidate {
                spot,
                detail: e.to_string(),
            }),
        }
    }
    Ok(batch)
}

/// Signed client for one spot API server.
pub struct SpotApiClient {
    agent: ureq::Agent,
    base_url: String,
    signer: Box<dyn RequestSigner>,
}

impl SpotApiClient {
    /// `base_url` without a trailing slash.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        signer: Box<dyn RequestSigner>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        SpotApiClient {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signer,
        }
    }

    pub fn from_settings(settings: &DaemonSettings) -> Self {
        let signer = OAuth1Signer::new(&settings.oauth_key, &settings.oauth_secret)
            .with_method(settings.signature_method);
        Self::new(
            &settings.server_host,
            settings.request_timeout,
            Box::new(signer),
        )
    }

    pub fn candidates_url(&self) -> String {
        format!("{}/api/v1/spot/?{}", self.base_url, CANDIDATE_QUERY)
    }

    pub fn spot_url(&self, id: &SpotId) -> String {
        format!(
            "{}/api/v1/spot/{}",
            self.base_url,
            percent_encode(&id.as_path_segment())
        )
    }

    fn get(&self, url: &str) -> Result<ureq::Response, CallFailure> {
        let response = self
            .agent
            .get(url)
            .set("Accept", "application/json")
            .set("Authorization", &self.signer.authorization("GET", url))
            .call()?;
        Ok(response)
    }

    /// Fetch the spot's ETag, then PUT the document guarded by it.
    fn upload_one(&self, item: &UploadItem) -> Result<(), CallFailure> {
        let url = self.spot_url(&item.id);
        let current = self.get(&url)?;
        let etag = current.header("ETag").map(str::to_string);

        let mut request = self
            .agent
            .put(&url)
            .set("Content-Type", "application/json")
            .set("Authorization", &self.signer.authorization("PUT", &url));
        if let Some(etag) = etag.as_deref() {
            request = request.set("If-Match", etag);
        }
        request.send_string(&item.data)?;
        Ok(())
    }
}

impl SpotSource for SpotApiClient {
    fn fetch_candidates(&self) -> Result<CandidateBatch, CollaboratorError> {
        let url = self.candidates_url();
        let response = self.get(&url).map_err(CollaboratorError::SpotApi)?;
        let body = response
            .into_string()
            .map_err(|e| CollaboratorError::SpotApi(CallFailure::Transport(e.to_string())))?;
        parse_candidates(&body)
            .map_err(|e| CollaboratorError::SpotApi(CallFailure::Decode(e.to_string())))
    }
}

impl UploadSink for SpotApiClient {
    fn upload(&self, items: &[UploadItem]) -> Result<UploadReport, CollaboratorError> {
        let mut report = UploadReport {
            attempted: items.len(),
            ..UploadReport::default()
        };
        for item in items {
            match self.upload_one(item) {
                Ok(()) => report.uploaded += 1,
                Err(e) => report.failures.push(UploadFailure {
                    id: item.id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }
}
