//! HTTP client for the labstats monitoring service.
//!
//! One GET returns the grouped current stats, either as a bare JSON array
//! of groups or wrapped as `{"GroupStat": [...]}`.

use std::time::Duration;

use labstats_common::StatGroup;
use labstats_config::DaemonSettings;
use serde::Deserialize;
use serde_json::Value;

use super::{CallFailure, CollaboratorError, StatsSource};

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupedStats {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(rename = "GroupStat")]
        group_stat: Vec<Value>,
    },
}

impl GroupedStats {
    fn into_entries(self) -> Vec<Value> {
        match self {
            GroupedStats::Bare(entries) => entries,
            GroupedStats::Wrapped { group_stat } => group_stat,
        }
    }
}

/// Parse a monitoring-service response body.
///
/// Only the envelope must be well formed. Entries without a string
/// `groupName` are dropped since no record can join them; bad counts are
/// left for [`StatGroup::counts`] to report against the records that use
/// the group.
pub fn parse_groups(body: &str) -> Result<Vec<StatGroup>, serde_json::Error> {
    let entries = serde_json::from_str::<GroupedStats>(body)?.into_entries();
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

pub struct MonitoringClient {
    agent: ureq::Agent,
    url: String,
}

impl MonitoringClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        MonitoringClient {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.into(),
        }
    }

    pub fn from_settings(settings: &DaemonSettings) -> Self {
        Self::new(&settings.labstats_url, settings.request_timeout)
    }
}

impl StatsSource for MonitoringClient {
    fn fetch_groups(&self) -> Result<Vec<StatGroup>, CollaboratorError> {
        let response = self
            .agent
            .get(&self.url)
            .set("Accept", "application/json")
            .call()
            .map_err(|e| CollaboratorError::Monitoring(e.into()))?;
        let body = response
            .into_string()
            .map_err(|e| CollaboratorError::Monitoring(CallFailure::Transport(e.to_string())))?;
        parse_groups(&body)
            .map_err(|e| CollaboratorError::Monitoring(CallFailure::Decode(e.to_string())))
    }
}
