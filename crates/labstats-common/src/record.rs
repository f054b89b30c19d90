//! Spot records, labstats groups, and the merged/upload forms.
//!
//! A [`CandidateRecord`] comes from the spot API, a [`StatGroup`] from the
//! monitoring service. The only way to obtain a [`MergedRecord`] is through
//! [`MergedRecord::augmented`] or [`MergedRecord::degraded`], so a merged
//! record always carries either all three derived fields or none of them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordError;
use crate::id::SpotId;

/// Extended-info key joined against [`StatGroup::name`].
pub const LABSTATS_ID_KEY: &str = "labstats_id";

pub const AUTO_AVAILABLE_KEY: &str = "auto_labstats_available";
pub const AUTO_TOTAL_KEY: &str = "auto_labstats_total";
pub const AUTO_OFF_KEY: &str = "auto_labstats_off";

/// The derived extended-info fields, written and stripped as a unit.
pub const AUGMENTED_KEYS: [&str; 3] = [AUTO_AVAILABLE_KEY, AUTO_TOTAL_KEY, AUTO_OFF_KEY];

/// A spot flagged as having labstats data.
///
/// Fields other than `id` and `extended_info` are kept untouched in `rest`
/// so the uploaded document matches what was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: SpotId,
    #[serde(default)]
    pub extended_info: Map<String, Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl CandidateRecord {
    pub fn new(id: impl Into<SpotId>) -> Self {
        Self {
            id: id.into(),
            extended_info: Map::new(),
            rest: Map::new(),
        }
    }

    /// Builder-style extended-info insert.
    pub fn with_info(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extended_info.insert(key.to_string(), value.into());
        self
    }

    /// The join key. Must be present and a string.
    pub fn labstats_id(&self) -> Result<&str, RecordError> {
        match self.extended_info.get(LABSTATS_ID_KEY) {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(RecordError::InvalidJoinKey {
                spot: self.id.clone(),
                value: other.to_string(),
            }),
            None => Err(RecordError::MissingJoinKey {
                spot: self.id.clone(),
            }),
        }
    }

    /// How many of the three derived fields are currently present.
    pub fn augmented_key_count(&self) -> usize {
        AUGMENTED_KEYS
            .iter()
            .filter(|key| self.extended_info.contains_key(**key))
            .count()
    }

    fn apply_counts(&mut self, counts: GroupCounts) {
        self.extended_info
            .insert(AUTO_AVAILABLE_KEY.to_string(), Value::from(counts.available));
        self.extended_info
            .insert(AUTO_TOTAL_KEY.to_string(), Value::from(counts.total));
        self.extended_info
            .insert(AUTO_OFF_KEY.to_string(), Value::from(counts.off));
    }

    fn strip_counts(&mut self) {
        for key in AUGMENTED_KEYS {
            self.extended_info.remove(key);
        }
    }
}

/// One group as reported by the monitoring service.
///
/// Counts are kept as raw JSON so that one malformed group does not fail
/// the whole response; [`StatGroup::counts`] is where they are checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatGroup {
    #[serde(rename = "groupName")]
    pub name: String,
    #[serde(default)]
    pub available_count: Value,
    #[serde(default)]
    pub total_count: Value,
    #[serde(default)]
    pub off_count: Value,
}

impl StatGroup {
    pub fn new(name: impl Into<String>, available: i64, total: i64, off: i64) -> Self {
        Self {
            name: name.into(),
            available_count: Value::from(available),
            total_count: Value::from(total),
            off_count: Value::from(off),
        }
    }

    /// Validated, non-negative integer counts.
    pub fn counts(&self) -> Result<GroupCounts, RecordError> {
        let check = |label: &str, value: &Value| {
            let detail = match value {
                Value::Number(n) => match n.as_u64() {
                    Some(count) => return Ok(count),
                    None if n.as_i64().is_some() => format!("{label} count is negative ({n})"),
                    None => format!("{label} count is not an integer ({n})"),
                },
                Value::Null => format!("{label} count is missing"),
                other => format!("{label} count is not a number ({other})"),
            };
            Err(RecordError::InvalidCounts {
                group: self.name.clone(),
                detail,
            })
        };
        Ok(GroupCounts {
            available: check("available", &self.available_count)?,
            total: check("total", &self.total_count)?,
            off: check("off", &self.off_count)?,
        })
    }
}

/// Checked counts copied verbatim onto a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCounts {
    pub available: u64,
    pub total: u64,
    pub off: u64,
}

/// A record ready for upload, augmented or degraded.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    record: CandidateRecord,
    augmented: bool,
}

impl MergedRecord {
    /// Overwrite the three derived fields with `counts`.
    pub fn augmented(mut record: CandidateRecord, counts: GroupCounts) -> Self {
        record.apply_counts(counts);
        Self {
            record,
            augmented: true,
        }
    }

    /// Strip the three derived fields, whatever state they were in.
    pub fn degraded(mut record: CandidateRecord) -> Self {
        record.strip_counts();
        Self {
            record,
            augmented: false,
        }
    }

    pub fn is_augmented(&self) -> bool {
        self.augmented
    }

    pub fn record(&self) -> &CandidateRecord {
        &self.record
    }

    pub fn id(&self) -> &SpotId {
        &self.record.id
    }

    /// Serialize into the wire pair handed to the upload sink.
    pub fn to_upload_item(&self) -> Result<UploadItem, serde_json::Error> {
        Ok(UploadItem {
            data: serde_json::to_string(&self.record)?,
            id: self.record.id.clone(),
        })
    }
}

/// Wire-ready `(serialized record, original id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub data: String,
    pub id: SpotId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn lib101() -> CandidateRecord {
        CandidateRecord::new("42").with_info(LABSTATS_ID_KEY, "LIB101")
    }

    #[test]
    fn parses_spot_api_document() {
        let doc = json!({
            "id": 42,
            "name": "Odegaard 2nd floor",
            "extended_info": {"labstats_id": "LIB101", "has_labstats": "true"}
        });
        let record: CandidateRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(record.id, SpotId::from(42u64));
        assert_eq!(record.labstats_id().unwrap(), "LIB101");
        assert_eq!(record.rest["name"], "Odegaard 2nd floor");
    }

    #[test]
    fn missing_extended_info_defaults_to_empty() {
        let record: CandidateRecord = serde_json::from_value(json!({"id": 1})).unwrap();
        assert!(matches!(
            record.labstats_id(),
            Err(RecordError::MissingJoinKey { .. })
        ));
    }

    #[test]
    fn non_string_join_key_is_invalid() {
        let record = CandidateRecord::new("1").with_info(LABSTATS_ID_KEY, 17);
        assert!(matches!(
            record.labstats_id(),
            Err(RecordError::InvalidJoinKey { .. })
        ));
    }

    #[test]
    fn augment_copies_counts_verbatim() {
        let group = StatGroup::new("LIB101", 3, 10, 1);
        let merged = MergedRecord::augmented(lib101(), group.counts().unwrap());
        let info = &merged.record().extended_info;
        assert!(merged.is_augmented());
        assert_eq!(info[AUTO_AVAILABLE_KEY], 3);
        assert_eq!(info[AUTO_TOTAL_KEY], 10);
        assert_eq!(info[AUTO_OFF_KEY], 1);
        assert_eq!(info[LABSTATS_ID_KEY], "LIB101");
        assert_eq!(info.len(), 4);
    }

    #[test]
    fn degrade_strips_stale_fields() {
        let stale = lib101()
            .with_info(AUTO_AVAILABLE_KEY, 9)
            .with_info(AUTO_OFF_KEY, 0);
        let merged = MergedRecord::degraded(stale);
        assert!(!merged.is_augmented());
        assert_eq!(merged.record().augmented_key_count(), 0);
        assert_eq!(merged.record().extended_info.len(), 1);
    }

    #[test]
    fn negative_counts_rejected() {
        let group = StatGroup::new("LIB101", 3, -1, 0);
        let err = group.counts().unwrap_err();
        assert!(err.to_string().contains("total count is negative"));
    }

    #[test]
    fn malformed_counts_are_record_errors() {
        let cases = [
            (
                json!({"groupName": "G", "availableCount": null, "totalCount": 1, "offCount": 0}),
                "available count is missing",
            ),
            (
                json!({"groupName": "G", "availableCount": 1, "offCount": 0}),
                "total count is missing",
            ),
            (
                json!({"groupName": "G", "availableCount": 1, "totalCount": 2.5, "offCount": 0}),
                "total count is not an integer",
            ),
            (
                json!({"groupName": "G", "availableCount": 1, "totalCount": 2, "offCount": "0"}),
                "off count is not a number",
            ),
        ];
        for (doc, expected) in cases {
            let group: StatGroup = serde_json::from_value(doc).unwrap();
            match group.counts() {
                Err(RecordError::InvalidCounts { group, detail }) => {
                    assert_eq!(group, "G");
                    assert!(detail.contains(expected), "{detail}");
                }
                other => panic!("expected InvalidCounts, got {other:?}"),
            }
        }
    }

    #[test]
    fn stat_group_wire_names() {
        let group: StatGroup = serde_json::from_value(json!({
            "groupName": "LIB101",
            "availableCount": 3,
            "totalCount": 10,
            "offCount": 1
        }))
        .unwrap();
        assert_eq!(group, StatGroup::new("LIB101", 3, 10, 1));
    }

    #[test]
    fn upload_item_round_trips_record() {
        let merged = MergedRecord::degraded(lib101());
        let item = merged.to_upload_item().unwrap();
        assert_eq!(item.id, SpotId::from("42"));
        let back: CandidateRecord = serde_json::from_str(&item.data).unwrap();
        assert_eq!(&back, merged.record());
    }

    proptest! {
        #[test]
        fn merged_records_are_all_or_nothing(
            prior in proptest::collection::vec(any::<bool>(), 3),
            augment in any::<bool>(),
            available in 0i64..1000,
            total in 0i64..1000,
            off in 0i64..1000,
        ) {
            let mut record = lib101();
            for (key, present) in AUGMENTED_KEYS.iter().zip(prior) {
                if present {
                    record.extended_info.insert(key.to_string(), Value::from(5));
                }
            }
            let merged = if augment {
                let counts = StatGroup::new("LIB101", available, total, off).counts().unwrap();
                MergedRecord::augmented(record, counts)
            } else {
                MergedRecord::degraded(record)
            };
            let present = merged.record().augmented_key_count();
            prop_assert!(present == 0 || present == 3);
            prop_assert_eq!(present == 3, merged.is_augmented());
        }
    }
}
