//! Dataset descriptors and the messages that flow between pipeline stages.
//!
//! A [`DatasetDescriptor`] is static configuration. On every schedule tick it
//! is serialized into a [`FetchRequest`] for the trigger bus; after a durable
//! landing write the ingestion worker emits a [`LandedObjectEvent`] for the
//! notification bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Where a fetched dataset lands inside its bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectTarget {
    /// One object with exactly this name.
    Exact(String),
    /// One or more objects named `prefix + suffix`, suffixes chosen by the fetcher.
    Prefix(String),
}

impl ObjectTarget {
    /// Resolve the landing object name for a fetched part.
    pub fn object_name(&self, suffix: &str) -> String {
        match self {
            Self::Exact(name) => name.clone(),
            Self::Prefix(prefix) => format!("{prefix}{suffix}"),
        }
    }
}

/// Static description of a public dataset and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorWire", into = "DescriptorWire")]
pub struct DatasetDescriptor {
    /// Dataset identifier, unique across the system. Also names its warehouse table.
    pub id: String,
    pub source_url: Option<String>,
    pub landing_bucket: String,
    pub target: ObjectTarget,
}

impl DatasetDescriptor {
    pub fn new(
        id: impl Into<String>,
        source_url: Option<String>,
        landing_bucket: impl Into<String>,
        target: ObjectTarget,
    ) -> Result<Self, CoreError> {
        DescriptorWire::from(Self {
            id: id.into(),
            source_url,
            landing_bucket: landing_bucket.into(),
            target,
        })
        .try_into()
    }
}

/// JSON shape of a descriptor on the trigger bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorWire {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    gcs_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fileprefix: Option<String>,
}

impl TryFrom<DescriptorWire> for DatasetDescriptor {
    type Error = CoreError;

    fn try_from(wire: DescriptorWire) -> Result<Self, Self::Error> {
        if wire.id.trim().is_empty() {
            return Err(CoreError::InvalidDescriptor("id must not be empty".into()));
        }
        if wire.gcs_bucket.trim().is_empty() {
            return Err(CoreError::InvalidDescriptor(format!(
                "dataset '{}' has an empty gcs_bucket",
                wire.id
            )));
        }
        let target = match (wire.filename, wire.fileprefix) {
            (Some(name), None) if !name.is_empty() => ObjectTarget::Exact(name),
            (None, Some(prefix)) if !prefix.is_empty() => ObjectTarget::Prefix(prefix),
            (Some(_), Some(_)) => {
                return Err(CoreError::InvalidDescriptor(format!(
                    "dataset '{}' sets both filename and fileprefix",
                    wire.id
                )))
            }
            _ => {
                return Err(CoreError::InvalidDescriptor(format!(
                    "dataset '{}' needs a non-empty filename or fileprefix",
                    wire.id
                )))
            }
        };
        Ok(Self {
            id: wire.id,
            source_url: wire.url.filter(|u| !u.is_empty()),
            landing_bucket: wire.gcs_bucket,
            target,
        })
    }
}

impl From<DatasetDescriptor> for DescriptorWire {
    fn from(d: DatasetDescriptor) -> Self {
        let (filename, fileprefix) = match d.target {
            ObjectTarget::Exact(name) => (Some(name), None),
            ObjectTarget::Prefix(prefix) => (None, Some(prefix)),
        };
        Self {
            id: d.id,
            url: d.source_url,
            gcs_bucket: d.landing_bucket,
            filename,
            fileprefix,
        }
    }
}

/// Trigger bus payload: a serialized descriptor, produced once per schedule tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchRequest(pub DatasetDescriptor);

impl FetchRequest {
    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.0
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Notification bus payload, emitted only after the landing write is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandedObjectEvent {
    pub bucket: String,
    pub object_name: String,
    pub dataset_id: String,
    /// When the landing write became durable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landed_at: Option<DateTime<Utc>>,
}

impl LandedObjectEvent {
    pub fn source_uri(&self) -> ObjectUri {
        ObjectUri {
            bucket: self.bucket.clone(),
            object_name: self.object_name.clone(),
        }
    }
}

/// Fully qualified landing object address, rendered as `bucket/object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectUri {
    pub bucket: String,
    pub object_name: String,
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object_name)
    }
}

/// A warehouse table address, rendered as `dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fetch_request_with_filename() {
        let body = r#"{"id":"HOUSEHOLD_INCOME","url":"https://api.census.gov/data/timeseries/poverty/saipe","gcs_bucket":"landing","filename":"SAIPE"}"#;
        let req = FetchRequest::from_json(body).unwrap();
        let d = req.descriptor();
        assert_eq!(d.id, "HOUSEHOLD_INCOME");
        assert_eq!(d.landing_bucket, "landing");
        assert_eq!(d.target, ObjectTarget::Exact("SAIPE".into()));
        assert_eq!(d.target.object_name("-ignored"), "SAIPE");
    }

    #[test]
    fn decodes_fileprefix_without_url() {
        let body = r#"{"id":"COUNTY_NAMES","gcs_bucket":"landing","fileprefix":"county-"}"#;
        let d = FetchRequest::from_json(body).unwrap().0;
        assert!(d.source_url.is_none());
        assert_eq!(d.target.object_name("06"), "county-06");
    }

    #[test]
    fn rejects_both_filename_and_prefix() {
        let body = r#"{"id":"X","gcs_bucket":"b","filename":"a","fileprefix":"p"}"#;
        let err = FetchRequest::from_json(body).unwrap_err();
        assert!(err.to_string().contains("both filename and fileprefix"));
    }

    #[test]
    fn rejects_missing_target() {
        let body = r#"{"id":"X","gcs_bucket":"b"}"#;
        assert!(FetchRequest::from_json(body).is_err());
    }

    #[test]
    fn serializes_back_to_wire_field_names() {
        let d = DatasetDescriptor::new(
            "HOUSEHOLD_INCOME",
            Some("https://example.org".into()),
            "landing",
            ObjectTarget::Exact("SAIPE".into()),
        )
        .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&FetchRequest(d).to_json().unwrap()).unwrap();
        assert_eq!(json["gcs_bucket"], "landing");
        assert_eq!(json["filename"], "SAIPE");
        assert!(json.get("fileprefix").is_none());
    }

    #[test]
    fn landed_event_source_uri_display() {
        let event = LandedObjectEvent {
            bucket: "landing".into(),
            object_name: "SAIPE".into(),
            dataset_id: "HOUSEHOLD_INCOME".into(),
            landed_at: None,
        };
        assert_eq!(event.source_uri().to_string(), "landing/SAIPE");
    }
}
