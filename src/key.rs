use std::{fmt, str::FromStr};

use crate::MetadataError;

pub const CLUSTER_NAME_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/cluster-name";
pub const CLUSTER_LOCATION_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes/cluster-location";
pub const INSTANCE_ZONE_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/zone";

/// Metadata fields the gateway is willing to serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    ClusterName,
    ClusterLocation,
    InstanceZone,
}

impl MetadataKey {
    pub const ALL: [MetadataKey; 3] = [
        MetadataKey::ClusterName,
        MetadataKey::ClusterLocation,
        MetadataKey::InstanceZone,
    ];

    /// Path segment and JSON field name for this key.
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataKey::ClusterName => "cluster-name",
            MetadataKey::ClusterLocation => "cluster-location",
            MetadataKey::InstanceZone => "instance-zone",
        }
    }

    /// Upstream metadata server URL.
    pub fn url(self) -> &'static str {
        match self {
            MetadataKey::ClusterName => CLUSTER_NAME_URL,
            MetadataKey::ClusterLocation => CLUSTER_LOCATION_URL,
            MetadataKey::InstanceZone => INSTANCE_ZONE_URL,
        }
    }

    /// Turns the raw upstream value into the value returned to callers.
    ///
    /// `instance-zone` comes back as `projects/<id>/zones/<zone>`; only the
    /// final segment is kept. The other keys pass through unchanged.
    pub fn normalize(self, raw: String) -> Result<String, MetadataError> {
        match self {
            MetadataKey::InstanceZone => match raw.rsplit('/').next() {
                Some(zone) if !zone.is_empty() => Ok(zone.to_owned()),
                _ => Err(MetadataError::MalformedResponse(format!(
                    "unexpected format for instance-zone metadata: {raw:?}"
                ))),
            },
            _ => Ok(raw),
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a path segment names no known [`MetadataKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metadata type: {0}")]
pub struct UnknownMetadataKey(pub String);

impl FromStr for MetadataKey {
    type Err = UnknownMetadataKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownMetadataKey(s.to_owned()))
    }
}
