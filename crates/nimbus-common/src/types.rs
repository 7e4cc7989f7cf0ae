//! Core type definitions for Nimbus
//!
//! Object identity, cluster membership snapshots, and the JSON control
//! structures of the REST API.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// REST API version prefix
pub const API_VERSION: &str = "v1";

/// `/v1/files` - object and bucket operations
pub const PATH_FILES: &str = "files";
/// `/v1/daemon` - control plane of a single target
pub const PATH_DAEMON: &str = "daemon";
/// `/v1/cluster` - coordinator registration endpoint
pub const PATH_CLUSTER: &str = "cluster";
/// Rebalance transfer source marker: `/v1/files/from_id/{id}/...`
pub const PATH_FROM: &str = "from_id";
/// Rebalance transfer destination marker: `.../to_id/{id}/...`
pub const PATH_TO: &str = "to_id";

/// Logical identity of an object: a flat (bucket, object) pair
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    bucket: String,
    object: String,
}

impl ObjectKey {
    /// Create a validated key.
    ///
    /// Bucket names are a single path component; object names may contain
    /// `/` but must stay inside the bucket directory.
    pub fn new(
        bucket: impl Into<String>,
        object: impl Into<String>,
    ) -> Result<Self, ObjectKeyError> {
        let bucket = bucket.into();
        let object = object.into();
        validate_bucket(&bucket)?;
        if object.is_empty() {
            return Err(ObjectKeyError::EmptyObject);
        }
        if object.starts_with('/') {
            return Err(ObjectKeyError::AbsoluteObject(object));
        }
        if object.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(ObjectKeyError::InvalidComponent(object));
        }
        Ok(Self { bucket, object })
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    /// `bucket/object` - the string hashed for placement
    #[must_use]
    pub fn uname(&self) -> String {
        format!("{}/{}", self.bucket, self.object)
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({}/{})", self.bucket, self.object)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// Validate a bucket name: non-empty single path component
pub fn validate_bucket(bucket: &str) -> Result<(), ObjectKeyError> {
    if bucket.is_empty() {
        return Err(ObjectKeyError::EmptyBucket);
    }
    if bucket.contains('/') {
        return Err(ObjectKeyError::BucketContainsSlash(bucket.to_string()));
    }
    if bucket == "." || bucket == ".." || bucket.starts_with('.') {
        return Err(ObjectKeyError::InvalidComponent(bucket.to_string()));
    }
    Ok(())
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("bucket name is empty")]
    EmptyBucket,
    #[error("invalid bucket name {0} (contains '/')")]
    BucketContainsSlash(String),
    #[error("object name is empty")]
    EmptyObject,
    #[error("object name {0} must be relative")]
    AbsoluteObject(String),
    #[error("invalid path component in {0}")]
    InvalidComponent(String),
}

impl From<ObjectKeyError> for crate::Error {
    fn from(e: ObjectKeyError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// Identity and endpoint of one daemon in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub daemon_id: String,
    /// Base URL peers use to reach the daemon directly
    pub direct_url: String,
}

/// Cluster map: versioned membership snapshot pushed by the coordinator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    #[serde(default)]
    pub targets: HashMap<String, DaemonInfo>,
}

impl Smap {
    /// Look up a target by id
    #[must_use]
    pub fn get(&self, daemon_id: &str) -> Option<&DaemonInfo> {
        self.targets.get(daemon_id)
    }

    #[must_use]
    pub fn contains(&self, daemon_id: &str) -> bool {
        self.targets.contains_key(daemon_id)
    }

    /// Every target of `self` is also present in `other`
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.targets.keys().all(|id| other.targets.contains_key(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Local bucket map: versioned set of cluster-only buckets
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBucketMap {
    pub version: u64,
    #[serde(default)]
    pub buckets: BTreeSet<String>,
}

impl LocalBucketMap {
    #[must_use]
    pub fn contains(&self, bucket: &str) -> bool {
        self.buckets.contains(bucket)
    }

    /// Buckets present here but absent from `newer`
    pub fn removed_in<'a>(&'a self, newer: &'a Self) -> impl Iterator<Item = &'a String> + 'a {
        self.buckets.difference(&newer.buckets)
    }
}

/// Action enum carried in [`ActionMsg::action`]
pub mod actions {
    pub const SHUTDOWN: &str = "shutdown";
    pub const SYNC_SMAP: &str = "syncsmap";
    pub const REBALANCE: &str = "rebalance";
    pub const LRU: &str = "lru";
    pub const SYNC_LB: &str = "synclb";
    pub const SET_CONFIG: &str = "setconfig";
}

/// Generic control message: `{action, name, value}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMsg {
    pub action: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// [`GetMsg::what`] selectors
pub mod get_what {
    pub const FILE: &str = "file";
    pub const CONFIG: &str = "config";
    pub const SMAP: &str = "smap";
    pub const STATS: &str = "stats";
}

/// [`GetMsg::props`] selectors
pub mod get_props {
    pub const CHECKSUM: &str = "checksum";
    pub const SIZE: &str = "size";
    pub const ATIME: &str = "atime";
    pub const CTIME: &str = "ctime";
    pub const IS_CACHED: &str = "iscached";
    pub const BUCKET: &str = "bucket";
}

/// Query message for GET requests
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetMsg {
    /// "config" | "smap" | "stats" | "file"
    pub what: String,
    /// e.g. "ascending, atime" | "descending, name"
    pub sort: String,
    /// e.g. "checksum, size" | "atime, size" | "ctime, iscached"
    pub props: String,
    /// "RFC822" (default), "Stamp", "StampMilli", "RFC822Z", "RFC1123", "RFC1123Z", "RFC3339"
    pub time_format: String,
}

impl GetMsg {
    /// Whether `prop` was requested
    #[must_use]
    pub fn wants(&self, prop: &str) -> bool {
        self.props
            .split(',')
            .any(|p| p.trim().eq_ignore_ascii_case(prop))
    }
}

/// One entry of a bucket listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntry {
    /// Object name, without the bucket
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub ctime: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub atime: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub iscached: bool,
}

/// Result of a bucket listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketList {
    pub entries: Vec<BucketEntry>,
}
