//! The cloud backend interface

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use nimbus_common::Result;
use std::path::Path;
use std::pin::Pin;

/// Object content streamed from a backend
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One object reported by a backend listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudEntry {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Vendor content tag (ETag or MD5), passed through as the listing checksum
    pub etag: String,
}

/// Authoritative store for objects of cloud buckets
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Short vendor name for logs
    fn name(&self) -> &'static str;

    /// Stream the content of an object.
    ///
    /// A missing object is [`nimbus_common::Error::ObjectNotFound`].
    async fn get_obj(&self, bucket: &str, object: &str) -> Result<ByteStream>;

    /// Upload the file at `path` (of `size` bytes) as the object content
    async fn put_obj(&self, bucket: &str, object: &str, path: &Path, size: u64) -> Result<()>;

    async fn delete_obj(&self, bucket: &str, object: &str) -> Result<()>;

    /// Every object of `bucket`, in backend order
    async fn list_bucket(&self, bucket: &str) -> Result<Vec<CloudEntry>>;
}
