//! In-memory cloud backend
//!
//! Holds objects in a map and counts every call, so tests can assert how
//! often the cache went upstream. Failures and slow downloads can be
//! injected.

use crate::backend::{ByteStream, CloudBackend, CloudEntry};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nimbus_common::{Checksum, Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    modified: DateTime<Utc>,
}

/// Cloud backend backed by a map
#[derive(Default)]
pub struct MemoryCloud {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    failing: AtomicBool,
    get_delay_ms: AtomicU64,
}

impl MemoryCloud {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting a call
    pub fn insert(&self, bucket: &str, object: &str, data: impl Into<Bytes>) {
        self.objects.write().insert(
            (bucket.to_string(), object.to_string()),
            StoredObject {
                data: data.into(),
                modified: Utc::now(),
            },
        );
    }

    /// Current content of an object, without counting a call
    #[must_use]
    pub fn object(&self, bucket: &str, object: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(bucket.to_string(), object.to_string()))
            .map(|o| o.data.clone())
    }

    /// Make every subsequent call fail with a cloud error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every download by `delay`
    pub fn set_get_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.get_delay_ms.store(ms, Ordering::SeqCst);
    }

    #[must_use]
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn lists(&self) -> u64 {
        self.lists.load(Ordering::SeqCst)
    }

    fn check_failing(&self, op: &str, bucket: &str, object: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::cloud(format!("{op} {bucket}/{object}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudBackend for MemoryCloud {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_obj(&self, bucket: &str, object: &str) -> Result<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_failing("get", bucket, object)?;

        let data = self.object(bucket, object).ok_or_else(|| Error::ObjectNotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })?;
        Ok(Box::pin(futures::stream::iter([Ok::<_, std::io::Error>(data)])))
    }

    async fn put_obj(&self, bucket: &str, object: &str, path: &Path, size: u64) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_failing("put", bucket, object)?;

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        if data.len() as u64 != size {
            return Err(Error::cloud(format!(
                "put {bucket}/{object}: expected {size} bytes, read {}",
                data.len()
            )));
        }
        self.insert(bucket, object, data);
        Ok(())
    }

    async fn delete_obj(&self, bucket: &str, object: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_failing("delete", bucket, object)?;

        self.objects
            .write()
            .remove(&(bucket.to_string(), object.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            })
    }

    async fn list_bucket(&self, bucket: &str) -> Result<Vec<CloudEntry>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check_failing("list", bucket, "")?;

        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, name), o)| CloudEntry {
                name: name.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.modified),
                etag: Checksum::compute(&o.data).to_hex(),
            })
            .collect())
    }
}
