//! Object GET, PUT and DELETE pipelines
//!
//! GET takes the name lock shared and serves a valid cached file right
//! away. Otherwise it retakes the lock exclusively, fetches the object from
//! the cloud into staging, commits it and downgrades before streaming, so
//! at most one cold fetch runs per key while cached reads stay parallel.
//!
//! PUT never writes the destination directly: content is staged, verified
//! and, for cloud buckets, uploaded before the exclusive rename.

use crate::stats::TargetStats;
use crate::target::Target;
use bytes::Bytes;
use futures::Stream;
use nimbus_common::{Checksum, Error, ObjectKey, Result};
use nimbus_storage::{NameLockGuard, ObjectAttrs, StagedFile, receive};
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// State of the cached file of a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cached {
    /// Servable; checksum known unless the file has no record
    Valid(Option<Checksum>),
    /// Absent or not trusted; cloud buckets fetch it again
    Stale,
}

/// File content streamed while the name lock is held shared
pub struct LockedStream {
    inner: ReaderStream<File>,
    _guard: NameLockGuard,
}

impl Stream for LockedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// An open object ready to be streamed
pub struct ObjectRead {
    pub size: u64,
    pub checksum: Option<Checksum>,
    pub body: LockedStream,
}

/// Result of a PUT or an incoming transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// New content committed
    Stored(Checksum),
    /// A valid copy with the same checksum was already present
    Unchanged(Checksum),
}

impl PutOutcome {
    #[must_use]
    pub const fn checksum(&self) -> Checksum {
        match self {
            Self::Stored(c) | Self::Unchanged(c) => *c,
        }
    }
}

impl Target {
    /// Validity of the file at `fqn`
    async fn check_cached(&self, key: &ObjectKey, fqn: &Path, is_local: bool) -> Result<Cached> {
        match tokio::fs::metadata(fqn).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(Error::invalid_request(format!("{key} is not an object"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if is_local {
                    return Err(Error::ObjectNotFound {
                        bucket: key.bucket().to_string(),
                        object: key.object().to_string(),
                    });
                }
                return Ok(Cached::Stale);
            }
            Err(e) => return Err(Error::from_io(e, fqn)),
        }

        match self.attrs.get(fqn)? {
            Some(attrs) if attrs.valid => Ok(Cached::Valid(Some(attrs.checksum))),
            Some(_) if is_local => Err(Error::InvalidObject(fqn.display().to_string())),
            None if is_local => Ok(Cached::Valid(None)),
            Some(_) | None => Ok(Cached::Stale),
        }
    }

    /// Whether a valid copy is present, matching `expected` when given
    pub(crate) async fn has_valid_copy(
        &self,
        key: &ObjectKey,
        fqn: &Path,
        expected: Option<Checksum>,
    ) -> Result<Option<Checksum>> {
        let _guard = self.lock_name(key, false, fqn).await?;
        if !tokio::fs::try_exists(fqn)
            .await
            .map_err(|e| Error::from_io(e, fqn))?
        {
            return Ok(None);
        }
        Ok(match self.attrs.get(fqn)? {
            Some(attrs) if attrs.valid && expected.is_none_or(|c| c == attrs.checksum) => {
                Some(attrs.checksum)
            }
            _ => None,
        })
    }

    /// Fetch `key` from the cloud and commit it as a valid file.
    /// The caller holds the exclusive name lock.
    async fn cold_get(&self, key: &ObjectKey, fqn: &Path) -> Result<Checksum> {
        let stream = self.cloud.get_obj(key.bucket(), key.object()).await?;
        let staged = receive(&self.mounts.staging_dir(key), stream).await?;
        let size = staged.size();

        self.attrs.remove(fqn)?;
        let checksum = staged.commit(fqn).await?;
        self.attrs.set(fqn, &ObjectAttrs::valid(checksum))?;

        TargetStats::inc(&self.stats().numcoldget);
        TargetStats::add(&self.stats().bytes_received, size);
        info!("Cold GET {key}: {size} bytes, checksum {checksum}");
        Ok(checksum)
    }

    async fn open_locked(
        fqn: &Path,
        checksum: Option<Checksum>,
        guard: NameLockGuard,
    ) -> Result<ObjectRead> {
        let file = File::open(fqn).await.map_err(|e| Error::from_io(e, fqn))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::from_io(e, fqn))?
            .len();
        Ok(ObjectRead {
            size,
            checksum,
            body: LockedStream {
                inner: ReaderStream::new(file),
                _guard: guard,
            },
        })
    }

    /// Open `key` for reading, fetching it from the cloud when the cached
    /// copy is missing or invalid
    pub async fn get_object(self: &Arc<Self>, key: &ObjectKey) -> Result<ObjectRead> {
        let (fqn, is_local) = self.fqn(key);
        TargetStats::inc(&self.stats().numget);

        let guard = self.lock_name(key, false, &fqn).await?;
        if let Cached::Valid(checksum) = self.check_cached(key, &fqn, is_local).await? {
            return Self::open_locked(&fqn, checksum, guard).await;
        }
        drop(guard);

        let mut guard = self.lock_name(key, true, &fqn).await?;
        let checksum = match self.check_cached(key, &fqn, is_local).await? {
            // Fetched by a concurrent request while we waited
            Cached::Valid(checksum) => checksum,
            Cached::Stale => {
                let checksum = self.cold_get(key, &fqn).await?;
                self.lru_after_cold_get();
                Some(checksum)
            }
        };
        guard.downgrade();
        Self::open_locked(&fqn, checksum, guard).await
    }

    /// Rename a verified staging file onto `fqn` under the exclusive lock
    pub(crate) async fn commit_staged(
        &self,
        key: &ObjectKey,
        fqn: &Path,
        staged: StagedFile,
    ) -> Result<Checksum> {
        let _guard = self.lock_name(key, true, fqn).await?;
        self.attrs.remove(fqn)?;
        let checksum = staged.commit(fqn).await?;
        self.attrs.set(fqn, &ObjectAttrs::valid(checksum))?;
        Ok(checksum)
    }

    /// Receive `body` into staging and verify it against `expected`
    pub(crate) async fn stage<S, E>(
        &self,
        key: &ObjectKey,
        expected: Option<Checksum>,
        body: S,
    ) -> Result<StagedFile>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut staged = receive(&self.mounts.staging_dir(key), body).await?;
        let actual = staged.finish().await?;
        if let Some(expected) = expected
            && expected != actual
        {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(staged)
    }

    /// Store `body` as the content of `key`
    pub async fn put_object<S, E>(
        &self,
        key: &ObjectKey,
        client_checksum: Option<Checksum>,
        body: S,
    ) -> Result<PutOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let (fqn, is_local) = self.fqn(key);

        if client_checksum.is_some()
            && let Some(existing) = self.has_valid_copy(key, &fqn, client_checksum).await?
        {
            debug!("PUT {key}: identical content already stored");
            return Ok(PutOutcome::Unchanged(existing));
        }

        let staged = self.stage(key, client_checksum, body).await?;
        let size = staged.size();
        if !is_local {
            self.cloud
                .put_obj(key.bucket(), key.object(), staged.path(), size)
                .await?;
        }
        let checksum = self.commit_staged(key, &fqn, staged).await?;

        TargetStats::inc(&self.stats().numput);
        TargetStats::add(&self.stats().bytes_received, size);
        debug!("PUT {key}: {size} bytes, checksum {checksum}");
        Ok(PutOutcome::Stored(checksum))
    }

    /// Delete `key` from the cloud (cloud buckets) and from local disk
    pub async fn delete_object(&self, key: &ObjectKey) -> Result<()> {
        let (fqn, is_local) = self.fqn(key);
        let _guard = self.lock_name(key, true, &fqn).await?;

        let mut upstream_missing = false;
        if !is_local {
            match self.cloud.delete_obj(key.bucket(), key.object()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => upstream_missing = true,
                Err(e) => return Err(e),
            }
        }

        match tokio::fs::remove_file(&fqn).await {
            Ok(()) => self.attrs.remove(&fqn)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if is_local || upstream_missing {
                    return Err(Error::ObjectNotFound {
                        bucket: key.bucket().to_string(),
                        object: key.object().to_string(),
                    });
                }
            }
            Err(e) => return Err(Error::from_io(e, &fqn)),
        }

        TargetStats::inc(&self.stats().numdelete);
        debug!("DELETE {key}");
        Ok(())
    }
}
