//! Staged object writes
//!
//! Incoming content is written to a uniquely named file in the staging
//! directory of the destination mount path while its checksum is
//! computed. The file becomes visible only when [`StagedFile::commit`]
//! renames it onto the destination. An uncommitted staging file is removed
//! when dropped.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use nimbus_common::{Checksum, ChecksumCalculator, Error, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// A staging file being written
pub struct StagedFile {
    path: PathBuf,
    file: Option<File>,
    calc: ChecksumCalculator,
    size: u64,
    checksum: Option<Checksum>,
    done: bool,
}

impl StagedFile {
    /// Create an empty staging file in `staging_dir`
    pub async fn create(staging_dir: &Path) -> Result<Self> {
        let path = staging_dir.join(Uuid::new_v4().to_string());
        let file = File::create(&path)
            .await
            .map_err(|e| Error::from_io(e, &path))?;
        Ok(Self {
            path,
            file: Some(file),
            calc: ChecksumCalculator::new(),
            size: 0,
            checksum: None,
            done: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Append a chunk
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::internal("write to a finished staging file"));
        };
        file.write_all(chunk)
            .await
            .map_err(|e| Error::from_io(e, &self.path))?;
        self.calc.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush to disk, close the file, and return the content checksum
    pub async fn finish(&mut self) -> Result<Checksum> {
        if let Some(checksum) = self.checksum {
            return Ok(checksum);
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| Error::from_io(e, &self.path))?;
            file.sync_all()
                .await
                .map_err(|e| Error::from_io(e, &self.path))?;
        }
        let checksum = std::mem::take(&mut self.calc).finalize();
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// Atomically rename onto `dest`, replacing any previous file
    pub async fn commit(mut self, dest: &Path) -> Result<Checksum> {
        let checksum = self.finish().await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(e, parent))?;
        }
        fs::rename(&self.path, dest)
            .await
            .map_err(|e| Error::from_io(e, dest))?;
        self.done = true;
        debug!("Committed {} -> {}", self.path.display(), dest.display());
        Ok(checksum)
    }

    /// Remove the staging file
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!("Failed to remove staging file {}: {e}", self.path.display());
        }
        self.done = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove staging file {}: {e}", self.path.display());
            }
        }
    }
}

impl std::fmt::Debug for StagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Drain `stream` into a new staging file and finish it
pub async fn receive<S, E>(staging_dir: &Path, mut stream: S) -> Result<StagedFile>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut staged = StagedFile::create(staging_dir).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Transfer(format!("receive stream: {e}")))?;
        staged.write(&chunk).await?;
    }
    staged.finish().await?;
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_commit_is_atomic_replace() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("ns/b/o");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let mut staged = StagedFile::create(dir.path()).await.unwrap();
        staged.write(b"new ").await.unwrap();
        staged.write(b"content").await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");

        let staging_path = staged.path().to_path_buf();
        let checksum = staged.commit(&dest).await.unwrap();
        assert_eq!(checksum, Checksum::compute(b"new content"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"new content");
        assert!(!staging_path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_staging() {
        let dir = tempdir().unwrap();
        let mut staged = StagedFile::create(dir.path()).await.unwrap();
        staged.write(b"partial").await.unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());

        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_receive_stream() {
        let dir = tempdir().unwrap();
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let mut staged = receive(dir.path(), futures::stream::iter(chunks))
            .await
            .unwrap();
        assert_eq!(staged.size(), 4);
        assert_eq!(staged.finish().await.unwrap(), Checksum::compute(b"abcd"));
        staged.discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_receive_error_leaves_nothing() {
        let dir = tempdir().unwrap();
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = receive(dir.path(), futures::stream::iter(chunks))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
