//! Mount paths and the on-disk object layout
//!
//! A target stores objects on a set of mount paths, one per physical
//! filesystem. Each object lives on exactly one mount path, chosen by HRW
//! over the mount path identifiers:
//!
//! ```text
//! <mpath>/<local|cloud>/<bucket>/<object>
//! <mpath>/.staging/<uuid>             in-flight writes
//! <mpath>/.attrs/<ns>/<bucket>/<obj>  sidecar validity records
//! ```

use nimbus_common::config::{StorageConfig, TestFspathsConfig};
use nimbus_common::{Error, ObjectKey, Result};
use nimbus_placement::hrw_select;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Directory holding in-flight writes on each mount path
pub const STAGING_DIR: &str = ".staging";

/// Namespace directory names for local and cloud buckets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub local: String,
    pub cloud: String,
}

impl Layout {
    /// Namespace directory for a bucket kind
    #[must_use]
    pub fn namespace(&self, is_local: bool) -> &str {
        if is_local { &self.local } else { &self.cloud }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            local: "local".to_string(),
            cloud: "cloud".to_string(),
        }
    }
}

impl From<&StorageConfig> for Layout {
    fn from(config: &StorageConfig) -> Self {
        Self {
            local: config.local_buckets.clone(),
            cloud: config.cloud_buckets.clone(),
        }
    }
}

/// One mount path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPath {
    path: PathBuf,
    /// Identifier hashed for placement
    id: String,
    /// Filesystem identifier (device number)
    fsid: u64,
}

impl MountPath {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn fsid(&self) -> u64 {
        self.fsid
    }

    /// Staging directory of this mount path
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.path.join(STAGING_DIR)
    }
}

/// A file found by a namespace walk
#[derive(Clone, Debug)]
pub struct WalkedObject {
    pub key: ObjectKey,
    pub fqn: PathBuf,
    pub is_local: bool,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// The non-empty set of mount paths of a target
#[derive(Debug)]
pub struct MountSet {
    mpaths: Vec<MountPath>,
    layout: Layout,
}

impl MountSet {
    /// Build a mount set from existing directories.
    ///
    /// Every path must exist and be a directory. Two paths on the same
    /// filesystem are rejected unless `allow_shared_fs` is set, which is
    /// only the case for synthetic test mount paths.
    pub fn new(paths: &[PathBuf], layout: Layout, allow_shared_fs: bool) -> Result<Self> {
        let mut mpaths: Vec<MountPath> = Vec::with_capacity(paths.len());
        let mut by_fsid: HashMap<u64, PathBuf> = HashMap::new();

        for path in paths {
            if mpaths.iter().any(|m| m.path == *path) {
                warn!("Duplicate mount path {} ignored", path.display());
                continue;
            }
            let meta = fs::metadata(path).map_err(|e| {
                Error::configuration(format!("mount path {}: {e}", path.display()))
            })?;
            if !meta.is_dir() {
                return Err(Error::configuration(format!(
                    "mount path {} is not a directory",
                    path.display()
                )));
            }

            let fsid = meta.dev();
            if let Some(other) = by_fsid.get(&fsid) {
                if !allow_shared_fs {
                    return Err(Error::configuration(format!(
                        "mount paths {} and {} share filesystem {fsid}",
                        other.display(),
                        path.display()
                    )));
                }
                debug!(
                    "Mount path {} shares filesystem {fsid} with {} (test mode)",
                    path.display(),
                    other.display()
                );
            } else {
                by_fsid.insert(fsid, path.clone());
            }

            mpaths.push(MountPath {
                path: path.clone(),
                id: path.to_string_lossy().into_owned(),
                fsid,
            });
        }

        if mpaths.is_empty() {
            return Err(Error::configuration("no mount paths configured"));
        }

        Ok(Self { mpaths, layout })
    }

    /// Create `count` synthetic mount paths under `<root>/<instance>/`
    pub fn for_testing(test: &TestFspathsConfig, layout: Layout) -> Result<Self> {
        let base = test.root.join(test.instance.to_string());
        let paths: Vec<PathBuf> = (0..test.count).map(|i| base.join(i.to_string())).collect();
        for path in &paths {
            fs::create_dir_all(path).map_err(|e| Error::from_io(e, path))?;
        }
        Self::new(&paths, layout, true)
    }

    /// Build the mount set described by the storage configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let layout = Layout::from(config);
        if config.test_fspaths.enabled() {
            info!(
                "Using {} synthetic mount paths under {}",
                config.test_fspaths.count,
                config.test_fspaths.root.display()
            );
            Self::for_testing(&config.test_fspaths, layout)
        } else {
            Self::new(&config.fspaths, layout, false)
        }
    }

    /// Create the namespace and staging directories on every mount path and
    /// purge staging files left behind by an earlier run.
    pub fn init(&self) -> Result<()> {
        for mpath in &self.mpaths {
            for ns in [&self.layout.local, &self.layout.cloud] {
                let dir = mpath.path.join(ns);
                fs::create_dir_all(&dir).map_err(|e| Error::from_io(e, &dir))?;
            }

            let staging = mpath.staging_dir();
            fs::create_dir_all(&staging).map_err(|e| Error::from_io(e, &staging))?;
            let mut purged = 0usize;
            for entry in fs::read_dir(&staging).map_err(|e| Error::from_io(e, &staging))? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("Failed to purge {}: {e}", entry.path().display());
                    } else {
                        purged += 1;
                    }
                }
            }
            if purged > 0 {
                info!("Purged {purged} stale staging files from {}", staging.display());
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn mpaths(&self) -> &[MountPath] {
        &self.mpaths
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mpaths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mpaths.is_empty()
    }

    /// Mount path owning `key`
    #[must_use]
    pub fn place(&self, key: &ObjectKey) -> &MountPath {
        match hrw_select(&key.uname(), &self.mpaths, MountPath::id) {
            Some(mpath) => mpath,
            None => unreachable!("mount set is never empty"),
        }
    }

    /// Fully qualified file name of `key`
    #[must_use]
    pub fn fqn(&self, key: &ObjectKey, is_local: bool) -> PathBuf {
        self.place(key)
            .path
            .join(self.layout.namespace(is_local))
            .join(key.bucket())
            .join(key.object())
    }

    /// Staging directory on the mount path owning `key`
    #[must_use]
    pub fn staging_dir(&self, key: &ObjectKey) -> PathBuf {
        self.place(key).staging_dir()
    }

    /// Directory of `bucket` on every mount path
    #[must_use]
    pub fn bucket_dirs(&self, bucket: &str, is_local: bool) -> Vec<PathBuf> {
        let ns = self.layout.namespace(is_local);
        self.mpaths
            .iter()
            .map(|m| m.path.join(ns).join(bucket))
            .collect()
    }

    /// Map a file name back to its key and bucket kind
    #[must_use]
    pub fn parse_fqn(&self, fqn: &Path) -> Option<(ObjectKey, bool)> {
        let rel = self
            .mpaths
            .iter()
            .find_map(|m| fqn.strip_prefix(&m.path).ok())?;

        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(s) => parts.push(s.to_str()?),
                _ => return None,
            }
        }
        if parts.len() < 3 {
            return None;
        }

        let is_local = if parts[0] == self.layout.local {
            true
        } else if parts[0] == self.layout.cloud {
            false
        } else {
            return None;
        };
        let key = ObjectKey::new(parts[1], parts[2..].join("/")).ok()?;
        Some((key, is_local))
    }

    /// Walk the objects of one namespace, optionally restricted to a bucket.
    ///
    /// Blocking; callers on the async runtime use `spawn_blocking`.
    #[must_use]
    pub fn walk(&self, is_local: bool, bucket: Option<&str>) -> Vec<WalkedObject> {
        let ns = self.layout.namespace(is_local);
        let mut out = Vec::new();

        for mpath in &self.mpaths {
            let mut root = mpath.path.join(ns);
            if let Some(bucket) = bucket {
                root.push(bucket);
            }
            if !root.is_dir() {
                continue;
            }

            for entry in walkdir::WalkDir::new(&root).min_depth(1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(%err, "failed to walk {}", root.display());
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some((key, local)) = self.parse_fqn(entry.path()) else {
                    debug!("Skipping unrecognized file {}", entry.path().display());
                    continue;
                };
                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(err) => {
                        // Removed between readdir and stat
                        debug!(%err, "stat {}", entry.path().display());
                        continue;
                    }
                };
                out.push(WalkedObject {
                    key,
                    fqn: entry.into_path(),
                    is_local: local,
                    size: meta.len(),
                    atime: unix_time(meta.atime(), meta.atime_nsec()),
                    mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
                    ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
                });
            }
        }
        out
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let secs = u64::try_from(secs).unwrap_or(0);
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    UNIX_EPOCH + Duration::new(secs, nsecs)
}
