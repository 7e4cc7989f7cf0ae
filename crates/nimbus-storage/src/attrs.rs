//! Validity attributes of cached object files
//!
//! Every committed object file carries its content checksum and a valid
//! flag. They are kept either as Linux user extended attributes or, on
//! filesystems without xattr support, as JSON records in a shadow tree.

use nimbus_common::{Checksum, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Shadow tree holding sidecar records on each mount path
pub const ATTRS_DIR: &str = ".attrs";

/// Extended attribute holding the valid flag ("1" / "0")
pub const XATTR_VALID: &str = "user.obj.isvalid";
/// Extended attribute holding the hex checksum
pub const XATTR_HASH: &str = "user.obj.hash";

/// Checksum and validity of one object file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub checksum: Checksum,
    pub valid: bool,
}

impl ObjectAttrs {
    #[must_use]
    pub const fn valid(checksum: Checksum) -> Self {
        Self {
            checksum,
            valid: true,
        }
    }
}

/// Storage for [`ObjectAttrs`] keyed by object file name
///
/// `get` returns `Ok(None)` when the file has no record, which callers
/// treat as unknown validity.
pub trait AttrStore: Send + Sync {
    fn get(&self, fqn: &Path) -> Result<Option<ObjectAttrs>>;

    fn set(&self, fqn: &Path, attrs: &ObjectAttrs) -> Result<()>;

    /// Drop the record of a removed file
    fn remove(&self, fqn: &Path) -> Result<()>;

    /// Drop every record under a removed directory
    fn remove_tree(&self, dir: &Path) -> Result<()>;
}

/// Attributes kept as user extended attributes of the file itself
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrStore;

impl AttrStore for XattrStore {
    fn get(&self, fqn: &Path) -> Result<Option<ObjectAttrs>> {
        let Some(valid) = xattr::get(fqn, XATTR_VALID).map_err(|e| Error::from_io(e, fqn))? else {
            return Ok(None);
        };
        let Some(hash) = xattr::get(fqn, XATTR_HASH).map_err(|e| Error::from_io(e, fqn))? else {
            return Ok(None);
        };

        let Ok(checksum) = String::from_utf8_lossy(&hash).parse::<Checksum>() else {
            warn!("Malformed checksum attribute on {}", fqn.display());
            return Ok(None);
        };
        Ok(Some(ObjectAttrs {
            checksum,
            valid: valid.as_slice() == b"1",
        }))
    }

    fn set(&self, fqn: &Path, attrs: &ObjectAttrs) -> Result<()> {
        // Never valid with a stale hash
        xattr::set(fqn, XATTR_VALID, b"0").map_err(|e| Error::from_io(e, fqn))?;
        xattr::set(fqn, XATTR_HASH, attrs.checksum.to_hex().as_bytes())
            .map_err(|e| Error::from_io(e, fqn))?;
        if attrs.valid {
            xattr::set(fqn, XATTR_VALID, b"1").map_err(|e| Error::from_io(e, fqn))?;
        }
        Ok(())
    }

    fn remove(&self, _fqn: &Path) -> Result<()> {
        // Attributes go away with the file
        Ok(())
    }

    fn remove_tree(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Raw extended attribute calls
#[allow(unsafe_code)]
mod xattr {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_path(path: &Path) -> io::Result<CString> {
        Ok(CString::new(path.as_os_str().as_bytes())?)
    }

    #[cfg(target_os = "linux")]
    pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        let path = c_path(path)?;
        let name = CString::new(name)?;
        let mut buf = [0u8; 64];
        // SAFETY: both strings are NUL-terminated and `buf` outlives the call
        let rc = unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                return Ok(None);
            }
            return Err(err);
        }
        let len = usize::try_from(rc).unwrap_or(0);
        Ok(Some(buf[..len].to_vec()))
    }

    #[cfg(target_os = "linux")]
    pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let path = c_path(path)?;
        let name = CString::new(name)?;
        // SAFETY: both strings are NUL-terminated and `value` outlives the call
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get(path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
        c_path(path)?;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended attributes require Linux; set storage.no_xattrs",
        ))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set(path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
        c_path(path)?;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended attributes require Linux; set storage.no_xattrs",
        ))
    }
}

/// Attributes kept as JSON records in a shadow tree per mount path
#[derive(Debug, Clone)]
pub struct SidecarStore {
    roots: Vec<PathBuf>,
}

impl SidecarStore {
    /// Create a store for the given mount path roots
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// Shadow path of `fqn`; `None` when it is outside every mount path
    fn sidecar_path(&self, fqn: &Path) -> Option<PathBuf> {
        self.roots.iter().find_map(|root| {
            fqn.strip_prefix(root)
                .ok()
                .map(|rel| root.join(ATTRS_DIR).join(rel))
        })
    }

    fn require_sidecar(&self, fqn: &Path) -> Result<PathBuf> {
        self.sidecar_path(fqn).ok_or_else(|| {
            Error::internal(format!("{} is not under any mount path", fqn.display()))
        })
    }
}

impl AttrStore for SidecarStore {
    fn get(&self, fqn: &Path) -> Result<Option<ObjectAttrs>> {
        let path = self.require_sidecar(fqn)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from_io(e, &path)),
        };
        match serde_json::from_slice(&data) {
            Ok(attrs) => Ok(Some(attrs)),
            Err(e) => {
                warn!("Corrupt attribute record {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn set(&self, fqn: &Path, attrs: &ObjectAttrs) -> Result<()> {
        let path = self.require_sidecar(fqn)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::from_io(e, parent))?;
        }
        let data = serde_json::to_vec(attrs)?;
        fs::write(&path, data).map_err(|e| Error::from_io(e, &path))
    }

    fn remove(&self, fqn: &Path) -> Result<()> {
        let path = self.require_sidecar(fqn)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(e, &path)),
        }
    }

    fn remove_tree(&self, dir: &Path) -> Result<()> {
        let path = self.require_sidecar(dir)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(e, &path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sidecar_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new([dir.path().to_path_buf()]);
        let fqn = dir.path().join("cloud/b/nested/o");
        fs::create_dir_all(fqn.parent().unwrap()).unwrap();
        fs::write(&fqn, b"data").unwrap();

        assert_eq!(store.get(&fqn).unwrap(), None);

        let attrs = ObjectAttrs::valid(Checksum::compute(b"data"));
        store.set(&fqn, &attrs).unwrap();
        assert_eq!(store.get(&fqn).unwrap(), Some(attrs));
        assert!(dir.path().join(".attrs/cloud/b/nested/o").is_file());

        store.remove(&fqn).unwrap();
        assert_eq!(store.get(&fqn).unwrap(), None);
        store.remove(&fqn).unwrap();
    }

    #[test]
    fn test_sidecar_remove_tree() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new([dir.path().to_path_buf()]);
        let attrs = ObjectAttrs::valid(Checksum::new(7));
        for name in ["a", "b/c"] {
            store.set(&dir.path().join("local/lb").join(name), &attrs).unwrap();
        }

        store.remove_tree(&dir.path().join("local/lb")).unwrap();
        assert!(!dir.path().join(".attrs/local/lb").exists());
        store.remove_tree(&dir.path().join("local/lb")).unwrap();
    }

    #[test]
    fn test_sidecar_outside_mount() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new([dir.path().join("m0")]);
        assert!(store.get(Path::new("/tmp/elsewhere")).is_err());
    }

    #[test]
    fn test_sidecar_invalid_flag() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new([dir.path().to_path_buf()]);
        let fqn = dir.path().join("local/b/o");
        let attrs = ObjectAttrs {
            checksum: Checksum::new(1),
            valid: false,
        };
        store.set(&fqn, &attrs).unwrap();
        assert!(!store.get(&fqn).unwrap().unwrap().valid);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_xattr_roundtrip() {
        let dir = tempdir().unwrap();
        let fqn = dir.path().join("obj");
        fs::write(&fqn, b"payload").unwrap();

        let store = XattrStore;
        let attrs = ObjectAttrs::valid(Checksum::compute(b"payload"));
        match store.set(&fqn, &attrs) {
            Ok(()) => {}
            // tmpfs and some overlay filesystems reject user xattrs
            Err(Error::DiskIo(e)) if e.kind() == io::ErrorKind::Unsupported => return,
            Err(e) => panic!("setxattr failed: {e}"),
        }
        assert_eq!(store.get(&fqn).unwrap(), Some(attrs));
    }
}
