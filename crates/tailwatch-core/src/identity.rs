//! Platform file identity.
//!
//! Identity is only a hint: the fingerprint decides whether two files are the
//! same stream. Identity is what legacy (v1) store records are keyed on, and
//! it tells the watch loop whether a truncated file was replaced.

use std::fmt;
use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fingerprint::fnv1a64;

/// Opaque `(file id, device major, device minor)` triple.
///
/// On unix this is `(inode, major(dev), minor(dev))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub file_id: u64,
    pub major: u64,
    pub minor: u64,
}

impl IdentityKey {
    #[must_use]
    pub const fn new(file_id: u64, major: u64, minor: u64) -> Self {
        Self {
            file_id,
            major,
            minor,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.file_id, self.major, self.minor)
    }
}

/// Capability that maps a stat result to an [`IdentityKey`].
pub trait FileIdentity: Send + Sync + fmt::Debug {
    fn identity_of(&self, path: &Path, metadata: &Metadata) -> IdentityKey;
}

/// Inode and device numbers from the metadata.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InodeIdentity;

#[cfg(unix)]
impl FileIdentity for InodeIdentity {
    fn identity_of(&self, _path: &Path, metadata: &Metadata) -> IdentityKey {
        use std::os::unix::fs::MetadataExt;
        let (major, minor) = split_dev(metadata.dev());
        IdentityKey::new(metadata.ino(), major, minor)
    }
}

/// Splits a `dev_t` the way glibc's `major()`/`minor()` macros do.
#[must_use]
pub const fn split_dev(dev: u64) -> (u64, u64) {
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0fff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x00ff);
    (major, minor)
}

/// Weak identity derived from the path alone.
///
/// Used where the platform exposes no stable file id. A rename looks like a
/// new file to this identity; the fingerprint still reattaches the record.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathIdentity;

impl FileIdentity for PathIdentity {
    fn identity_of(&self, path: &Path, _metadata: &Metadata) -> IdentityKey {
        let normalized = path.to_string_lossy().replace('\\', "/");
        IdentityKey::new(fnv1a64(normalized.as_bytes()), 0, 0)
    }
}

/// Identity implementation for the current platform.
#[must_use]
pub fn platform_identity() -> Arc<dyn FileIdentity> {
    #[cfg(unix)]
    {
        Arc::new(InodeIdentity)
    }

    #[cfg(not(unix))]
    {
        Arc::new(PathIdentity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn split_dev_decodes_common_devices() {
        // makedev(8, 1) for /dev/sda1
        assert_eq!(split_dev(0x0801), (8, 1));
        // makedev(259, 3) encodes major bits above the low 12
        assert_eq!(split_dev(0x0001_0303), (259, 3));
        assert_eq!(split_dev(0), (0, 0));
    }

    #[test]
    fn path_identity_is_stable_per_path() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();

        let meta_a = std::fs::metadata(&a).unwrap();
        let meta_b = std::fs::metadata(&b).unwrap();
        let ident = PathIdentity;

        assert_eq!(ident.identity_of(&a, &meta_a), ident.identity_of(&a, &meta_a));
        assert_ne!(ident.identity_of(&a, &meta_a), ident.identity_of(&b, &meta_b));
    }

    #[cfg(unix)]
    #[test]
    fn inode_identity_survives_rename() {
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("app.log");
        let after = dir.path().join("app.log.1");
        std::fs::write(&before, b"hello\n").unwrap();

        let ident = platform_identity();
        let first = ident.identity_of(&before, &std::fs::metadata(&before).unwrap());
        std::fs::rename(&before, &after).unwrap();
        let second = ident.identity_of(&after, &std::fs::metadata(&after).unwrap());

        assert_eq!(first, second);
    }
}
