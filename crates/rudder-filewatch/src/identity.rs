//! Stable identity of an open or named file.

use std::fs::Metadata;

/// Device and inode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    /// Device number.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

/// Returns the identity of the file `meta` was read from.
///
/// `None` on platforms without inode numbers; callers then fall back to
/// size and name based checks.
#[cfg(unix)]
#[must_use]
pub fn file_id(meta: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

/// Returns the identity of the file `meta` was read from.
#[cfg(not(unix))]
#[must_use]
pub fn file_id(_meta: &Metadata) -> Option<FileId> {
    None
}

/// Returns true only if both files are known to be the same file.
#[must_use]
pub fn same_file(a: &Metadata, b: &Metadata) -> bool {
    match (file_id(a), file_id(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Permission bits, or the read-only flag where there are none.
#[cfg(unix)]
pub(crate) fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
pub(crate) fn mode_of(meta: &Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
