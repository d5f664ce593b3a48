//! Core VFS types.
//!
//! Protocol-neutral: the SFTP layer converts these into wire attributes.

use cloudsftp_backend::{ResourceInfo, StorageSpace};

/// Type bits for a directory.
pub const S_IFDIR: u32 = 0o040000;

/// Type bits for a regular file.
pub const S_IFREG: u32 = 0o100000;

/// Permission bits reported for containers inside a space.
pub const DIR_PERM: u32 = 0o755;

/// Permission bits reported for files.
pub const FILE_PERM: u32 = 0o644;

/// Permission bits reported for the space entries at `/`.
pub const SPACE_PERM: u32 = 0o775;

/// Largest object a file handle will hold in memory unless configured.
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 1 << 30;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory (a backend container or a space).
    Directory,
}

/// One listing or stat entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes. Always 0 for directories.
    pub size: u64,
    /// Seconds since the Unix epoch, when known.
    pub mtime: Option<u64>,
    pub kind: FileKind,
    /// Unix permissions (e.g., 0o644).
    pub perm: u32,
}

impl FileInfo {
    pub fn directory(name: impl Into<String>, perm: u32, mtime: Option<u64>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mtime,
            kind: FileKind::Directory,
            perm,
        }
    }

    pub fn file(name: impl Into<String>, size: u64, mtime: Option<u64>) -> Self {
        Self {
            name: name.into(),
            size,
            mtime,
            kind: FileKind::File,
            perm: FILE_PERM,
        }
    }

    /// A space rendered as a top-level directory.
    pub fn from_space(space: &StorageSpace) -> Self {
        Self::directory(space.name.clone(), SPACE_PERM, space.mtime)
    }

    /// Backend resource metadata under the given entry name.
    pub fn from_resource(name: impl Into<String>, info: &ResourceInfo) -> Self {
        if info.is_container() {
            Self::directory(name, DIR_PERM, info.mtime)
        } else {
            Self::file(name, info.size, info.mtime)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Full mode: type bits plus permissions.
    pub fn mode(&self) -> u32 {
        match self.kind {
            FileKind::Directory => S_IFDIR | self.perm,
            FileKind::File => S_IFREG | self.perm,
        }
    }
}

/// Requested open mode, decoded from the SFTP `pflags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// `O_WRONLY | O_CREAT | O_TRUNC`, what `put` sends.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// True when any flag implies modification; such opens are served as
    /// write-opens and must carry `write`.
    pub fn wants_write(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }
}
