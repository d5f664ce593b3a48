//! VFS error types.

use cloudsftp_backend::{Code, GatewayError, Status};
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File, directory or space not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Backend refused the operation for this user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Malformed request, e.g. open flags that do not fit the open mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Deliberately unimplemented operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Rename across storage spaces.
    #[error("cross-space link")]
    CrossDeviceLink,

    /// Backend answered with a status that has no closer mapping.
    #[error("{op} {path}: {message}")]
    Backend {
        op: &'static str,
        path: String,
        message: String,
    },

    /// RPC or HTTP failure.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Translate a non-OK backend status at the point of the call.
    pub fn from_status(op: &'static str, path: &str, status: &Status) -> Self {
        match status.code {
            Code::NotFound => Self::NotFound(path.to_string()),
            Code::AlreadyExists => Self::AlreadyExists(path.to_string()),
            Code::PermissionDenied | Code::Unauthenticated => {
                Self::PermissionDenied(path.to_string())
            }
            _ => Self::Backend {
                op,
                path: path.to_string(),
                message: if status.message.is_empty() {
                    format!("{:?}", status.code)
                } else {
                    status.message.clone()
                },
            },
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e = VfsError::from_status("stat", "/a", &Status::not_found("gone"));
        assert!(matches!(e, VfsError::NotFound(ref p) if p == "/a"));

        let e = VfsError::from_status("mkdir", "/a", &Status::new(Code::AlreadyExists, ""));
        assert!(matches!(e, VfsError::AlreadyExists(_)));

        let e = VfsError::from_status("move", "/a", &Status::new(Code::PermissionDenied, ""));
        assert!(matches!(e, VfsError::PermissionDenied(_)));

        let e = VfsError::from_status("move", "/a", &Status::new(Code::Internal, "disk on fire"));
        assert_eq!(e.to_string(), "move /a: disk on fire");
    }
}
