//! Backend data model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Space id of the virtual "Shares" space. The backend reports it without a
/// storage id, but addresses it with the id repeated as storage id.
pub const SHARES_SPACE_ID: &str = "a0ca6a90-a365-4782-871e-d44447bbc668";

/// Parsed storage space id: `storageid$spaceid!opaqueid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpaceId {
    #[serde(default)]
    pub storage_id: String,
    pub space_id: String,
    #[serde(default)]
    pub opaque_id: String,
}

impl SpaceId {
    /// Parse the backend's compound id.
    ///
    /// The storage part and the opaque part are both optional.
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        if raw.is_empty() {
            return Err(GatewayError::InvalidSpaceId(raw.to_string()));
        }

        let (storage_id, rest) = match raw.split_once('$') {
            Some((storage, rest)) => (storage, rest),
            None => ("", raw),
        };
        let (space_id, opaque_id) = match rest.split_once('!') {
            Some((space, opaque)) => (space, opaque),
            None => (rest, ""),
        };
        if space_id.is_empty() {
            return Err(GatewayError::InvalidSpaceId(raw.to_string()));
        }

        let mut id = Self {
            storage_id: storage_id.to_string(),
            space_id: space_id.to_string(),
            opaque_id: opaque_id.to_string(),
        };
        if id.storage_id.is_empty() && id.space_id == SHARES_SPACE_ID {
            id.storage_id = SHARES_SPACE_ID.to_string();
        }
        Ok(id)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.storage_id.is_empty() {
            write!(f, "{}$", self.storage_id)?;
        }
        f.write_str(&self.space_id)?;
        if !self.opaque_id.is_empty() {
            write!(f, "!{}", self.opaque_id)?;
        }
        Ok(())
    }
}

/// Addressing primitive for every backend operation.
///
/// `path` is relative to the space root and always starts with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_id: SpaceId,
    pub path: String,
}

impl Reference {
    /// Build a reference from a space and an absolute in-space path (`/a/b`).
    pub fn new(space: &StorageSpace, path: &str) -> GatewayResult<Self> {
        let resource_id = SpaceId::parse(&space.id)?;
        Ok(Self::from_parts(resource_id, path))
    }

    pub fn from_parts(resource_id: SpaceId, path: &str) -> Self {
        let path = if path.starts_with('/') {
            format!(".{path}")
        } else {
            format!("./{path}")
        };
        Self { resource_id, path }
    }

    /// The in-space path with the leading `.` removed, e.g. `/a/b`.
    pub fn absolute_path(&self) -> &str {
        match self.path.strip_prefix('.') {
            Some("") => "/",
            Some(rest) => rest,
            None => &self.path,
        }
    }

    /// True when both references live in the same space.
    pub fn same_space(&self, other: &Reference) -> bool {
        self.resource_id.storage_id == other.resource_id.storage_id
            && self.resource_id.space_id == other.resource_id.space_id
    }
}

/// A named, owned top-level container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpace {
    /// Raw compound id, see [`SpaceId::parse`].
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub mtime: Option<u64>,
    #[serde(default)]
    pub space_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    File,
    Container,
}

/// Backend-reported metadata for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Path inside the owning space, e.g. `/a/b.txt`.
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<u64>,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub etag: Option<String>,
}

impl ResourceInfo {
    /// Final path component.
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, name)) => name,
            None => trimmed,
        }
    }

    pub fn is_container(&self) -> bool {
        self.resource_type == ResourceType::Container
    }
}

/// RPC status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    #[serde(rename = "CODE_OK")]
    Ok,
    #[serde(rename = "CODE_NOT_FOUND")]
    NotFound,
    #[serde(rename = "CODE_ALREADY_EXISTS")]
    AlreadyExists,
    #[serde(rename = "CODE_PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "CODE_UNAUTHENTICATED")]
    Unauthenticated,
    #[serde(rename = "CODE_FAILED_PRECONDITION")]
    FailedPrecondition,
    #[serde(rename = "CODE_INVALID_ARGUMENT")]
    InvalidArgument,
    #[serde(rename = "CODE_UNIMPLEMENTED")]
    Unimplemented,
    #[serde(rename = "CODE_INTERNAL")]
    Internal,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Filter terms for `ListStorageSpaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceFilter {
    SpaceType(String),
    Owner(String),
}

impl SpaceFilter {
    pub fn matches(&self, space: &StorageSpace) -> bool {
        match self {
            SpaceFilter::SpaceType(t) => &space.space_type == t,
            SpaceFilter::Owner(o) => &space.owner == o,
        }
    }
}

/// One negotiated data-transfer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub protocol: String,
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_id_full() {
        let id = SpaceId::parse("storage-1$space-2!node-3").unwrap();
        assert_eq!(id.storage_id, "storage-1");
        assert_eq!(id.space_id, "space-2");
        assert_eq!(id.opaque_id, "node-3");
        assert_eq!(id.to_string(), "storage-1$space-2!node-3");
    }

    #[test]
    fn test_space_id_partial() {
        let id = SpaceId::parse("space-2").unwrap();
        assert_eq!(id.storage_id, "");
        assert_eq!(id.space_id, "space-2");
        assert_eq!(id.opaque_id, "");

        let id = SpaceId::parse("storage-1$space-2").unwrap();
        assert_eq!(id.storage_id, "storage-1");
        assert_eq!(id.opaque_id, "");
    }

    #[test]
    fn test_space_id_rejects_empty() {
        assert!(SpaceId::parse("").is_err());
        assert!(SpaceId::parse("storage$").is_err());
        assert!(SpaceId::parse("storage$!opaque").is_err());
    }

    #[test]
    fn test_shares_space_gets_storage_id() {
        let id = SpaceId::parse(&format!("{SHARES_SPACE_ID}!{SHARES_SPACE_ID}")).unwrap();
        assert_eq!(id.storage_id, SHARES_SPACE_ID);
        assert_eq!(id.space_id, SHARES_SPACE_ID);
    }

    #[test]
    fn test_reference_paths() {
        let space = StorageSpace {
            id: "s$p!o".into(),
            name: "Admin".into(),
            owner: "u1".into(),
            mtime: None,
            space_type: "personal".into(),
        };
        let r = Reference::new(&space, "/a/b").unwrap();
        assert_eq!(r.path, "./a/b");
        assert_eq!(r.absolute_path(), "/a/b");

        let root = Reference::new(&space, "/").unwrap();
        assert_eq!(root.path, "./");
        assert_eq!(root.absolute_path(), "/");
    }

    #[test]
    fn test_same_space_ignores_opaque() {
        let a = Reference::from_parts(SpaceId::parse("s$p!x").unwrap(), "/a");
        let b = Reference::from_parts(SpaceId::parse("s$p!y").unwrap(), "/b");
        let c = Reference::from_parts(SpaceId::parse("s$q!x").unwrap(), "/a");
        assert!(a.same_space(&b));
        assert!(!a.same_space(&c));
    }

    #[test]
    fn test_resource_name() {
        let info = ResourceInfo {
            path: "/.ssh/id_ed25519.pub".into(),
            size: 80,
            mtime: None,
            resource_type: ResourceType::File,
            etag: None,
        };
        assert_eq!(info.name(), "id_ed25519.pub");
        assert!(!info.is_container());
    }

    #[test]
    fn test_code_wire_names() {
        let status: Status = serde_json::from_str(r#"{"code":"CODE_NOT_FOUND"}"#).unwrap();
        assert_eq!(status.code, Code::NotFound);
        let status: Status =
            serde_json::from_str(r#"{"code":"CODE_SOMETHING_NEW","message":"x"}"#).unwrap();
        assert_eq!(status.code, Code::Unknown);
    }
}
