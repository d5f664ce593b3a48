//! Virtual filesystem for cloudsftp.
//!
//! Turns the backend's collection of named storage spaces into a single
//! SFTP root. Each top-level directory is a space; everything below is
//! addressed as `(space, relative path)`.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher (one per SSH session, serialized)
//!   ├── resolver   /Space/a/b  →  (space, "/a/b")
//!   ├── Selector   fresh gateway client per call
//!   └── BufferedFileHandle  whole-object cache, write-through upload
//! ```

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod resolver;
pub mod session;
pub mod types;

pub use dispatcher::{Command, Dispatcher, ListRequest};
pub use error::{VfsError, VfsResult};
pub use handle::{BufferedFileHandle, ReadOutcome, WriteOutcome};
pub use resolver::{clean_path, resolve, split_path};
pub use session::SessionIdentity;
pub use types::{DEFAULT_MAX_OBJECT_BYTES, FileInfo, FileKind, OpenFlags};
