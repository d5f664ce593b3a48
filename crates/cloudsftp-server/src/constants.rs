//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port for the gateway.
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Default bind address (localhost only for security).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// How long loaded public keys stay valid, in seconds.
pub const DEFAULT_KEY_CACHE_TTL_SECS: u64 = 60;

/// Timeout for gateway RPCs and data transfers, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Directory in the personal space that holds authorized keys.
pub const SSH_KEYS_DIR: &str = "/.ssh";

/// Files in [`SSH_KEYS_DIR`] with this suffix are read as public keys.
pub const PUBLIC_KEY_SUFFIX: &str = ".pub";

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "cloudsftp.ron";

/// The only subsystem the server serves.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Open file and directory handles allowed per SFTP session.
pub const MAX_OPEN_HANDLES: usize = 64;

/// Entries sent per `readdir` reply. Keeps each NAME packet well under
/// the 256 KiB OpenSSH accepts.
pub const READDIR_BATCH_SIZE: usize = 100;

/// Extension advertised for overwrite-allowed renames.
pub const POSIX_RENAME_EXTENSION: &str = "posix-rename@openssh.com";
