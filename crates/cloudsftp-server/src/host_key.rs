//! Persistent SSH host key.

use std::path::Path;

use russh::keys::PrivateKey;
use russh::keys::ssh_key::{self, LineEnding};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("host key IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("host key error: {0}")]
    Key(#[from] ssh_key::Error),
}

/// Fresh Ed25519 key.
pub fn generate() -> Result<PrivateKey, HostKeyError> {
    let key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)?;
    Ok(key)
}

/// Write `key` in OpenSSH format to a new file, readable by the owner only.
///
/// The file is created with mode 0600; an existing file is never replaced.
pub async fn save(key: &PrivateKey, path: &Path) -> Result<(), HostKeyError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let pem = key.to_openssh(LineEnding::LF)?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(pem.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Load the key at `path`, generating and persisting one when the file does
/// not exist. A file that exists but does not parse is an error.
pub async fn load_or_generate(path: &Path) -> Result<PrivateKey, HostKeyError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let key = PrivateKey::from_openssh(bytes)?;
            tracing::info!(
                path = %path.display(),
                algorithm = %key.algorithm(),
                "loaded host key"
            );
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = generate()?;
            save(&key, path).await?;
            tracing::info!(path = %path.display(), "generated new host key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_ed25519");

        let first = load_or_generate(&path).await.unwrap();
        assert!(path.exists());
        let second = load_or_generate(&path).await.unwrap();
        assert_eq!(first.public_key().key_data(), second.public_key().key_data());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        tokio::fs::write(&path, b"not a key").await.unwrap();

        let err = load_or_generate(&path).await.unwrap_err();
        assert!(matches!(err, HostKeyError::Key(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        save(&generate().unwrap(), &path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_save_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        tokio::fs::write(&path, b"keep me").await.unwrap();

        let err = save(&generate().unwrap(), &path).await.unwrap_err();
        assert!(matches!(err, HostKeyError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }
}
