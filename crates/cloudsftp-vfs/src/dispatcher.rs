//! SFTP request dispatcher.
//!
//! One [`Dispatcher`] per SSH session. Metadata requests (open, command,
//! list) are serialized by a session-local lock; file I/O on a returned
//! [`BufferedFileHandle`] runs outside it. Spaces are re-listed for every
//! request so newly created or removed spaces show up immediately.

use std::sync::Arc;

use cloudsftp_backend::{
    Code, DataTransport, GatewayClient, Reference, Selector, StorageSpace,
};
use tokio::sync::Mutex;

use crate::error::{VfsError, VfsResult};
use crate::handle::BufferedFileHandle;
use crate::resolver::{clean_path, resolve};
use crate::session::SessionIdentity;
use crate::types::{DEFAULT_MAX_OBJECT_BYTES, DIR_PERM, FileInfo, OpenFlags};

/// Filesystem commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fails if `to` exists.
    Rename { from: String, to: String },
    /// Replaces `to` if it exists.
    PosixRename { from: String, to: String },
    Rmdir { path: String },
    /// Unlink: files only.
    Remove { path: String },
    Mkdir { path: String },
    Link { from: String, to: String },
    Symlink { target: String, link: String },
    Setstat { path: String },
}

/// Listing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRequest {
    List { path: String },
    Stat { path: String },
    Readlink { path: String },
}

/// Translates SFTP requests for one session into backend calls.
pub struct Dispatcher {
    selector: Arc<dyn Selector>,
    transport: Arc<dyn DataTransport>,
    identity: Arc<SessionIdentity>,
    max_object_bytes: u64,
    lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        selector: Arc<dyn Selector>,
        transport: Arc<dyn DataTransport>,
        identity: SessionIdentity,
    ) -> Self {
        Self {
            selector,
            transport,
            identity: Arc::new(identity),
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            lock: Mutex::new(()),
        }
    }

    /// Size cap passed to every handle this dispatcher opens.
    pub fn with_max_object_bytes(mut self, bytes: u64) -> Self {
        self.max_object_bytes = bytes;
        self
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn token(&self) -> &str {
        &self.identity.token
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open a file for reading or writing.
    ///
    /// Any of write/append/create/truncate makes this a write-open, which
    /// must carry the write flag; otherwise it is a read-open, which must
    /// carry the read flag.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<BufferedFileHandle> {
        let path = clean_path(path);
        if flags.wants_write() {
            if !flags.write {
                return Err(VfsError::invalid_argument(format!(
                    "write-open of {path} without write flag"
                )));
            }
        } else if !flags.read {
            return Err(VfsError::invalid_argument(format!(
                "read-open of {path} without read flag"
            )));
        }

        let handle = {
            let _guard = self.lock.lock().await;
            tracing::debug!(%path, ?flags, "open");

            let spaces = self.list_spaces().await?;
            let reference = Self::reference_for(&path, &spaces)?;

            if flags.create || flags.truncate {
                match self.client()?.touch_file(self.token(), &reference).await {
                    Ok(status) if status.code == Code::AlreadyExists && flags.exclusive => {
                        return Err(VfsError::already_exists(path));
                    }
                    Ok(status) if !status.is_ok() => {
                        tracing::debug!(%path, ?status, "touch refused, continuing");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(%path, error = %e, "touch failed, continuing"),
                }
            }

            BufferedFileHandle::new(
                reference,
                path,
                flags,
                self.selector.clone(),
                self.transport.clone(),
                self.identity.clone(),
            )
            .with_max_size(self.max_object_bytes)
        };

        if flags.truncate {
            handle.truncate(0).await?;
        }
        Ok(handle)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn command(&self, command: Command) -> VfsResult<()> {
        let _guard = self.lock.lock().await;
        tracing::debug!(?command, "filecmd");

        match command {
            Command::Rename { from, to } => self.rename(&from, &to, false).await,
            Command::PosixRename { from, to } => self.rename(&from, &to, true).await,
            Command::Rmdir { path } => self.rmdir(&path).await,
            Command::Remove { path } => self.remove(&path).await,
            Command::Mkdir { path } => self.mkdir(&path).await,
            Command::Link { .. } => Err(VfsError::unsupported("hard links")),
            Command::Symlink { .. } => Err(VfsError::unsupported("symbolic links")),
            Command::Setstat { .. } => Err(VfsError::unsupported("setstat")),
        }
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> VfsResult<()> {
        let (from, to) = (clean_path(from), clean_path(to));
        let spaces = self.list_spaces().await?;
        let source = Self::reference_for(&from, &spaces)?;
        let target = Self::reference_for(&to, &spaces)?;

        if !source.same_space(&target) {
            return Err(VfsError::CrossDeviceLink);
        }

        if !overwrite {
            let stat = self.client()?.stat(self.token(), &target).await?;
            if stat.status.is_ok() {
                return Err(VfsError::already_exists(to));
            }
        }

        let status = self
            .client()?
            .move_resource(self.token(), &source, &target)
            .await?;
        if !status.is_ok() {
            let path = if status.code == Code::AlreadyExists { &to } else { &from };
            return Err(VfsError::from_status("rename", path, &status));
        }
        tracing::info!(%from, %to, overwrite, "renamed");
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> VfsResult<()> {
        let path = clean_path(path);
        let spaces = self.list_spaces().await?;
        let reference = Self::reference_for(&path, &spaces)?;

        let stat = self.client()?.stat(self.token(), &reference).await?;
        if !stat.status.is_ok() {
            return Err(VfsError::from_status("stat", &path, &stat.status));
        }
        if !stat.info.as_ref().is_some_and(|info| info.is_container()) {
            return Err(VfsError::not_a_directory(path));
        }

        let listing = self.client()?.list_container(self.token(), &reference).await?;
        if !listing.status.is_ok() {
            return Err(VfsError::from_status("list", &path, &listing.status));
        }
        if !listing.infos.is_empty() {
            return Err(VfsError::directory_not_empty(path));
        }

        let status = self.client()?.delete(self.token(), &reference).await?;
        if !status.is_ok() {
            return Err(VfsError::from_status("rmdir", &path, &status));
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let path = clean_path(path);
        let spaces = self.list_spaces().await?;
        let reference = Self::reference_for(&path, &spaces)?;

        let stat = self.client()?.stat(self.token(), &reference).await?;
        if !stat.status.is_ok() {
            return Err(VfsError::from_status("stat", &path, &stat.status));
        }
        if stat.info.as_ref().is_some_and(|info| info.is_container()) {
            return Err(VfsError::is_a_directory(path));
        }

        let status = self.client()?.delete(self.token(), &reference).await?;
        if !status.is_ok() {
            return Err(VfsError::from_status("remove", &path, &status));
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> VfsResult<()> {
        let path = clean_path(path);
        let spaces = self.list_spaces().await?;
        let reference = Self::reference_for(&path, &spaces)?;

        let status = self.client()?.create_container(self.token(), &reference).await?;
        if !status.is_ok() {
            return Err(VfsError::from_status("mkdir", &path, &status));
        }
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    pub async fn list(&self, request: ListRequest) -> VfsResult<Vec<FileInfo>> {
        let _guard = self.lock.lock().await;
        tracing::debug!(?request, "filelist");

        match request {
            ListRequest::List { path } => self.list_dir(&clean_path(&path)).await,
            ListRequest::Stat { path } => {
                let info = self.stat(&clean_path(&path)).await?;
                Ok(vec![info])
            }
            ListRequest::Readlink { .. } => Err(VfsError::unsupported("symbolic links")),
        }
    }

    async fn list_dir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        let spaces = self.list_spaces().await?;

        if path == "/" {
            return Ok(spaces.iter().map(FileInfo::from_space).collect());
        }

        let reference = Self::reference_for(path, &spaces)?;
        let listing = self.client()?.list_container(self.token(), &reference).await?;
        if !listing.status.is_ok() {
            return Err(VfsError::from_status("list", path, &listing.status));
        }

        Ok(listing
            .infos
            .iter()
            .map(|info| FileInfo::from_resource(info.name(), info))
            .collect())
    }

    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        if path == "/" {
            return Ok(FileInfo::directory("/", DIR_PERM, None));
        }

        let spaces = self.list_spaces().await?;
        let reference = Self::reference_for(path, &spaces)?;

        let resp = self.client()?.stat(self.token(), &reference).await?;
        if !resp.status.is_ok() {
            return Err(VfsError::from_status("stat", path, &resp.status));
        }
        let info = resp
            .info
            .ok_or_else(|| VfsError::not_found(path.to_string()))?;
        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(FileInfo::from_resource(name, &info))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn client(&self) -> VfsResult<Arc<dyn GatewayClient>> {
        Ok(self.selector.next()?)
    }

    async fn list_spaces(&self) -> VfsResult<Vec<StorageSpace>> {
        let resp = self.client()?.list_storage_spaces(self.token(), &[]).await?;
        if !resp.status.is_ok() {
            return Err(VfsError::from_status("list spaces", "/", &resp.status));
        }
        Ok(resp.storage_spaces)
    }

    fn reference_for(path: &str, spaces: &[StorageSpace]) -> VfsResult<Reference> {
        let (space, relative) =
            resolve(path, spaces).ok_or_else(|| VfsError::not_found(path.to_string()))?;
        Ok(Reference::new(space, &relative)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsftp_backend::{
        AuthenticateRequest, MemoryGateway, RoundRobinSelector,
    };

    async fn dispatcher() -> (Arc<MemoryGateway>, StorageSpace, Dispatcher) {
        let gw = Arc::new(MemoryGateway::new("k"));
        let uid = gw.add_user("alice");
        let space = gw.add_space("Admin", "personal", &uid);
        let auth = gw
            .authenticate(AuthenticateRequest::machine("alice", "k"))
            .await
            .unwrap();
        let selector: Arc<dyn Selector> = Arc::new(RoundRobinSelector::single(gw.clone()));
        let d = Dispatcher::new(
            selector,
            gw.clone(),
            SessionIdentity::new(auth.user_id, auth.token),
        );
        (gw, space, d)
    }

    #[tokio::test]
    async fn test_open_flag_validation() {
        let (_gw, _space, d) = dispatcher().await;

        let create_without_write = OpenFlags {
            read: true,
            create: true,
            ..Default::default()
        };
        assert!(matches!(
            d.open("/Admin/f", create_without_write).await,
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            d.open("/Admin/f", OpenFlags::default()).await,
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_open_unknown_space() {
        let (_gw, _space, d) = dispatcher().await;
        assert!(matches!(
            d.open("/Nope/f", OpenFlags::read_only()).await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_create_touches() {
        let (gw, space, d) = dispatcher().await;
        let flags = OpenFlags {
            write: true,
            create: true,
            ..Default::default()
        };
        d.open("/Admin/new.txt", flags).await.unwrap();
        assert_eq!(gw.file_content(&space, "/new.txt").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_open_truncate_clears_content() {
        let (gw, space, d) = dispatcher().await;
        gw.put_file(&space, "/old.txt", b"previous content");
        d.open("/Admin/old.txt", OpenFlags::create_truncate())
            .await
            .unwrap();
        assert_eq!(gw.file_content(&space, "/old.txt").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_open_exclusive_existing() {
        let (gw, space, d) = dispatcher().await;
        gw.put_file(&space, "/taken.txt", b"x");
        let flags = OpenFlags {
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        };
        assert!(matches!(
            d.open("/Admin/taken.txt", flags).await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_commands() {
        let (_gw, _space, d) = dispatcher().await;
        for cmd in [
            Command::Link {
                from: "/Admin/a".into(),
                to: "/Admin/b".into(),
            },
            Command::Symlink {
                target: "/Admin/a".into(),
                link: "/Admin/b".into(),
            },
            Command::Setstat {
                path: "/Admin/a".into(),
            },
        ] {
            assert!(matches!(
                d.command(cmd).await,
                Err(VfsError::Unsupported(_))
            ));
        }
        assert!(matches!(
            d.list(ListRequest::Readlink {
                path: "/Admin/a".into()
            })
            .await,
            Err(VfsError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_stat_root() {
        let (_gw, _space, d) = dispatcher().await;
        let info = d
            .list(ListRequest::Stat { path: "/".into() })
            .await
            .unwrap();
        assert!(info[0].is_dir());
    }

    #[tokio::test]
    async fn test_stat_space_root_uses_space_name() {
        let (_gw, _space, d) = dispatcher().await;
        let info = d
            .list(ListRequest::Stat {
                path: "/Admin".into(),
            })
            .await
            .unwrap();
        assert_eq!(info[0].name, "Admin");
        assert!(info[0].is_dir());
    }
}
