//! SFTP subsystem handler.
//!
//! Adapts `russh_sftp` requests onto a per-session [`Dispatcher`]. File
//! handles own a [`BufferedFileHandle`]; directory handles hold a listing
//! taken at `opendir` and hand it out in batches of [`READDIR_BATCH_SIZE`].

use std::collections::HashMap;

use cloudsftp_vfs::{
    BufferedFileHandle, Command, Dispatcher, FileInfo, ListRequest, OpenFlags, VfsError,
    clean_path,
};
use russh_sftp::extensions::{HARDLINK, STATVFS};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, Packet, Status, StatusCode, Version,
};
use serde::Deserialize;

use crate::constants::{MAX_OPEN_HANDLES, POSIX_RENAME_EXTENSION, READDIR_BATCH_SIZE};

struct DirHandle {
    path: String,
    /// Entries not yet sent; drained from the front by `readdir`.
    entries: Vec<File>,
}

enum ServerHandle {
    File(BufferedFileHandle),
    Dir(DirHandle),
}

/// One SFTP session. Lives as long as the `sftp` channel.
pub struct SftpSession {
    dispatcher: Dispatcher,
    handle_id: u64,
    handles: HashMap<String, ServerHandle>,
}

impl SftpSession {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            handle_id: 0,
            handles: HashMap::new(),
        }
    }

    fn next_handle_id(&mut self) -> String {
        let id = self.handle_id;
        self.handle_id += 1;

        format!("{id:x}")
    }

    fn insert_handle(&mut self, handle: ServerHandle) -> Result<String, StatusCode> {
        if self.handles.len() >= MAX_OPEN_HANDLES {
            tracing::warn!(user = %self.dispatcher.identity().user_id, "handle limit reached");
            return Err(StatusCode::Failure);
        }
        let id = self.next_handle_id();
        self.handles.insert(id.clone(), handle);
        Ok(id)
    }

    fn file_handle(&self, handle: &str) -> Result<&BufferedFileHandle, StatusCode> {
        match self.handles.get(handle) {
            Some(ServerHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::NoSuchFile),
        }
    }

    async fn run_command(&self, id: u32, command: Command) -> Result<Status, StatusCode> {
        let op = command_name(&command);
        self.dispatcher
            .command(command)
            .await
            .map_err(|e| fail(op, e))?;
        Ok(ok_status(id))
    }

    async fn stat_path(&self, id: u32, path: String) -> Result<Attrs, StatusCode> {
        let infos = self
            .dispatcher
            .list(ListRequest::Stat { path })
            .await
            .map_err(|e| fail("stat", e))?;
        let info = infos.first().ok_or(StatusCode::NoSuchFile)?;
        Ok(Attrs {
            id,
            attrs: to_attributes(info),
        })
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    #[inline]
    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::debug!(version, user = %self.dispatcher.identity().user_id, "sftp init");
        Ok(Version {
            version: russh_sftp::protocol::VERSION,
            extensions: HashMap::from([(POSIX_RENAME_EXTENSION.to_string(), "1".to_string())]),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: russh_sftp::protocol::OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let file = self
            .dispatcher
            .open(&filename, to_open_flags(pflags))
            .await
            .map_err(|e| fail("open", e))?;

        let handle = self.insert_handle(ServerHandle::File(file))?;
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(ok_status(id)),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_handle(&handle)?;
        let outcome = file
            .read_at(offset, len as usize)
            .await
            .map_err(|e| fail("read", e))?;

        if outcome.data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Data {
            id,
            data: outcome.data,
        })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file_handle(&handle)?;
        if !file.flags().write {
            return Err(StatusCode::PermissionDenied);
        }
        file.write_at(offset, &data)
            .await
            .into_result()
            .map_err(|e| fail("write", e))?;
        Ok(ok_status(id))
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = match self.handles.get(&handle) {
            Some(ServerHandle::File(file)) => {
                let info = file.stat().await.map_err(|e| fail("fstat", e))?;
                return Ok(Attrs {
                    id,
                    attrs: to_attributes(&info),
                });
            }
            Some(ServerHandle::Dir(dir)) => dir.path.clone(),
            None => return Err(StatusCode::NoSuchFile),
        };
        self.stat_path(id, path).await
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let file = self.file_handle(&handle)?;
        // Only the size is meaningful; times and modes are not stored.
        if let Some(size) = attrs.size {
            if !file.flags().write {
                return Err(StatusCode::PermissionDenied);
            }
            file.truncate(size).await.map_err(|e| fail("truncate", e))?;
        }
        Ok(ok_status(id))
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.run_command(id, Command::Setstat { path }).await
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat_path(id, path).await
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat_path(id, path).await
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = clean_path(&path);
        let infos = self
            .dispatcher
            .list(ListRequest::List { path: path.clone() })
            .await
            .map_err(|e| fail("opendir", e))?;

        let entries = infos
            .iter()
            .map(|info| File::new(info.name.clone(), to_attributes(info)))
            .collect();
        let handle = self.insert_handle(ServerHandle::Dir(DirHandle {
            path,
            entries,
        }))?;
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let dir = match self.handles.get_mut(&handle) {
            Some(ServerHandle::Dir(dir)) => dir,
            _ => return Err(StatusCode::NoSuchFile),
        };

        if dir.entries.is_empty() {
            return Err(StatusCode::Eof);
        }
        let batch = dir.entries.len().min(READDIR_BATCH_SIZE);
        let files = dir.entries.drain(..batch).collect();
        Ok(Name { id, files })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(clean_path(&path))],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.run_command(id, Command::Mkdir { path }).await
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.run_command(id, Command::Rmdir { path }).await
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.run_command(id, Command::Remove { path: filename }).await
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.run_command(
            id,
            Command::Rename {
                from: oldpath,
                to: newpath,
            },
        )
        .await
    }

    async fn readlink(&mut self, _id: u32, path: String) -> Result<Name, Self::Error> {
        self.dispatcher
            .list(ListRequest::Readlink { path })
            .await
            .map_err(|e| fail("readlink", e))?;
        Err(StatusCode::OpUnsupported)
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.run_command(
            id,
            Command::Symlink {
                target: targetpath,
                link: linkpath,
            },
        )
        .await
    }

    async fn extended(
        &mut self,
        id: u32,
        request: String,
        data: Vec<u8>,
    ) -> Result<Packet, Self::Error> {
        tracing::debug!(%request, "sftp extended request");

        #[derive(Deserialize)]
        struct PathPair {
            oldpath: String,
            newpath: String,
        }

        match request.as_str() {
            POSIX_RENAME_EXTENSION => {
                let PathPair { oldpath, newpath } =
                    russh_sftp::de::from_bytes(&mut data.into())
                        .map_err(|_| StatusCode::BadMessage)?;
                let status = self
                    .run_command(
                        id,
                        Command::PosixRename {
                            from: oldpath,
                            to: newpath,
                        },
                    )
                    .await?;
                Ok(Packet::Status(status))
            }
            HARDLINK => {
                let PathPair { oldpath, newpath } =
                    russh_sftp::de::from_bytes(&mut data.into())
                        .map_err(|_| StatusCode::BadMessage)?;
                let status = self
                    .run_command(
                        id,
                        Command::Link {
                            from: oldpath,
                            to: newpath,
                        },
                    )
                    .await?;
                Ok(Packet::Status(status))
            }
            STATVFS => Err(StatusCode::OpUnsupported),
            _ => Err(self.unimplemented()),
        }
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Rename { .. } => "rename",
        Command::PosixRename { .. } => "posix-rename",
        Command::Rmdir { .. } => "rmdir",
        Command::Remove { .. } => "remove",
        Command::Mkdir { .. } => "mkdir",
        Command::Link { .. } => "link",
        Command::Symlink { .. } => "symlink",
        Command::Setstat { .. } => "setstat",
    }
}

/// SFTP status for a VFS failure.
pub fn status_code(err: &VfsError) -> StatusCode {
    match err {
        VfsError::NotFound(_) => StatusCode::NoSuchFile,
        VfsError::PermissionDenied(_) => StatusCode::PermissionDenied,
        VfsError::Unsupported(_) | VfsError::CrossDeviceLink => StatusCode::OpUnsupported,
        VfsError::InvalidArgument(_) => StatusCode::BadMessage,
        _ => StatusCode::Failure,
    }
}

fn fail(op: &'static str, err: VfsError) -> StatusCode {
    let code = status_code(&err);
    match code {
        StatusCode::Failure => tracing::warn!(op, error = %err, "sftp request failed"),
        _ => tracing::debug!(op, error = %err, "sftp request refused"),
    }
    code
}

pub fn to_open_flags(pflags: russh_sftp::protocol::OpenFlags) -> OpenFlags {
    use russh_sftp::protocol::OpenFlags as P;

    OpenFlags {
        read: pflags.contains(P::READ),
        write: pflags.contains(P::WRITE),
        append: pflags.contains(P::APPEND),
        create: pflags.contains(P::CREATE),
        truncate: pflags.contains(P::TRUNCATE),
        exclusive: pflags.contains(P::EXCLUDE),
    }
}

pub fn to_attributes(info: &FileInfo) -> FileAttributes {
    let mtime = info.mtime.map(|t| u32::try_from(t).unwrap_or(u32::MAX));
    FileAttributes {
        size: Some(info.size),
        permissions: Some(info.mode()),
        atime: mtime,
        mtime,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cloudsftp_backend::{
        AuthenticateRequest, GatewayClient, MemoryGateway, RoundRobinSelector, Selector,
    };
    use cloudsftp_vfs::SessionIdentity;
    use russh_sftp::protocol::OpenFlags as P;
    use russh_sftp::server::Handler;

    async fn session_with_files(count: usize) -> SftpSession {
        let gw = Arc::new(MemoryGateway::new("machine-secret"));
        let uid = gw.add_user("admin");
        let home = gw.add_space("Admin", "personal", &uid);
        gw.mkdir_all(&home, "/big");
        for i in 0..count {
            gw.put_file(&home, &format!("/big/file-{i:04}.txt"), b"x");
        }

        let auth = gw
            .authenticate(AuthenticateRequest::machine("admin", "machine-secret"))
            .await
            .unwrap();
        let selector: Arc<dyn Selector> = Arc::new(RoundRobinSelector::single(gw.clone()));
        let identity = SessionIdentity::new(auth.user_id, auth.token);
        SftpSession::new(Dispatcher::new(selector, gw, identity))
    }

    #[tokio::test]
    async fn test_readdir_sends_bounded_batches() {
        let mut session = session_with_files(250).await;
        let Handle { handle, .. } = session.opendir(1, "/Admin/big".into()).await.unwrap();

        let mut sizes = Vec::new();
        let mut names = Vec::new();
        loop {
            match session.readdir(2, handle.clone()).await {
                Ok(name) => {
                    sizes.push(name.files.len());
                    names.extend(name.files.into_iter().map(|f| f.filename));
                }
                Err(code) => {
                    assert_eq!(code, StatusCode::Eof);
                    break;
                }
            }
        }
        assert_eq!(sizes, [100, 100, 50]);
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 250);

        // Exhausted handles keep answering Eof until closed.
        assert_eq!(session.readdir(3, handle).await.unwrap_err(), StatusCode::Eof);
    }

    #[tokio::test]
    async fn test_readdir_empty_directory() {
        let mut session = session_with_files(0).await;
        let Handle { handle, .. } = session.opendir(1, "/Admin/big".into()).await.unwrap();
        assert_eq!(session.readdir(2, handle).await.unwrap_err(), StatusCode::Eof);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_code(&VfsError::not_found("/x")), StatusCode::NoSuchFile);
        assert_eq!(
            status_code(&VfsError::PermissionDenied("/x".into())),
            StatusCode::PermissionDenied
        );
        assert_eq!(status_code(&VfsError::CrossDeviceLink), StatusCode::OpUnsupported);
        assert_eq!(status_code(&VfsError::unsupported("link")), StatusCode::OpUnsupported);
        assert_eq!(status_code(&VfsError::invalid_argument("flags")), StatusCode::BadMessage);
        assert_eq!(status_code(&VfsError::already_exists("/x")), StatusCode::Failure);
        assert_eq!(status_code(&VfsError::directory_not_empty("/x")), StatusCode::Failure);
    }

    #[test]
    fn test_open_flags() {
        let flags = to_open_flags(P::WRITE | P::CREATE | P::TRUNCATE);
        assert_eq!(flags, OpenFlags::create_truncate());

        let flags = to_open_flags(P::READ);
        assert_eq!(flags, OpenFlags::read_only());

        let flags = to_open_flags(P::WRITE | P::CREATE | P::EXCLUDE);
        assert!(flags.exclusive && flags.create && !flags.truncate);
    }

    #[test]
    fn test_attributes() {
        let attrs = to_attributes(&FileInfo::file("a.txt", 12, Some(1_700_000_000)));
        assert_eq!(attrs.size, Some(12));
        assert_eq!(attrs.permissions, Some(0o100644));
        assert_eq!(attrs.mtime, Some(1_700_000_000));
        assert!(attrs.is_regular());

        let attrs = to_attributes(&FileInfo::directory("d", 0o755, None));
        assert!(attrs.is_dir());
        assert_eq!(attrs.mtime, None);
    }
}
