//! Random-access file handle over whole-object transfer.
//!
//! The backend can only hand over a complete object (GET) or replace it
//! (PUT). A handle downloads the object once into memory, serves reads from
//! that copy, and re-uploads the full buffer after every mutation.
//!
//! ```text
//! Empty ──download──▶ Cached ──write/truncate──▶ Dirty ──upload──▶ Cached
//! ```
//!
//! A failed download leaves the handle empty so the next access retries. A
//! failed upload keeps the mutated buffer; the error goes to the caller and
//! the next successful upload carries the change.

use std::sync::Arc;

use cloudsftp_backend::{
    Code, DataTransport, Reference, Selector, UploadOptions, select_protocol,
};
use tokio::sync::Mutex;

use crate::error::{VfsError, VfsResult};
use crate::session::SessionIdentity;
use crate::types::{DEFAULT_MAX_OBJECT_BYTES, FileInfo, OpenFlags};

#[derive(Debug, Default)]
struct Cache {
    /// Authoritative content while `valid`; its length is the file size.
    data: Vec<u8>,
    valid: bool,
    etag: Option<String>,
}

/// Result of [`BufferedFileHandle::read_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    /// The read reached the last byte of the object.
    pub eof: bool,
}

/// Result of [`BufferedFileHandle::write_at`].
///
/// `written` counts bytes copied into the local buffer, even when `result`
/// reports a failed upload.
#[derive(Debug)]
pub struct WriteOutcome {
    pub written: usize,
    pub result: VfsResult<()>,
}

impl WriteOutcome {
    pub fn into_result(self) -> VfsResult<usize> {
        self.result.map(|()| self.written)
    }
}

/// One open file. Owned by the SFTP handle that opened it.
pub struct BufferedFileHandle {
    reference: Reference,
    path: String,
    flags: OpenFlags,
    selector: Arc<dyn Selector>,
    transport: Arc<dyn DataTransport>,
    identity: Arc<SessionIdentity>,
    /// Largest object the cache may hold.
    max_size: u64,
    cache: Mutex<Cache>,
}

impl std::fmt::Debug for BufferedFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFileHandle")
            .field("path", &self.path)
            .field("reference", &self.reference)
            .field("flags", &self.flags)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl BufferedFileHandle {
    pub fn new(
        reference: Reference,
        path: impl Into<String>,
        flags: OpenFlags,
        selector: Arc<dyn Selector>,
        transport: Arc<dyn DataTransport>,
        identity: Arc<SessionIdentity>,
    ) -> Self {
        Self {
            reference,
            path: path.into(),
            flags,
            selector,
            transport,
            identity,
            max_size: DEFAULT_MAX_OBJECT_BYTES,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Cap the object size this handle will cache or grow to.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Absolute SFTP path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> VfsResult<ReadOutcome> {
        let mut cache = self.cache.lock().await;
        if !cache.valid {
            self.download(&mut cache).await?;
        }

        let size = cache.data.len() as u64;
        if offset >= size {
            return Ok(ReadOutcome {
                data: Vec::new(),
                eof: true,
            });
        }

        let start = offset as usize;
        let end = start.saturating_add(len).min(cache.data.len());
        Ok(ReadOutcome {
            data: cache.data[start..end].to_vec(),
            eof: end as u64 >= size,
        })
    }

    /// Copy `data` into the buffer at `offset` and upload the whole object.
    ///
    /// With `append` set, the offset is ignored and data lands at the end.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> WriteOutcome {
        let mut cache = self.cache.lock().await;
        if !cache.valid {
            if let Err(e) = self.download(&mut cache).await {
                return WriteOutcome {
                    written: 0,
                    result: Err(e),
                };
            }
        }

        let start = if self.flags.append {
            cache.data.len() as u64
        } else {
            offset
        };
        let range = start
            .checked_add(data.len() as u64)
            .ok_or_else(|| VfsError::invalid_argument(format!("offset {offset}")))
            .and_then(|end| self.checked_size(end))
            .and_then(|end| grow(&mut cache.data, end).map(|()| end - data.len()..end));
        let range = match range {
            Ok(range) => range,
            Err(e) => {
                return WriteOutcome {
                    written: 0,
                    result: Err(e),
                };
            }
        };
        cache.data[range].copy_from_slice(data);

        let result = self.upload(&mut cache).await;
        if let Err(e) = &result {
            tracing::warn!(path = %self.path, error = %e, "upload after write failed");
        }
        WriteOutcome {
            written: data.len(),
            result,
        }
    }

    /// Resize to `size` bytes (zero-fill on grow) and upload.
    pub async fn truncate(&self, size: u64) -> VfsResult<()> {
        let size = self.checked_size(size)?;

        let mut cache = self.cache.lock().await;
        if !cache.valid {
            if size == 0 {
                // Nothing of the old content survives; skip the download.
                cache.data.clear();
                cache.etag = None;
                cache.valid = true;
            } else {
                self.download(&mut cache).await?;
            }
        }

        grow(&mut cache.data, size)?;
        cache.data.truncate(size);
        self.upload(&mut cache).await
    }

    /// `size` as a buffer length, refused above the handle's limit.
    fn checked_size(&self, size: u64) -> VfsResult<usize> {
        if size > self.max_size {
            return Err(VfsError::invalid_argument(format!(
                "{}: {size} bytes exceeds the {} byte object limit",
                self.path, self.max_size
            )));
        }
        usize::try_from(size).map_err(|_| VfsError::invalid_argument(format!("size {size}")))
    }

    /// Metadata for the open file. Reports the cached size once loaded.
    pub async fn stat(&self) -> VfsResult<FileInfo> {
        let cache = self.cache.lock().await;
        if cache.valid {
            return Ok(FileInfo::file(self.name(), cache.data.len() as u64, None));
        }
        drop(cache);

        let client = self.selector.next()?;
        let resp = client.stat(&self.identity.token, &self.reference).await?;
        if !resp.status.is_ok() {
            return Err(VfsError::from_status("stat", &self.path, &resp.status));
        }
        let info = resp
            .info
            .ok_or_else(|| VfsError::not_found(self.path.clone()))?;
        Ok(FileInfo::from_resource(self.name(), &info))
    }

    async fn download(&self, cache: &mut Cache) -> VfsResult<()> {
        let token = &self.identity.token;

        let client = self.selector.next()?;
        let stat = client.stat(token, &self.reference).await?;
        if stat.status.code == Code::NotFound {
            tracing::debug!(path = %self.path, "object absent, starting empty");
            cache.data.clear();
            cache.etag = None;
            cache.valid = true;
            return Ok(());
        }
        if !stat.status.is_ok() {
            return Err(VfsError::from_status("stat", &self.path, &stat.status));
        }
        if let Some(info) = &stat.info {
            if info.is_container() {
                return Err(VfsError::is_a_directory(self.path.clone()));
            }
            self.checked_size(info.size)?;
        }

        let client = self.selector.next()?;
        let resp = client.initiate_file_download(token, &self.reference).await?;
        if !resp.status.is_ok() {
            return Err(VfsError::from_status("download", &self.path, &resp.status));
        }
        let endpoint = select_protocol(&resp.protocols)?;
        let download = self.transport.download(endpoint, token).await?;

        tracing::debug!(path = %self.path, bytes = download.body.len(), "cached object");
        cache.data = download.body;
        cache.etag = download
            .etag
            .or_else(|| stat.info.and_then(|info| info.etag));
        cache.valid = true;
        Ok(())
    }

    async fn upload(&self, cache: &mut Cache) -> VfsResult<()> {
        let token = &self.identity.token;

        let client = self.selector.next()?;
        let options = UploadOptions {
            upload_length: cache.data.len() as u64,
            if_match: cache.etag.clone(),
        };
        let resp = client
            .initiate_file_upload(token, &self.reference, options)
            .await?;
        if !resp.status.is_ok() {
            return Err(VfsError::from_status("upload", &self.path, &resp.status));
        }
        let endpoint = select_protocol(&resp.protocols)?;
        cache.etag = self
            .transport
            .upload(endpoint, token, cache.data.clone())
            .await?;

        tracing::debug!(path = %self.path, bytes = cache.data.len(), "uploaded object");
        Ok(())
    }
}

/// Zero-extend `data` to `len` bytes. Allocation failure is an error.
fn grow(data: &mut Vec<u8>, len: usize) -> VfsResult<()> {
    if len > data.len() {
        data.try_reserve_exact(len - data.len()).map_err(|e| {
            VfsError::invalid_argument(format!("cannot buffer {len} bytes: {e}"))
        })?;
        data.resize(len, 0);
    }
    Ok(())
}
