use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::PathBuf,
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    adapters::ObjectAdapter,
    model::fs::{FSError, FileInfo},
    stub,
};

/// Observer told about every remote file whose content was cached locally.
pub trait NotifyFile: Send + Sync {
    fn notify_file(&self, name: &str, info: &FileInfo);
}

/// An open file or directory. Files support `Read` and `Seek`, directories
/// support [`Handle::readdir`]; all variants close through [`Handle::close`].
pub enum Handle {
    Remote(RemoteFile),
    Cached(CachedFile),
    Local(LocalFile),
    Dir(DirHandle),
}

impl Handle {
    pub fn stat(&self) -> &FileInfo {
        match self {
            Handle::Remote(f) => &f.info,
            Handle::Cached(f) => &f.file.info,
            Handle::Local(f) => &f.info,
            Handle::Dir(d) => &d.info,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Handle::Dir(_))
    }

    /// Returns up to `n` entries, or every remaining entry when `n <= 0`.
    /// An empty result means the listing is exhausted.
    pub fn readdir(&mut self, n: i64) -> Result<Vec<FileInfo>, FSError> {
        match self {
            Handle::Dir(d) => Ok(d.readdir(n)),
            other => Err(FSError::NotADirectory(other.stat().name.clone())),
        }
    }

    pub fn close(self) -> Result<(), FSError> {
        match self {
            Handle::Cached(f) => f.close(),
            Handle::Remote(_) | Handle::Local(_) | Handle::Dir(_) => Ok(()),
        }
    }
}

impl Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Handle::Remote(f) => f.read(buf),
            Handle::Cached(f) => f.file.read(buf),
            Handle::Local(f) => f.file.read(buf),
            Handle::Dir(d) => Err(FSError::IsADirectory(d.info.name.clone()).into()),
        }
    }
}

impl Seek for Handle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Handle::Remote(f) => f.seek(pos),
            Handle::Cached(f) => f.file.seek(pos),
            Handle::Local(f) => f.file.seek(pos),
            Handle::Dir(d) => Err(FSError::IsADirectory(d.info.name.clone()).into()),
        }
    }
}

/// Remote object read with ranged downloads.
pub struct RemoteFile {
    adapter: Arc<dyn ObjectAdapter>,
    key: String,
    info: FileInfo,
    pos: u64,
}

impl RemoteFile {
    pub fn new(adapter: Arc<dyn ObjectAdapter>, key: &str, info: FileInfo) -> Self {
        Self {
            adapter,
            key: key.to_string(),
            info,
            pos: 0,
        }
    }

    pub fn download(&self) -> Result<Vec<u8>, FSError> {
        match self.adapter.fs_download_object(&self.key, None)? {
            None => Err(FSError::NotFound(self.key.clone())),
            Some(bytes) => Ok(bytes),
        }
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.info.size {
            return Ok(0);
        }

        let end = (self.pos + buf.len() as u64).min(self.info.size) - 1;
        let bytes = match self.adapter.fs_download_object(&self.key, Some((self.pos, end)))? {
            None => return Err(FSError::NotFound(self.key.clone()).into()),
            Some(bytes) => bytes,
        };

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.info.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };

        match next {
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
        }
    }
}

/// Remote object that is persisted to `local` when closed.
pub struct CachedFile {
    file: RemoteFile,
    name: String,
    local: PathBuf,
    notify: Option<Arc<dyn NotifyFile>>,
}

impl CachedFile {
    pub fn new(
        file: RemoteFile,
        name: &str,
        local: PathBuf,
        notify: Option<Arc<dyn NotifyFile>>,
    ) -> Self {
        Self {
            file,
            name: name.to_string(),
            local,
            notify,
        }
    }

    /// Caching failures are logged and never fail the close.
    pub fn close(self) -> Result<(), FSError> {
        let info = &self.file.info;
        let cached = self
            .file
            .download()
            .and_then(|bytes| stub::materialize(&self.local, &bytes, info.modified_time));

        match cached {
            Err(err) => {
                warn!(error_message=%err, error_group="cache_file", name=%self.name, "cache file failed");
            }
            Ok(()) => {
                debug!(name=%self.name, local=%self.local.display(), "cached file");
                if let Some(notify) = &self.notify {
                    notify.notify_file(&self.name, info);
                }
            }
        }

        Ok(())
    }
}

pub struct LocalFile {
    file: File,
    info: FileInfo,
}

impl LocalFile {
    pub fn new(file: File, info: FileInfo) -> Self {
        Self { file, info }
    }
}

/// Directory whose entries were listed up front.
pub struct DirHandle {
    info: FileInfo,
    entries: Vec<FileInfo>,
    pos: usize,
}

impl DirHandle {
    pub fn new(info: FileInfo, entries: Vec<FileInfo>) -> Self {
        Self {
            info,
            entries,
            pos: 0,
        }
    }

    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    fn readdir(&mut self, n: i64) -> Vec<FileInfo> {
        let remaining = self.entries.len() - self.pos;
        let count = if n <= 0 {
            remaining
        } else {
            (n as usize).min(remaining)
        };

        let out = self.entries[self.pos..self.pos + count].to_vec();
        self.pos += count;
        out
    }
}
