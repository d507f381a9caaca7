use std::{
    fs::Metadata,
    time::{Duration, SystemTime},
};

use fuser::FileAttr;
use thiserror::Error;

pub const MODE_DIR: u32 = 0o040000;
pub const MODE_REGULAR: u32 = 0o100000;

/// Extra mode bit set on entries that describe a remote object or a remote
/// directory whose listing has not been cached locally.
pub const MODE_REMOTE: u32 = 1 << 31;

#[derive(Debug, Error)]
pub enum FSError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("{message}")]
    Remote { message: String },

    #[error("failed to decode: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FSError {
    pub fn remote(message: impl Into<String>) -> Self {
        FSError::Remote {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FSError::NotFound(_) => true,
            FSError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn errno(&self) -> libc::c_int {
        match self {
            FSError::NotFound(_) => libc::ENOENT,
            FSError::Permission(_) => libc::EACCES,
            FSError::NotADirectory(_) => libc::ENOTDIR,
            FSError::IsADirectory(_) => libc::EISDIR,
            FSError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FSError::Remote { .. } | FSError::Decode(_) => libc::EIO,
        }
    }
}

impl From<FSError> for std::io::Error {
    fn from(err: FSError) -> Self {
        match err {
            FSError::Io(err) => err,
            FSError::NotFound(name) => std::io::Error::new(std::io::ErrorKind::NotFound, name),
            FSError::Permission(msg) => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, msg)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// A single record of a bucket listing. Directories are synthesized from a
/// delimiter grouping: `key` keeps the trailing delimiter and every other
/// field is zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FSObject {
    pub key: String,
    pub size: u64,
    pub modified_time: SystemTime,
    pub is_dir: bool,
}

impl FSObject {
    pub fn file(key: &str, size: u64, modified_time: SystemTime) -> Self {
        Self {
            key: key.to_string(),
            size,
            modified_time,
            is_dir: false,
        }
    }

    pub fn dir(key: &str) -> Self {
        Self {
            key: key.to_string(),
            size: 0,
            modified_time: SystemTime::UNIX_EPOCH,
            is_dir: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<FSObject>,
    pub next_page_token: String,
    pub is_last_page: bool,
}

/// Metadata of a file or directory as seen through the filesystem surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified_time: SystemTime,
    pub is_dir: bool,
    pub remote: bool,
}

impl FileInfo {
    pub fn file(name: &str, size: u64, modified_time: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            size,
            modified_time,
            is_dir: false,
            remote: false,
        }
    }

    pub fn dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            modified_time: SystemTime::UNIX_EPOCH,
            is_dir: true,
            remote: false,
        }
    }

    pub fn from_metadata(name: &str, meta: &Metadata) -> Self {
        Self {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: meta.is_dir(),
            remote: meta.file_type().is_symlink(),
        }
    }

    pub fn into_remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn mode(&self) -> u32 {
        let mut mode = if self.is_dir {
            MODE_DIR | 0o755
        } else {
            MODE_REGULAR | 0o644
        };
        if self.remote {
            mode |= MODE_REMOTE;
        }
        mode
    }
}

/// Kodo reports `putTime` in units of 100 nanoseconds.
pub fn from_put_time(put_time: i64) -> SystemTime {
    if put_time <= 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::from_nanos(put_time as u64 * 100)
}

#[derive(Clone, Debug)]
pub struct Node {
    pub attr: FileAttr,
    pub key: String,
    pub name: String,
    pub parent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_put_time() {
        let cases = vec![
            (0, SystemTime::UNIX_EPOCH),
            (-5, SystemTime::UNIX_EPOCH),
            (
                16_000_000_000_000_000,
                SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000),
            ),
            (
                16_000_000_000_000_001,
                SystemTime::UNIX_EPOCH + Duration::new(1_600_000_000, 100),
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(from_put_time(input), expected, "failed for case: {}", input);
        }
    }

    #[test]
    fn test_mode() {
        let file = FileInfo::file("a.txt", 3, SystemTime::UNIX_EPOCH);
        assert_eq!(file.mode() & MODE_DIR, 0);
        assert_eq!(file.mode() & MODE_REMOTE, 0);

        let remote_dir = FileInfo::dir("a").into_remote();
        assert_eq!(remote_dir.mode() & MODE_DIR, MODE_DIR);
        assert_eq!(remote_dir.mode() & MODE_REMOTE, MODE_REMOTE);
    }

    #[test]
    fn test_dir_info_is_stable() {
        let first = FileInfo::dir("a");
        std::thread::sleep(Duration::from_millis(2));
        let second = FileInfo::dir("a");

        assert_eq!(first, second);
        assert_eq!(first.modified_time, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_is_not_found() {
        let cases = vec![
            (FSError::NotFound("a".to_string()), true),
            (
                FSError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)),
                true,
            ),
            (
                FSError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
                false,
            ),
            (FSError::remote("boom"), false),
        ];

        for (err, expected) in cases {
            assert_eq!(err.is_not_found(), expected, "failed for case: {}", err);
        }
    }
}
