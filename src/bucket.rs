use std::{ops::ControlFlow, sync::Arc};

use tracing::debug;

use crate::{
    adapters::ObjectAdapter,
    handle::{DirHandle, Handle, RemoteFile},
    lister::{self, ListIterator, ListOptions},
    model::fs::{FSError, FileInfo},
};

/// A bucket seen as a directory tree. Directories are never stored: a name
/// is a directory when at least one key lives under `name/`.
#[derive(Clone)]
pub struct Bucket {
    adapter: Arc<dyn ObjectAdapter>,
    name: String,
}

impl Bucket {
    pub fn new(adapter: Arc<dyn ObjectAdapter>, name: &str) -> Self {
        Self {
            adapter,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn ObjectAdapter> {
        &self.adapter
    }

    /// Opens `name` as an object when one exists under that exact key,
    /// otherwise as the directory of keys below it.
    pub fn open(&self, name: &str) -> Result<Handle, FSError> {
        let key = name.trim_start_matches('/');
        let is_root = key.is_empty() || key == ".";

        if !is_root {
            match self.adapter.fs_head_object(key)? {
                Some(obj) => {
                    debug!(bucket=%self.name, key=key, size=obj.size, "open object");
                    let info = FileInfo::file(base_name(key), obj.size, obj.modified_time);
                    return Ok(Handle::Remote(RemoteFile::new(
                        self.adapter.clone(),
                        key,
                        info,
                    )));
                }
                None if is_index_page(key) => return Err(FSError::NotFound(name.to_string())),
                None => {}
            }
        }

        let entries = lister::readdir(self.adapter.as_ref(), key)?;
        if entries.is_empty() && !is_root {
            return Err(FSError::NotFound(name.to_string()));
        }

        debug!(bucket=%self.name, dir=key, items=entries.len(), "open dir");
        let dir = if is_root { "." } else { base_name(key) };
        Ok(Handle::Dir(DirHandle::new(FileInfo::dir(dir), entries)))
    }

    pub fn readdir(&self, dir: &str) -> Result<Vec<FileInfo>, FSError> {
        lister::readdir(self.adapter.as_ref(), dir)
    }

    pub fn walk<F>(&self, dir: &str, visit: F) -> Result<(), FSError>
    where
        F: FnMut(&str, &FileInfo) -> ControlFlow<()>,
    {
        lister::walk(self.adapter.as_ref(), dir, visit)
    }

    pub fn list(&self, opts: &ListOptions) -> ListIterator<'_> {
        lister::list(self.adapter.as_ref(), opts)
    }
}

/// Index pages are served as objects or not at all.
fn is_index_page(key: &str) -> bool {
    key.ends_with("/index.html")
}

fn base_name(key: &str) -> &str {
    let key = key.trim_end_matches('/');
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::adapters::mock::MockClient;

    fn bucket(objects: &[(&str, usize)]) -> (Arc<MockClient>, Bucket) {
        let client = Arc::new(MockClient::with_objects(objects));
        let bucket = Bucket::new(client.clone(), "b");
        (client, bucket)
    }

    #[test]
    fn test_base_name() {
        let cases = vec![("a/b/c.txt", "c.txt"), ("a/b/", "b"), ("top", "top")];

        for (input, expected) in cases {
            assert_eq!(base_name(input), expected, "failed for case: {}", input);
        }
    }

    #[test]
    fn test_open_object() {
        let (_client, bucket) = bucket(&[("a/x.txt", 100), ("a/y/z.txt", 5)]);

        let mut handle = bucket.open("/a/y/z.txt").unwrap();
        assert!(!handle.is_dir());
        assert_eq!(handle.stat().name, "z.txt");
        assert_eq!(handle.stat().size, 5);

        let mut body = Vec::new();
        handle.read_to_end(&mut body).unwrap();
        assert_eq!(body, vec![b'x'; 5]);
    }

    #[test]
    fn test_open_synthesizes_dirs() {
        let (_client, bucket) = bucket(&[("a/x.txt", 100), ("a/y/z.txt", 5)]);

        let cases = vec![
            ("/", vec!["a"]),
            (".", vec!["a"]),
            ("", vec!["a"]),
            ("/a", vec!["x.txt", "y"]),
            ("a/y", vec!["z.txt"]),
        ];

        for (input, expected) in cases {
            let mut handle = bucket.open(input).unwrap();
            assert!(handle.is_dir(), "failed for case: {}", input);
            let names: Vec<String> = handle
                .readdir(-1)
                .unwrap()
                .into_iter()
                .map(|fi| fi.name)
                .collect();
            assert_eq!(names, expected, "failed for case: {}", input);
        }
    }

    #[test]
    fn test_open_missing() {
        let (_client, bucket) = bucket(&[("a/x.txt", 1), ("site/index.html/extra", 1)]);

        let cases = vec!["/nope", "/a/x", "/site/index.html"];

        for input in cases {
            assert!(
                matches!(bucket.open(input), Err(FSError::NotFound(_))),
                "failed for case: {}",
                input
            );
        }
    }

    #[test]
    fn test_open_empty_root() {
        let (_client, bucket) = bucket(&[]);
        let mut handle = bucket.open("/").unwrap();
        assert!(handle.readdir(-1).unwrap().is_empty());
    }

    #[test]
    fn test_open_propagates_remote_errors() {
        let (client, bucket) = bucket(&[("a/x.txt", 1)]);
        client
            .fail_list
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(matches!(bucket.open("/a"), Err(FSError::Remote { .. })));
        assert!(bucket.open("/a/x.txt").is_ok());
    }
}
