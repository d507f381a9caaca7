use std::{
    collections::{HashMap, HashSet},
    ffi::OsStr,
    os::unix::fs::MetadataExt,
    io::{Read, Seek, SeekFrom},
    sync::Arc,
    time::Duration,
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request,
};
use libc::{EIO, EISDIR, ENOENT, ENOTDIR, EROFS};
use tracing::{error, info, span, warn, Level};

use crate::{
    fs::CachedFS,
    handle::Handle,
    model::{
        self,
        fs::{FSError, FileInfo},
    },
};

pub const ROOT_INO: u64 = 1;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// Read-only FUSE surface over a [`CachedFS`].
pub struct KodoFuse {
    fs: Arc<CachedFS>,
    current_ino: u64,
    ino_to_node: HashMap<u64, model::fs::Node>,
    key_to_ino: HashMap<String, u64>,
    next_fh: u64,
    files: HashMap<u64, Handle>,
    dirs: HashMap<u64, Vec<(u64, FileType, String)>>,
    uid: u32,
    gid: u32,
}

impl KodoFuse {
    pub fn new(fs: Arc<CachedFS>) -> Self {
        // entries are owned by whoever owns the cache root
        let (uid, gid) = std::fs::metadata(fs.root())
            .map(|meta| (meta.uid(), meta.gid()))
            .unwrap_or((0, 0));

        let root = model::fs::Node {
            attr: to_attr(ROOT_INO, &FileInfo::dir("."), uid, gid),
            key: String::new(),
            name: ".".to_string(),
            parent: ROOT_INO,
        };

        let mut ino_to_node = HashMap::new();
        ino_to_node.insert(ROOT_INO, root);
        let mut key_to_ino = HashMap::new();
        key_to_ino.insert(String::new(), ROOT_INO);

        Self {
            fs,
            current_ino: ROOT_INO,
            ino_to_node,
            key_to_ino,
            next_fh: 0,
            files: HashMap::new(),
            dirs: HashMap::new(),
            uid,
            gid,
        }
    }

    pub fn next_ino(&mut self) -> u64 {
        self.current_ino += 1;
        self.current_ino
    }

    fn next_fh(&mut self) -> u64 {
        self.next_fh += 1;
        self.next_fh
    }

    /// Records `info` as the child `key` of `parent`, reusing the inode of
    /// a key seen before.
    pub fn index(&mut self, parent: u64, key: &str, info: &FileInfo) -> FileAttr {
        if let Some(ino) = self.key_to_ino.get(key).copied() {
            let attr = to_attr(ino, info, self.uid, self.gid);
            if let Some(node) = self.ino_to_node.get_mut(&ino) {
                node.attr = attr;
            }
            return attr;
        }

        let ino = self.next_ino();
        let attr = to_attr(ino, info, self.uid, self.gid);
        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        self.ino_to_node.insert(
            ino,
            model::fs::Node {
                attr,
                key: key.to_string(),
                name,
                parent,
            },
        );
        self.key_to_ino.insert(key.to_string(), ino);

        attr
    }

    pub fn get_children(&self, parent_ino: u64) -> Vec<model::fs::Node> {
        let mut children = Vec::new();
        for (ino, node) in &self.ino_to_node {
            if node.parent == parent_ino && *ino != ROOT_INO {
                children.push(node.clone());
            }
        }

        children
    }

    fn node_key(&self, ino: u64) -> Option<String> {
        self.ino_to_node.get(&ino).map(|n| n.key.clone())
    }

    /// Lists `key` through the cache and indexes every entry under `ino`.
    fn list_dir(&mut self, ino: u64, key: &str) -> Result<Vec<(u64, FileType, String)>, FSError> {
        let mut handle = self.fs.open(&format!("/{}", key))?;
        if !handle.is_dir() {
            return Err(FSError::NotADirectory(key.to_string()));
        }
        let mut entries = Vec::new();
        for info in handle.readdir(-1)? {
            let attr = self.index(ino, &child_key(key, &info.name), &info);
            entries.push((attr.ino, attr.kind, info.name));
        }
        handle.close()?;

        // drop children that are gone from the listing
        let listed: HashSet<u64> = entries.iter().map(|(ino, _, _)| *ino).collect();
        for child in self.get_children(ino) {
            if !listed.contains(&child.attr.ino) {
                self.ino_to_node.remove(&child.attr.ino);
                self.key_to_ino.remove(&child.key);
            }
        }

        Ok(entries)
    }
}

impl Filesystem for KodoFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        let span = span!(Level::INFO, "init", context = "init");
        let _e = span.enter();
        info!(root=%self.fs.root().display(), bucket=self.fs.bucket().name(), offline=self.fs.is_offline(), "called");

        Ok(())
    }

    fn destroy(&mut self) {
        let span = span!(Level::INFO, "destroy", context = "destroy");
        let _e = span.enter();
        info!("called");

        for (_, handle) in self.files.drain() {
            if let Err(err) = handle.close() {
                error!(error_message=%err, error_group="close");
            }
        }
        self.dirs.clear();

        if !self.fs.wait_idle(Duration::from_secs(30)) {
            warn!("stub writes still pending at unmount");
        }
        self.ino_to_node.retain(|ino, _| *ino == ROOT_INO);
        self.key_to_ino.retain(|key, _| key.is_empty());
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let span = span!(Level::INFO, "lookup", context = "lookup");
        let _e = span.enter();
        info!(parent_ino=parent, filename=%name.to_string_lossy(), "called");

        let parent_key = match self.node_key(parent) {
            None => {
                error!(
                    error_message = "failed to find parent ino",
                    error_group = "not_found",
                    parent_ino = parent
                );
                reply.error(ENOENT);
                return;
            }
            Some(key) => key,
        };

        let name = name.to_string_lossy();
        let key = child_key(&parent_key, &name);
        let offline = self.fs.is_offline();

        match self.fs.stat(&format!("/{}", key)) {
            Ok(info) if offline && info.remote && !info.is_dir => {
                reply.error(ENOENT);
                return;
            }
            Ok(info) => {
                let attr = self.index(parent, &key, &info);
                reply.entry(&TTL, &attr, 0);
                return;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                error!(error_message=%err, error_group="stat", key=%key);
                reply.error(err.errno());
                return;
            }
        }

        if offline {
            reply.error(ENOENT);
            return;
        }

        let entries = match self.list_dir(parent, &parent_key) {
            Err(err) => {
                if !err.is_not_found() {
                    error!(error_message=%err, error_group="list_dir", key=%parent_key);
                }
                reply.error(err.errno());
                return;
            }
            Ok(entries) => entries,
        };

        let found = entries.iter().find(|(_, _, n)| *n == name).map(|(ino, _, _)| *ino);
        match found.and_then(|ino| self.ino_to_node.get(&ino)) {
            None => reply.error(ENOENT),
            Some(node) => reply.entry(&TTL, &node.attr, 0),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let span = span!(Level::INFO, "getattr", context = "getattr");
        let _e = span.enter();
        info!(ino = ino, fh = fh, "called");

        let node = match self.ino_to_node.get(&ino) {
            None => {
                error!(
                    error_message = "failed to find ino",
                    error_group = "not_found",
                    ino = ino
                );
                reply.error(ENOENT);
                return;
            }
            Some(n) => n,
        };

        reply.attr(&TTL, &node.attr);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let span = span!(Level::INFO, "opendir", context = "opendir");
        let _e = span.enter();
        info!(ino = ino, flags = flags, "called");

        let key = match self.node_key(ino) {
            None => {
                reply.error(ENOENT);
                return;
            }
            Some(key) => key,
        };

        let children = match self.list_dir(ino, &key) {
            Err(err) => {
                if !err.is_not_found() {
                    error!(error_message=%err, error_group="list_dir", key=%key);
                }
                reply.error(err.errno());
                return;
            }
            Ok(children) => children,
        };

        let parent = self.ino_to_node.get(&ino).map(|n| n.parent).unwrap_or(ROOT_INO);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        entries.extend(children);

        let fh = self.next_fh();
        self.dirs.insert(fh, entries);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let span = span!(Level::INFO, "readdir", context = "readdir");
        let _e = span.enter();
        info!(ino = ino, fh = fh, offset = offset, "called");

        let entries = match self.dirs.get(&fh) {
            None => {
                error!(
                    error_message = "failed to find dir handle",
                    error_group = "not_found",
                    fh = fh
                );
                reply.error(ENOTDIR);
                return;
            }
            Some(entries) => entries,
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(entry.0, next_offset, entry.1, &entry.2) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let span = span!(Level::INFO, "releasedir", context = "releasedir");
        let _e = span.enter();
        info!(ino = ino, fh = fh, "called");

        self.dirs.remove(&fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let span = span!(Level::INFO, "open", context = "open");
        let _e = span.enter();
        info!(ino = ino, flags = flags, "called");

        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(EROFS);
            return;
        }

        let key = match self.node_key(ino) {
            None => {
                reply.error(ENOENT);
                return;
            }
            Some(key) => key,
        };

        let handle = match self.fs.open(&format!("/{}", key)) {
            Err(err) => {
                if !err.is_not_found() {
                    error!(error_message=%err, error_group="open", key=%key);
                }
                reply.error(err.errno());
                return;
            }
            Ok(handle) => handle,
        };

        if handle.is_dir() {
            reply.error(EISDIR);
            return;
        }

        let parent = self.ino_to_node.get(&ino).map(|n| n.parent).unwrap_or(ROOT_INO);
        let info = handle.stat().clone();
        self.index(parent, &key, &info);

        let fh = self.next_fh();
        self.files.insert(fh, handle);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let span = span!(Level::INFO, "read", context = "read");
        let _e = span.enter();
        info!(ino = ino, fh = fh, offset = offset, size = size, "called");

        let handle = match self.files.get_mut(&fh) {
            None => {
                error!(
                    error_message = "failed to find file handle",
                    error_group = "not_found",
                    fh = fh
                );
                reply.error(ENOENT);
                return;
            }
            Some(h) => h,
        };

        match read_at(handle, offset.max(0) as u64, size as usize) {
            Err(err) => {
                error!(error_message=%err, error_group="read", ino = ino);
                reply.error(err.raw_os_error().unwrap_or(EIO));
            }
            Ok(bytes) => reply.data(&bytes),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let span = span!(Level::INFO, "release", context = "release");
        let _e = span.enter();
        info!(ino = ino, fh = fh, "called");

        let handle = match self.files.remove(&fh) {
            None => {
                reply.ok();
                return;
            }
            Some(h) => h,
        };

        match handle.close() {
            Err(err) => {
                error!(error_message=%err, error_group="close", ino = ino);
                reply.error(err.errno());
            }
            Ok(()) => reply.ok(),
        }
    }
}

fn read_at(handle: &mut Handle, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    handle.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = handle.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    Ok(buf)
}

pub fn child_key(parent_key: &str, name: &str) -> String {
    if parent_key.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent_key, name)
    }
}

pub fn to_attr(ino: u64, info: &FileInfo, uid: u32, gid: u32) -> FileAttr {
    let (kind, perm, nlink) = if info.is_dir {
        (FileType::Directory, 0o555, 2)
    } else {
        (FileType::RegularFile, 0o444, 1)
    };
    let mtime = info.modified_time;

    FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(BLOCK_SIZE as u64),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{
        adapters::mock::MockClient,
        bucket::Bucket,
        fs::CacheOptions,
    };

    fn kodo_fuse(objects: &[(&str, usize)]) -> (tempfile::TempDir, KodoFuse) {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(MockClient::with_objects(objects));
        let fs = CachedFS::new(
            dir.path(),
            Bucket::new(client, "b"),
            None,
            &CacheOptions::default(),
        )
        .unwrap();
        (dir, KodoFuse::new(Arc::new(fs)))
    }

    #[test]
    fn test_next_ino() {
        let (_dir, mut fs) = kodo_fuse(&[]);

        let cases = vec![2, 3];

        for expected in cases {
            let result = fs.next_ino();
            assert_eq!(result, expected);
        }
    }

    #[test]
    fn test_index() {
        let (_dir, mut fs) = kodo_fuse(&[]);
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let cases = vec![
            ("a", FileInfo::dir("a"), ROOT_INO, 2, FileType::Directory),
            ("a/x.txt", FileInfo::file("x.txt", 100, mtime), 2, 3, FileType::RegularFile),
            ("a/x.txt", FileInfo::file("x.txt", 7, mtime), 2, 3, FileType::RegularFile),
        ];

        for (key, info, parent, expected_ino, expected_kind) in cases {
            let attr = fs.index(parent, key, &info);

            assert_eq!(attr.ino, expected_ino, "failed on `ino` for case: {}", key);
            assert_eq!(attr.kind, expected_kind, "failed on `kind` for case: {}", key);
            assert_eq!(attr.size, info.size, "failed on `size` for case: {}", key);

            let node = fs.ino_to_node.get(&expected_ino).unwrap();
            assert_eq!(node.parent, parent, "failed on `parent` for case: {}", key);
            assert_eq!(node.key, key, "failed on `key` for case: {}", key);
            assert_eq!(node.attr.size, info.size, "failed on `attr.size` for case: {}", key);
        }

        assert_eq!(fs.ino_to_node.get(&3).unwrap().name, "x.txt");
        assert_eq!(fs.ino_to_node.get(&3).unwrap().attr.mtime, mtime);
    }

    #[test]
    fn test_get_children() {
        let (_dir, mut fs) = kodo_fuse(&[]);

        assert_eq!(fs.get_children(ROOT_INO).len(), 0);

        fs.index(ROOT_INO, "a", &FileInfo::dir("a"));
        fs.index(ROOT_INO, "b", &FileInfo::dir("b"));
        fs.index(2, "a/c", &FileInfo::dir("c"));

        assert_eq!(fs.get_children(ROOT_INO).len(), 2);
        assert_eq!(fs.get_children(2).len(), 1);
    }

    #[test]
    fn test_child_key() {
        let cases = vec![("", "a", "a"), ("a", "b.txt", "a/b.txt"), ("a/b", "c", "a/b/c")];

        for (parent, name, expected) in cases {
            assert_eq!(child_key(parent, name), expected, "failed for case: {}", name);
        }
    }

    #[test]
    fn test_get_root_attr() {
        let (dir, fs) = kodo_fuse(&[]);

        let root_attr = fs.ino_to_node.get(&ROOT_INO).unwrap().attr;
        let owner = std::fs::metadata(dir.path()).unwrap();

        assert_eq!(root_attr.ino, 1, "expected root attr ino to be 1");
        assert_eq!(root_attr.kind, FileType::Directory);
        assert_eq!((root_attr.uid, root_attr.gid), (owner.uid(), owner.gid()));
    }

    #[test]
    fn test_to_attr_is_read_only() {
        let file = to_attr(5, &FileInfo::file("f", 4097, SystemTime::UNIX_EPOCH), 1, 1);
        assert_eq!(file.perm & 0o222, 0);
        assert_eq!(file.blocks, 2);

        let dir = to_attr(6, &FileInfo::dir("d"), 1, 1);
        assert_eq!(dir.perm & 0o222, 0);
        assert_eq!(dir.kind, FileType::Directory);
    }

    #[test]
    fn test_list_dir_indexes_entries() {
        let (_dir, mut fs) = kodo_fuse(&[("a/x.txt", 100), ("a/y/z.txt", 5)]);

        let root = fs.list_dir(ROOT_INO, "").unwrap();
        assert_eq!(root.len(), 1);
        let (a_ino, a_kind, a_name) = root[0].clone();
        assert_eq!((a_kind, a_name.as_str()), (FileType::Directory, "a"));

        let entries = fs.list_dir(a_ino, "a").unwrap();
        let names: Vec<&str> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec!["x.txt", "y"]);
        assert_eq!(fs.get_children(a_ino).len(), 2);

        fs.index(a_ino, "a/gone.txt", &FileInfo::file("gone.txt", 1, SystemTime::UNIX_EPOCH));
        assert_eq!(fs.get_children(a_ino).len(), 3);
        fs.list_dir(a_ino, "a").unwrap();
        assert_eq!(fs.get_children(a_ino).len(), 2);
        assert!(!fs.key_to_ino.contains_key("a/gone.txt"));

        assert!(matches!(
            fs.list_dir(ROOT_INO, "a/x.txt"),
            Err(FSError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_read_at() {
        let (_dir, fs) = kodo_fuse(&[("a.txt", 10)]);

        let mut handle = fs.fs.open("/a.txt").unwrap();
        let cases = vec![(0, 4, 4), (8, 4, 2), (10, 4, 0)];

        for (offset, size, expected) in cases {
            let bytes = read_at(&mut handle, offset, size).unwrap();
            assert_eq!(bytes.len(), expected, "failed for case: {}", offset);
        }
    }
}
