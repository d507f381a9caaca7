//! Paginated listing over a flat key space.
//!
//! A [`ListIterator`] walks the pages returned by an [`ObjectAdapter`] one
//! object at a time, loading the next page only when the current one is
//! exhausted. [`readdir`] and [`walk`] are built on top of it.

use std::ops::ControlFlow;

use tracing::debug;

use crate::{
    adapters::ObjectAdapter,
    model::fs::{FSError, FSObject, FileInfo, ListPage},
};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub fn normalize_page_size(page_size: i64) -> usize {
    if page_size <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size as usize
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix are returned.
    pub prefix: String,
    /// An empty delimiter lists the bucket as one flat namespace. Otherwise
    /// every key with the delimiter after `prefix` collapses into a single
    /// directory entry whose key ends with the delimiter.
    pub delimiter: String,
    /// Zero or negative selects [`DEFAULT_PAGE_SIZE`].
    pub page_size: i64,
}

/// Forward-only cursor over listing results, in ascending order of the raw
/// key. Once advanced it cannot be restarted; call [`list`] again instead.
pub struct ListIterator<'a> {
    adapter: &'a dyn ObjectAdapter,
    prefix: String,
    delimiter: String,
    page_size: usize,
    page: Option<ListPage>,
    next_idx: usize,
    last_dir: Option<String>,
}

pub fn list<'a>(adapter: &'a dyn ObjectAdapter, opts: &ListOptions) -> ListIterator<'a> {
    ListIterator {
        adapter,
        prefix: opts.prefix.clone(),
        delimiter: opts.delimiter.clone(),
        page_size: normalize_page_size(opts.page_size),
        page: None,
        next_idx: 0,
        last_dir: None,
    }
}

impl<'a> ListIterator<'a> {
    /// Returns the next object, `Ok(None)` at the end of the sequence. A
    /// failed page fetch leaves the cursor where it was.
    pub fn next_object(&mut self) -> Result<Option<FSObject>, FSError> {
        loop {
            if let Some(page) = &self.page {
                if self.next_idx < page.objects.len() {
                    let obj = page.objects[self.next_idx].clone();
                    self.next_idx += 1;

                    if obj.is_dir {
                        if self.last_dir.as_deref() == Some(obj.key.as_str()) {
                            continue;
                        }
                        self.last_dir = Some(obj.key.clone());
                    }
                    return Ok(Some(obj));
                }
                if page.is_last_page {
                    return Ok(None);
                }
            }

            let token = self
                .page
                .as_ref()
                .map(|p| p.next_page_token.clone())
                .unwrap_or_default();

            let page = self.adapter.fs_list_page(
                &self.prefix,
                &self.delimiter,
                self.page_size,
                &token,
            )?;
            debug!(
                prefix = %self.prefix,
                delimiter = %self.delimiter,
                items = page.objects.len(),
                is_last_page = page.is_last_page,
                "list page"
            );

            self.page = Some(page);
            self.next_idx = 0;
        }
    }
}

impl<'a> Iterator for ListIterator<'a> {
    type Item = Result<FSObject, FSError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_object().transpose()
    }
}

/// Turns a filesystem directory name into a listing prefix: the root maps to
/// the empty prefix, anything else loses its leading slash and gains a
/// trailing one.
pub fn dir_prefix(dir: &str) -> String {
    let dir = dir.trim_start_matches('/');
    if dir.is_empty() || dir == "." {
        return String::new();
    }
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Lists the immediate children of `dir`.
pub fn readdir(adapter: &dyn ObjectAdapter, dir: &str) -> Result<Vec<FileInfo>, FSError> {
    let prefix = dir_prefix(dir);
    let opts = ListOptions {
        prefix: prefix.clone(),
        delimiter: "/".to_string(),
        page_size: DEFAULT_PAGE_SIZE as i64,
    };

    let mut fis = Vec::with_capacity(64);
    for obj in list(adapter, &opts) {
        let obj = obj?;
        let name = match obj.key.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.trim_end_matches('/'),
            None => continue,
        };
        if name.is_empty() {
            continue;
        }
        if obj.is_dir {
            fis.push(FileInfo::dir(name));
        } else {
            fis.push(FileInfo::file(name, obj.size, obj.modified_time));
        }
    }

    Ok(fis)
}

/// Visits every key under `dir` individually, in lexicographic order. The
/// visitor receives the full path (with a leading slash) and an info named
/// by the key's last segment.
pub fn walk<F>(adapter: &dyn ObjectAdapter, dir: &str, mut visit: F) -> Result<(), FSError>
where
    F: FnMut(&str, &FileInfo) -> ControlFlow<()>,
{
    let prefix = dir_prefix(dir);
    let opts = ListOptions {
        prefix: prefix.clone(),
        delimiter: String::new(),
        page_size: DEFAULT_PAGE_SIZE as i64,
    };

    for obj in list(adapter, &opts) {
        let obj = obj?;
        if !obj.key.starts_with(prefix.as_str()) {
            continue;
        }
        let name = obj.key.rsplit('/').next().unwrap_or(obj.key.as_str());
        let info = FileInfo::file(name, obj.size, obj.modified_time);
        if visit(&format!("/{}", obj.key), &info).is_break() {
            break;
        }
    }

    Ok(())
}
