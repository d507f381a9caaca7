use crate::model;

pub mod kodo;
#[cfg(test)]
pub mod mock;
pub mod s3;

/// Raw object-storage operations a bucket backend provides. Every call
/// blocks the calling thread for network I/O.
pub trait ObjectAdapter: Send + Sync {
    /// Fetches one page of a prefix/delimiter listing starting after
    /// `page_token` (empty for the first page). Objects come back in
    /// ascending order of their raw key, grouped prefixes included.
    fn fs_list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        page_size: usize,
        page_token: &str,
    ) -> Result<model::fs::ListPage, model::fs::FSError>;

    /// Returns `Ok(None)` when no object exists at exactly `key`.
    fn fs_head_object(&self, key: &str) -> Result<Option<model::fs::FSObject>, model::fs::FSError>;

    /// `range` is an inclusive byte range. Returns `Ok(None)` when the
    /// object does not exist.
    fn fs_download_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Vec<u8>>, model::fs::FSError>;
}
