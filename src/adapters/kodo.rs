use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;

use crate::{
    adapters,
    model::{self, fs::FSError},
    util::{
        auth::Credentials,
        poll,
        region::{Region, RegionResolver},
    },
};

/// Kodo answers 612 when an entry does not exist.
const STATUS_NO_SUCH_ENTRY: u16 = 612;

/// Rewrites a download URL before it is fetched.
pub type PrepareOpen = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub fn simple_prepare() -> PrepareOpen {
    Arc::new(|url: &str| url.to_string())
}

/// Signs download URLs of a private bucket, valid for `ttl`.
pub fn private_prepare(credentials: Credentials, ttl: Duration) -> PrepareOpen {
    Arc::new(move |url: &str| credentials.sign_download_url(url, ttl))
}

#[derive(Clone, Debug)]
pub struct KodoConfig {
    pub use_https: bool,
}

impl Default for KodoConfig {
    fn default() -> Self {
        Self { use_https: true }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListItem {
    key: String,
    #[serde(default)]
    fsize: i64,
    #[serde(default, rename = "putTime")]
    put_time: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ListRet {
    #[serde(default)]
    marker: String,
    #[serde(default, rename = "commonPrefixes")]
    common_prefixes: Vec<String>,
    #[serde(default)]
    items: Vec<ListItem>,
}

impl ListRet {
    fn into_page(self) -> model::fs::ListPage {
        let mut objects: Vec<model::fs::FSObject> = self
            .items
            .into_iter()
            .map(|item| {
                model::fs::FSObject::file(
                    &item.key,
                    item.fsize.max(0) as u64,
                    model::fs::from_put_time(item.put_time),
                )
            })
            .chain(
                self.common_prefixes
                    .iter()
                    .map(|prefix| model::fs::FSObject::dir(prefix)),
            )
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        model::fs::ListPage {
            is_last_page: self.marker.is_empty(),
            objects,
            next_page_token: self.marker,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatRet {
    #[serde(default)]
    fsize: i64,
    #[serde(default, rename = "putTime")]
    put_time: i64,
}

/// Kodo native API client bound to one bucket.
pub struct KodoClient {
    credentials: Credentials,
    bucket: String,
    host: String,
    prepare: PrepareOpen,
    resolver: Arc<RegionResolver>,
    client: reqwest::Client,
    handle: Handle,
    config: KodoConfig,
}

impl KodoClient {
    pub fn new(
        credentials: Credentials,
        bucket: &str,
        host: &str,
        prepare: Option<PrepareOpen>,
        resolver: Arc<RegionResolver>,
        handle: Handle,
        config: KodoConfig,
    ) -> Self {
        Self {
            credentials,
            bucket: bucket.to_string(),
            host: host.trim_end_matches('/').to_string(),
            prepare: prepare.unwrap_or_else(simple_prepare),
            resolver,
            client: reqwest::Client::new(),
            handle,
            config,
        }
    }

    async fn region(&self) -> Result<Region, FSError> {
        self.resolver
            .resolve(&self.credentials.access_key, &self.bucket)
            .await
    }

    fn url(&self, host: &str, path: &str) -> Result<Url, FSError> {
        Url::parse(&format!("{}{}", endpoint(self.config.use_https, host), path))
            .map_err(|err| FSError::remote(format!("invalid url for host {}: {}", host, err)))
    }

    pub fn download_url(&self, key: &str) -> Result<String, FSError> {
        let mut url = self.url(&self.host, "/")?;
        match url.path_segments_mut() {
            Err(()) => return Err(FSError::remote(format!("invalid download host: {}", self.host))),
            Ok(mut segments) => {
                segments.pop_if_empty().extend(key.split('/'));
            }
        }
        Ok((self.prepare)(url.as_str()))
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        page_size: usize,
        page_token: &str,
    ) -> Result<model::fs::ListPage, FSError> {
        let region = self.region().await?;
        let mut url = self.url(&region.rsf_host, "/list")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("bucket", &self.bucket)
                .append_pair("prefix", prefix)
                .append_pair("delimiter", delimiter)
                .append_pair("limit", &page_size.to_string());
            if !page_token.is_empty() {
                query.append_pair("marker", page_token);
            }
        }

        let resp = self
            .client
            .post(url.clone())
            .header(header::AUTHORIZATION, self.credentials.authorization(&url))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .send()
            .await
            .map_err(|err| {
                FSError::remote(format!("failed to list_objects at: {}, {}", prefix, err))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FSError::remote(format!(
                "failed to list_objects at: {}, status {}: {}",
                prefix, status, body
            )));
        }

        let ret: ListRet = resp.json().await.map_err(|err| {
            FSError::remote(format!("failed to decode list at: {}, {}", prefix, err))
        })?;
        debug!(
            prefix = prefix,
            items = ret.items.len(),
            common_prefixes = ret.common_prefixes.len(),
            has_next = !ret.marker.is_empty(),
            "kodo list"
        );

        Ok(ret.into_page())
    }

    async fn head_object(&self, key: &str) -> Result<Option<model::fs::FSObject>, FSError> {
        let region = self.region().await?;
        let entry = URL_SAFE.encode(format!("{}:{}", self.bucket, key));
        let url = self.url(&region.rs_host, &format!("/stat/{}", entry))?;

        let resp = self
            .client
            .get(url.clone())
            .header(header::AUTHORIZATION, self.credentials.authorization(&url))
            .send()
            .await
            .map_err(|err| FSError::remote(format!("failed to head_object: {}, {}", key, err)))?;

        let status = resp.status();
        if status.as_u16() == STATUS_NO_SUCH_ENTRY || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FSError::remote(format!(
                "failed to head_object: {}, status {}",
                key, status
            )));
        }

        let ret: StatRet = resp
            .json()
            .await
            .map_err(|err| FSError::remote(format!("failed to decode stat: {}, {}", key, err)))?;

        Ok(Some(model::fs::FSObject::file(
            key,
            ret.fsize.max(0) as u64,
            model::fs::from_put_time(ret.put_time),
        )))
    }

    async fn download_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Vec<u8>>, FSError> {
        let url = self.download_url(key)?;
        let mut req = self.client.get(&url);
        if let Some((start, end)) = range {
            req = req.header(header::RANGE, format!("bytes={}-{}", start, end));
        }

        let resp = req.send().await.map_err(|err| {
            FSError::remote(format!("failed to get_object: {}, {}", key, err))
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status.as_u16() == STATUS_NO_SUCH_ENTRY {
            return Ok(None);
        }
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Some(Vec::new()));
        }
        if !status.is_success() {
            return Err(FSError::remote(format!(
                "failed to get_object: {}, status {}",
                key, status
            )));
        }

        let bytes = resp.bytes().await.map_err(|err| {
            FSError::remote(format!("failed to collect body: {}, {}", key, err))
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

impl adapters::ObjectAdapter for KodoClient {
    fn fs_list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        page_size: usize,
        page_token: &str,
    ) -> Result<model::fs::ListPage, FSError> {
        poll::poll_until_ready(
            &self.handle,
            self.list_page(prefix, delimiter, page_size, page_token),
        )
    }

    fn fs_head_object(&self, key: &str) -> Result<Option<model::fs::FSObject>, FSError> {
        poll::poll_until_ready(&self.handle, self.head_object(key))
    }

    fn fs_download_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Vec<u8>>, FSError> {
        poll::poll_until_ready(&self.handle, self.download_object(key, range))
    }
}

pub fn endpoint(use_https: bool, host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.trim_end_matches('/').to_string();
    }
    let scheme = if use_https { "https" } else { "http" };
    format!("{}://{}", scheme, host.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(host: &str, prepare: Option<PrepareOpen>) -> (tokio::runtime::Runtime, KodoClient) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let client = KodoClient::new(
            Credentials::new("ak", "sk"),
            "bucket",
            host,
            prepare,
            Arc::new(RegionResolver::new("http://127.0.0.1:1", None)),
            rt.handle().clone(),
            KodoConfig::default(),
        );
        (rt, client)
    }

    #[test]
    fn test_endpoint() {
        let cases = vec![
            (true, "rsf.qiniu.com", "https://rsf.qiniu.com"),
            (false, "rsf.qiniu.com", "http://rsf.qiniu.com"),
            (true, "http://cdn.example.com/", "http://cdn.example.com"),
        ];

        for (use_https, host, expected) in cases {
            assert_eq!(endpoint(use_https, host), expected, "failed for case: {}", host);
        }
    }

    #[test]
    fn test_list_ret_into_page() {
        let body = r#"{
            "marker": "eyJjIjowLCJrIjoiYS95LyJ9",
            "commonPrefixes": ["a/y/", "a/b/"],
            "items": [
                {"key": "a/x.txt", "fsize": 100, "putTime": 16000000000000000},
                {"key": "a/c.txt", "fsize": 5, "putTime": 0}
            ]
        }"#;
        let ret: ListRet = serde_json::from_str(body).unwrap();
        let page = ret.into_page();

        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/b/", "a/c.txt", "a/x.txt", "a/y/"]);
        assert!(page.objects[0].is_dir);
        assert_eq!(page.objects[2].size, 100);
        assert!(!page.is_last_page);

        let last: ListRet = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert!(last.into_page().is_last_page);
    }

    #[test]
    fn test_download_url() {
        let cases = vec![
            ("http://cdn.example.com", "a/b c.txt", "http://cdn.example.com/a/b%20c.txt"),
            ("cdn.example.com/", "x#y", "https://cdn.example.com/x%23y"),
        ];

        for (host, key, expected) in cases {
            let (_rt, client) = client(host, None);
            assert_eq!(client.download_url(key).unwrap(), expected, "failed for case: {}", key);
        }

        let (_rt, private) = client(
            "http://cdn.example.com",
            Some(private_prepare(Credentials::new("ak", "sk"), Duration::from_secs(60))),
        );
        let url = private.download_url("a.txt").unwrap();
        assert!(url.starts_with("http://cdn.example.com/a.txt?e="));
        assert!(url.contains("&token=ak:"));
    }

    #[test]
    fn test_list_without_region_fails() {
        let (_rt, client) = client("http://cdn.example.com", None);
        let result = adapters::ObjectAdapter::fs_list_page(&client, "", "/", 10, "");
        assert!(matches!(result, Err(FSError::Remote { .. })));
    }
}
