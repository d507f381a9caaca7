use std::time::{Duration, SystemTime};

use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    operation::list_objects_v2::ListObjectsV2Output,
    primitives::DateTime,
};
use tokio::runtime::Handle;

use crate::{
    adapters,
    model::{self, fs::FSError},
    util::{self, auth},
};

/// S3-compatible endpoint of a Kodo region.
pub fn default_endpoint(region: &str) -> String {
    format!("https://s3.{}.qiniucs.com", region)
}

/// Kodo through its S3-compatible API, bound to one bucket.
pub struct S3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
    handle: Handle,
}

impl S3Client {
    pub fn new(
        credentials: &auth::Credentials,
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        handle: Handle,
    ) -> Self {
        let secret_key = String::from_utf8_lossy(credentials.secret_key()).into_owned();
        let provider = Credentials::new(
            credentials.access_key.clone(),
            secret_key,
            None,
            None,
            "kodofs",
        );
        let endpoint = endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| default_endpoint(region));

        let sdk_config = util::poll::poll_until_ready(
            &handle,
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.to_string()))
                .credentials_provider(provider)
                .endpoint_url(endpoint)
                .load(),
        );
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.to_string(),
            handle,
        }
    }
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    // Kodo keeps second precision for S3 listings; truncate so listings
    // and stats agree.
    match dt {
        None => SystemTime::UNIX_EPOCH,
        Some(dt) => SystemTime::UNIX_EPOCH + Duration::from_secs(dt.secs().max(0) as u64),
    }
}

fn into_page(lo: &ListObjectsV2Output) -> model::fs::ListPage {
    let mut objects: Vec<model::fs::FSObject> = lo
        .contents()
        .iter()
        .map(|o| {
            model::fs::FSObject::file(
                o.key().unwrap_or(""),
                o.size().unwrap_or(0).max(0) as u64,
                to_system_time(o.last_modified()),
            )
        })
        .chain(
            lo.common_prefixes()
                .iter()
                .filter_map(|p| p.prefix())
                .map(model::fs::FSObject::dir),
        )
        .collect();
    objects.sort_by(|a, b| a.key.cmp(&b.key));

    let next_page_token = lo.next_continuation_token().unwrap_or("").to_string();
    model::fs::ListPage {
        is_last_page: next_page_token.is_empty(),
        objects,
        next_page_token,
    }
}

impl adapters::ObjectAdapter for S3Client {
    fn fs_list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        page_size: usize,
        page_token: &str,
    ) -> Result<model::fs::ListPage, FSError> {
        let mut req = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(page_size.min(i32::MAX as usize) as i32);

        if !delimiter.is_empty() {
            req = req.delimiter(delimiter);
        }
        if !page_token.is_empty() {
            req = req.continuation_token(page_token);
        }

        let lo = util::poll::poll_until_ready(&self.handle, req.send()).map_err(|err| {
            FSError::remote(format!("failed to list_objects at: {}, {}", prefix, err))
        })?;

        Ok(into_page(&lo))
    }

    fn fs_head_object(&self, key: &str) -> Result<Option<model::fs::FSObject>, FSError> {
        let req = self.client.head_object().bucket(&self.bucket).key(key);

        let ho = match util::poll::poll_until_ready(&self.handle, req.send()) {
            Err(err) => {
                if let Some(svc_err) = err.as_service_error() {
                    if svc_err.is_not_found() {
                        return Ok(None);
                    }
                }

                return Err(FSError::remote(format!(
                    "failed to head_object: {}, {}",
                    key, err
                )));
            }
            Ok(ho) => ho,
        };

        Ok(Some(model::fs::FSObject::file(
            key,
            ho.content_length().unwrap_or(0).max(0) as u64,
            to_system_time(ho.last_modified()),
        )))
    }

    fn fs_download_object(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Option<Vec<u8>>, FSError> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);

        if let Some((start, end)) = range {
            req = req.range(format!("bytes={}-{}", start, end));
        }

        let o = match util::poll::poll_until_ready(&self.handle, req.send()) {
            Err(err) => {
                if let Some(svc_err) = err.as_service_error() {
                    if svc_err.is_no_such_key() {
                        return Ok(None);
                    }
                }
                if err.raw_response().map(|r| r.status().as_u16()) == Some(416) {
                    return Ok(Some(Vec::new()));
                }

                return Err(FSError::remote(format!(
                    "failed to get_object: {}, {}",
                    key, err
                )));
            }
            Ok(o) => o,
        };

        let bytes = util::poll::poll_until_ready(&self.handle, o.body.collect()).map_err(|err| {
            FSError::remote(format!("failed to collect body: {}, {}", key, err))
        })?;

        Ok(Some(bytes.into_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::types::{CommonPrefix, Object};

    #[test]
    fn test_to_system_time() {
        let cases = vec![
            (None, SystemTime::UNIX_EPOCH),
            (
                Some(DateTime::from_secs_and_nanos(1_700_000_000, 999)),
                SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            ),
            (Some(DateTime::from_secs(-5)), SystemTime::UNIX_EPOCH),
        ];

        for (input, expected) in cases {
            assert_eq!(to_system_time(input.as_ref()), expected, "failed for case: {:?}", input);
        }
    }

    #[test]
    fn test_into_page() {
        let lo = ListObjectsV2Output::builder()
            .contents(Object::builder().key("a/x.txt").size(100).build())
            .contents(Object::builder().key("a/b.txt").size(1).build())
            .common_prefixes(CommonPrefix::builder().prefix("a/y/").build())
            .next_continuation_token("token")
            .build();

        let page = into_page(&lo);
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/b.txt", "a/x.txt", "a/y/"]);
        assert!(page.objects[2].is_dir);
        assert_eq!(page.objects[1].size, 100);
        assert_eq!(page.next_page_token, "token");
        assert!(!page.is_last_page);

        let last = into_page(&ListObjectsV2Output::builder().build());
        assert!(last.is_last_page);
        assert!(last.objects.is_empty());
    }

    #[test]
    fn test_default_endpoint() {
        assert_eq!(default_endpoint("cn-east-1"), "https://s3.cn-east-1.qiniucs.com");
    }
}
