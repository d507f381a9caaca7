use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tokio::runtime::Handle;
use tracing::info;

use crate::{
    adapters::{
        kodo::{self, KodoClient, KodoConfig},
        s3::S3Client,
        ObjectAdapter,
    },
    bucket::Bucket,
    model::fs::FSError,
    util::{
        auth::Credentials,
        object::{self, Backend},
        region::RegionResolver,
    },
};

/// Lifetime of signed download URLs for private buckets.
const PRIVATE_URL_TTL: Duration = Duration::from_secs(3600);

/// Bucket name to download host. Populated before any mount of that bucket
/// is opened.
#[derive(Debug, Default)]
pub struct Registry {
    hosts: RwLock<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, K, V>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        for (bucket, host) in pairs {
            hosts.insert(bucket.into(), host.into());
        }
    }

    pub fn lookup(&self, bucket: &str) -> Option<String> {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        hosts.get(bucket).cloned()
    }

    pub fn clear(&self) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Parses a `BUCKET=HOST` pair.
pub fn parse_host_pair(arg: &str) -> Result<(String, String), FSError> {
    match arg.split_once('=') {
        Some((bucket, host)) if !bucket.is_empty() && !host.is_empty() => {
            Ok((bucket.to_string(), host.to_string()))
        }
        _ => Err(FSError::Permission(format!(
            "expected BUCKET=HOST, got: {}",
            arg
        ))),
    }
}

#[derive(Clone, Debug)]
pub struct MountOptions {
    pub backend: Backend,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    /// Sign download URLs.
    pub private: bool,
    pub kodo: KodoConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Kodo,
            s3_region: None,
            s3_endpoint: None,
            private: false,
            kodo: KodoConfig::default(),
        }
    }
}

pub struct Mounter {
    registry: Arc<Registry>,
    resolver: Arc<RegionResolver>,
    handle: Handle,
    protected_key: String,
}

impl Mounter {
    pub fn new(
        registry: Arc<Registry>,
        resolver: Arc<RegionResolver>,
        handle: Handle,
        protected_key: &str,
    ) -> Self {
        Self {
            registry,
            resolver,
            handle,
            protected_key: protected_key.to_string(),
        }
    }

    /// Opens the bucket named by a `kodo:<bucket>?<token>` URL.
    pub fn open(&self, url: &str, opts: &MountOptions) -> Result<Bucket, FSError> {
        let parsed = object::parse_mount_url(url, &self.protected_key)?;
        let host = self.registry.lookup(&parsed.bucket).ok_or_else(|| {
            FSError::NotFound(format!(
                "host of bucket `{}` not registered",
                parsed.bucket
            ))
        })?;

        let credentials = Credentials::new(&parsed.access_key, &parsed.secret_key);
        let adapter: Arc<dyn ObjectAdapter> = match opts.backend {
            Backend::Kodo => {
                let prepare = opts
                    .private
                    .then(|| kodo::private_prepare(credentials.clone(), PRIVATE_URL_TTL));
                Arc::new(KodoClient::new(
                    credentials,
                    &parsed.bucket,
                    &host,
                    prepare,
                    self.resolver.clone(),
                    self.handle.clone(),
                    opts.kodo.clone(),
                ))
            }
            Backend::S3 => {
                let region = opts.s3_region.as_deref().ok_or_else(|| {
                    FSError::Permission("s3 backend requires a region".to_string())
                })?;
                Arc::new(S3Client::new(
                    &credentials,
                    &parsed.bucket,
                    region,
                    opts.s3_endpoint.as_deref(),
                    self.handle.clone(),
                ))
            }
        };

        info!(bucket=%parsed.bucket, host=%host, kodo=opts.backend.is_kodo(), "mount opened");
        Ok(Bucket::new(adapter, &parsed.bucket))
    }
}
