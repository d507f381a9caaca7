//! Service endpoint discovery for a bucket.
//!
//! Results are cached per `"<ak>:<bucket>"` with the TTL the query service
//! returns, both in memory and in a JSON file shared across processes.
//! Concurrent lookups for the same key share one in-flight request.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::fs::FSError;

pub const DEFAULT_UC_HOST: &str = "https://uc.qbox.me";
const CACHE_FILE_NAME: &str = "query_v2_00.cache.json";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub io_host: String,
    pub rs_host: String,
    pub rsf_host: String,
    pub api_host: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheValue {
    region: Region,
    deadline: SystemTime,
}

#[derive(Debug, Default, Deserialize)]
struct ServerInfo {
    #[serde(default)]
    main: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryRet {
    #[serde(default)]
    ttl: u64,
    #[serde(default)]
    io: HashMap<String, ServerInfo>,
    #[serde(default)]
    rs: HashMap<String, ServerInfo>,
    #[serde(default)]
    rsf: HashMap<String, ServerInfo>,
    #[serde(default)]
    api: HashMap<String, ServerInfo>,
}

fn one_host(info: &HashMap<String, ServerInfo>) -> Option<String> {
    ["src", "acc"]
        .iter()
        .filter_map(|kind| info.get(*kind))
        .find_map(|s| s.main.first().cloned())
}

impl QueryRet {
    fn into_region(self) -> Result<Region, FSError> {
        let pick = |info: &HashMap<String, ServerInfo>, what: &str| {
            one_host(info).ok_or_else(|| FSError::remote(format!("empty {} host list", what)))
        };

        Ok(Region {
            io_host: pick(&self.io, "io")?,
            rs_host: pick(&self.rs, "rs")?,
            rsf_host: pick(&self.rsf, "rsf")?,
            api_host: pick(&self.api, "api")?,
        })
    }
}

type Inflight = Shared<BoxFuture<'static, Result<Region, Arc<FSError>>>>;

pub struct RegionResolver {
    uc_host: String,
    client: reqwest::Client,
    cache_path: Option<PathBuf>,
    cache: Mutex<HashMap<String, CacheValue>>,
    inflight: Mutex<HashMap<String, Inflight>>,
}

impl RegionResolver {
    pub fn new(uc_host: &str, cache_path: Option<PathBuf>) -> Self {
        let cache = cache_path
            .as_ref()
            .and_then(|path| std::fs::read(path).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();

        Self {
            uc_host: uc_host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache_path,
            cache: Mutex::new(cache),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_cache_path() -> PathBuf {
        std::env::temp_dir().join("kodofs").join(CACHE_FILE_NAME)
    }

    /// Seeds the cache, e.g. for a fixed private deployment.
    pub fn insert(&self, ak: &str, bucket: &str, region: Region, ttl: Duration) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            cache_key(ak, bucket),
            CacheValue {
                region,
                deadline: SystemTime::now() + ttl,
            },
        );
    }

    pub fn cached(&self, ak: &str, bucket: &str) -> Option<Region> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&cache_key(ak, bucket))
            .filter(|v| SystemTime::now() < v.deadline)
            .map(|v| v.region.clone())
    }

    pub async fn resolve(self: &Arc<Self>, ak: &str, bucket: &str) -> Result<Region, FSError> {
        if let Some(region) = self.cached(ak, bucket) {
            return Ok(region);
        }

        let key = cache_key(ak, bucket);
        let fut = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get(&key) {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let (ak, bucket, k) = (ak.to_string(), bucket.to_string(), key.clone());
                    let fut = async move {
                        let result = this.query(&ak, &bucket).await.map_err(Arc::new);
                        this.inflight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&k);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        fut.await
            .map_err(|err| FSError::remote(format!("query region error, {}", err)))
    }

    async fn query(&self, ak: &str, bucket: &str) -> Result<Region, FSError> {
        let url = format!("{}/v2/query", self.uc_host);
        debug!(ak = ak, bucket = bucket, "query region");

        let resp = self
            .client
            .get(&url)
            .query(&[("ak", ak), ("bucket", bucket)])
            .send()
            .await
            .map_err(|err| FSError::remote(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(FSError::remote(format!("uc query status {}", resp.status())));
        }
        let ret: QueryRet = resp
            .json()
            .await
            .map_err(|err| FSError::remote(err.to_string()))?;

        let ttl = Duration::from_secs(ret.ttl);
        let region = ret.into_region()?;
        self.insert(ak, bucket, region.clone(), ttl);
        self.store();
        Ok(region)
    }

    fn store(&self) {
        let path = match &self.cache_path {
            None => return,
            Some(path) => path,
        };
        let bytes = {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            match serde_json::to_vec(&*cache) {
                Err(err) => {
                    warn!(error_message=%err, error_group="region_cache");
                    return;
                }
                Ok(bytes) => bytes,
            }
        };

        let written = path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|()| std::fs::write(path, bytes));
        if let Err(err) = written {
            warn!(error_message=%err, error_group="region_cache", path=%path.display());
        }
    }
}

fn cache_key(ak: &str, bucket: &str) -> String {
    format!("{}:{}", ak, bucket)
}
