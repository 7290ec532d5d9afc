/// Readonly Chain Client
///
/// Request-response client handed to user handlers through the context.
/// Responses are cached in two tiers in front of the transport:
/// memory LRU -> durable RocksDB -> RPC transport.
///
/// Cache keys hash (chain, block, method, params), which is what makes
/// historical replay deterministic: the same request at the same block
/// always resolves to the byte-identical cached response, never a live
/// call that might answer differently.
///
/// Concurrent requests for the same key share one fine-grained async lock,
/// so a cold key costs exactly one transport call no matter how many
/// handlers want it at once.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::errors::{EngineError, EngineResult};
use crate::metrics;

const RPC_CACHE_CF: &str = "rpc_cache";

/// The raw transport the engine consumes; drivers live outside the engine.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn request(&self, chain_id: u64, method: &str, params: &Value) -> EngineResult<Value>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub memory_capacity: usize,
    pub request_timeout: Duration,
    /// Directory for the durable KV tier; None runs memory-only.
    pub durable_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            request_timeout: Duration::from_secs(10),
            durable_path: None,
        }
    }
}

pub struct ReadonlyClient {
    transport: Arc<dyn RpcTransport>,
    memory: RwLock<LruCache<String, Value>>,
    durable: Option<Arc<DB>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    request_timeout: Duration,
}

impl ReadonlyClient {
    pub fn new(transport: Arc<dyn RpcTransport>, config: ClientConfig) -> EngineResult<Self> {
        let capacity = NonZeroUsize::new(config.memory_capacity.max(1))
            .ok_or_else(|| EngineError::engine("client cache capacity must be non-zero"))?;

        let durable = match &config.durable_path {
            Some(path) => {
                let mut opts = Options::default();
                opts.create_if_missing(true);
                opts.create_missing_column_families(true);
                let descriptors = vec![
                    ColumnFamilyDescriptor::new("default", Options::default()),
                    ColumnFamilyDescriptor::new(RPC_CACHE_CF, Options::default()),
                ];
                let db = DB::open_cf_descriptors(&opts, path, descriptors)
                    .map_err(|e| EngineError::engine(format!("failed to open cache db: {}", e)))?;
                Some(Arc::new(db))
            }
            None => None,
        };

        Ok(Self {
            transport,
            memory: RwLock::new(LruCache::new(capacity)),
            durable,
            key_locks: Mutex::new(HashMap::new()),
            request_timeout: config.request_timeout,
        })
    }

    /// Deterministic cache key for one request at one block position.
    fn cache_key(chain_id: u64, block_number: u64, method: &str, params: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chain_id.to_be_bytes());
        hasher.update(block_number.to_be_bytes());
        hasher.update(method.as_bytes());
        hasher.update(params.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn request(
        &self,
        chain_id: u64,
        block_number: u64,
        method: &str,
        params: &Value,
    ) -> EngineResult<Value> {
        let key = Self::cache_key(chain_id, block_number, method, params);

        if let Some(hit) = self.memory_get(&key).await {
            metrics::CLIENT_REQUESTS.with_label_values(&["memory"]).inc();
            return Ok(hit);
        }

        // One in-flight fill per key; everyone else waits for the cache.
        let key_lock = {
            let mut locks = self.key_locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = key_lock.lock().await;

        // Another waiter may have filled the cache while we queued.
        if let Some(hit) = self.memory_get(&key).await {
            metrics::CLIENT_REQUESTS.with_label_values(&["memory"]).inc();
            self.release_key_lock(&key).await;
            return Ok(hit);
        }

        if let Some(hit) = self.durable_get(&key).await? {
            metrics::CLIENT_REQUESTS.with_label_values(&["durable"]).inc();
            self.memory_put(&key, hit.clone()).await;
            self.release_key_lock(&key).await;
            return Ok(hit);
        }

        let result = tokio::time::timeout(
            self.request_timeout,
            self.transport.request(chain_id, method, params),
        )
        .await;

        let response = match result {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.release_key_lock(&key).await;
                return Err(err);
            }
            Err(_) => {
                self.release_key_lock(&key).await;
                return Err(EngineError::retryable(format!(
                    "rpc request '{}' on chain {} timed out after {:?}",
                    method, chain_id, self.request_timeout
                )));
            }
        };

        metrics::CLIENT_REQUESTS
            .with_label_values(&["transport"])
            .inc();
        debug!(chain = chain_id, method, "rpc response cached");

        self.durable_put(&key, &response).await?;
        self.memory_put(&key, response.clone()).await;
        self.release_key_lock(&key).await;
        Ok(response)
    }

    async fn memory_get(&self, key: &str) -> Option<Value> {
        let mut cache = self.memory.write().await;
        cache.get(key).cloned()
    }

    async fn memory_put(&self, key: &str, value: Value) {
        let mut cache = self.memory.write().await;
        cache.put(key.to_string(), value);
    }

    async fn durable_get(&self, key: &str) -> EngineResult<Option<Value>> {
        let Some(db) = &self.durable else {
            return Ok(None);
        };
        let db = Arc::clone(db);
        let lookup = key.to_string();
        let bytes = tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(RPC_CACHE_CF)
                .ok_or_else(|| EngineError::engine("rpc_cache column family missing"))?;
            db.get_cf(&cf, lookup.as_bytes())
                .map_err(|e| EngineError::engine(format!("cache read failed: {}", e)))
        })
        .await
        .map_err(|e| EngineError::engine(format!("cache read task failed: {}", e)))??;

        match bytes {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::engine(format!(
                        "corrupted cache entry for {}: {}",
                        key_preview(key),
                        e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn durable_put(&self, key: &str, value: &Value) -> EngineResult<()> {
        let Some(db) = &self.durable else {
            return Ok(());
        };
        let db = Arc::clone(db);
        let key = key.to_string();
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EngineError::engine(format!("cache encode failed: {}", e)))?;
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(RPC_CACHE_CF)
                .ok_or_else(|| EngineError::engine("rpc_cache column family missing"))?;
            db.put_cf(&cf, key.as_bytes(), bytes)
                .map_err(|e| EngineError::engine(format!("cache write failed: {}", e)))
        })
        .await
        .map_err(|e| EngineError::engine(format!("cache write task failed: {}", e)))??;
        Ok(())
    }

    async fn release_key_lock(&self, key: &str) {
        let mut locks = self.key_locks.lock().await;
        if let Some(lock) = locks.get(key) {
            // Last holder cleans up the entry
            if Arc::strong_count(lock) <= 2 {
                locks.remove(key);
            }
        }
    }
}

fn key_preview(key: &str) -> &str {
    &key[..key.len().min(16)]
}
