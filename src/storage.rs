//! Key/value storage for plugin state
//!
//! The plugin persists a single record, but it talks to storage through the
//! [`KeyValueStore`] trait so the backend can be swapped: Cloudflare R2 / AWS S3
//! for deployments, a local JSON file for single-host setups, and memory for
//! tests.

use crate::config::{Settings, StorageBackend};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error putting object into S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Interface for key/value storage providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load the JSON value stored under `key`, if any
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError>;
    /// Store `value` under `key`, replacing any previous value
    async fn put_json(&self, key: &str, value: Value) -> Result<(), StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// Load a typed value from any store
///
/// # Errors
///
/// Returns an error if the backend fails or the stored JSON does not match `T`.
pub async fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get_json(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Save a typed value into any store
///
/// # Errors
///
/// Returns an error if serialization or the backend write fails.
pub async fn save<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    data: &T,
) -> Result<(), StorageError> {
    store.put_json(key, serde_json::to_value(data)?).await
}

/// Build the store selected in `settings`
///
/// # Errors
///
/// Returns an error if the selected backend is misconfigured.
pub async fn from_settings(settings: &Settings) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    let store: Arc<dyn KeyValueStore> = match settings.storage_backend {
        StorageBackend::R2 => Arc::new(R2Storage::new(settings).await?),
        StorageBackend::File => Arc::new(FileStorage::new(&settings.quota_file)),
        StorageBackend::Memory => {
            warn!("Using in-memory storage: quota resets on restart.");
            Arc::new(InMemoryStorage::default())
        }
    };
    Ok(store)
}

/// Connection details for an R2 (or any S3-compatible) bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2Config {
    /// S3 API endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket holding the state objects
    pub bucket: String,
}

impl R2Config {
    /// Pull the `r2_*` fields out of `settings`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] naming the first missing variable.
    pub fn from_settings(settings: &Settings) -> Result<Self, StorageError> {
        fn required(value: Option<&String>, name: &str) -> Result<String, StorageError> {
            value
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| StorageError::Config(format!("{name} is missing")))
        }

        Ok(Self {
            endpoint_url: required(settings.r2_endpoint_url.as_ref(), "R2_ENDPOINT_URL")?,
            access_key_id: required(settings.r2_access_key_id.as_ref(), "R2_ACCESS_KEY_ID")?,
            secret_access_key: required(
                settings.r2_secret_access_key.as_ref(),
                "R2_SECRET_ACCESS_KEY",
            )?,
            bucket: required(settings.r2_bucket_name.as_ref(), "R2_BUCKET_NAME")?,
        })
    }
}

/// Bucket-backed store; each key is one JSON object
///
/// Reads go through a short-lived cache that is refreshed on every
/// successful write.
pub struct R2Storage {
    client: Client,
    bucket: String,
    cache: Cache<String, Value>,
}

impl R2Storage {
    /// Create a store from the `r2_*` settings
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        Ok(Self::connect(R2Config::from_settings(settings)?).await)
    }

    /// Create a store for an explicit bucket configuration
    pub async fn connect(config: R2Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "r2-storage",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(config.endpoint_url)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
            cache: Cache::builder()
                .max_capacity(64)
                .time_to_live(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    async fn fetch_object(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                debug!(key, "Object not found in bucket");
                return Ok(None);
            }
            Err(e) => return Err(StorageError::S3Get(Box::new(e))),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
            .into_bytes();
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl KeyValueStore for R2Storage {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(value) = self.cache.get(key).await {
            return Ok(Some(value));
        }

        let value = self.fetch_object(key).await?;
        if let Some(value) = &value {
            self.cache.insert(key.to_string(), value.clone()).await;
        }
        Ok(value)
    }

    async fn put_json(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let body = serde_json::to_vec(&value)?;

        if let Err(e) = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
        {
            // A failed write must not leave a value the bucket never saw
            self.cache.invalidate(key).await;
            return Err(StorageError::S3Put(e.to_string()));
        }

        self.cache.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| info!(bucket = %self.bucket, "Connected to R2 storage."))
            .map_err(|e| {
                let message = format!("R2 bucket {} is not reachable: {e}", self.bucket);
                error!("{}", message);
                message
            })
    }
}

/// Stores every key in one JSON object on the local filesystem
pub struct FileStorage {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStorage {
    /// Create a file store; the file is created on first write
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStorage {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let _guard = self.lock.read().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn put_json(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling file first so a crash never leaves half a record
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), key, "Saved state file");
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        self.read_all()
            .await
            .map(|_| info!("State file {} is readable.", self.path.display()))
            .map_err(|e| format!("State file check failed: {e}"))
    }
}

/// Volatile storage, mostly for tests
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
}

#[async_trait]
impl KeyValueStore for InMemoryStorage {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_json(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}
