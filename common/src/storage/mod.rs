pub mod local;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::Result;
use crate::config::{S3Settings, StorageKind, StorageSettings};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{Credentials, Region};
use datafusion::execution::context::SessionContext;
use object_store::aws::AmazonS3Builder;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Key/value access to a bucket or directory. Keys are relative to the
/// storage root and always use `/` as separator.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    /// Lists keys under `prefix` in lexicographic order.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
    async fn check_file_exists(&self, key: &str) -> Result<bool>;
    async fn delete_object(&self, key: &str) -> Result<()>;
    fn bucket(&self) -> &str;
    /// URL the query engine can list `prefix` under.
    fn table_url(&self, prefix: &str) -> Result<String>;

    /// Deletes every key under the directory `prefix`. Sibling keys that only
    /// share the leading characters (`time` vs `timeline`) are kept.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_objects(&dir_prefix(prefix)).await?;
        for key in &keys {
            self.delete_object(key).await?;
        }
        Ok(keys.len())
    }

    /// Makes `table_url` resolvable inside `ctx`.
    async fn register_with(&self, _ctx: &SessionContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct S3Manager {
    pub config: S3Settings,
    client_cache: Arc<dashmap::DashMap<String, Arc<S3Client>>>,
    object_store_cache: Arc<dashmap::DashMap<String, Arc<object_store::aws::AmazonS3>>>,
}

impl S3Manager {
    pub fn new(config: S3Settings) -> Self {
        Self {
            config,
            client_cache: Arc::new(dashmap::DashMap::new()),
            object_store_cache: Arc::new(dashmap::DashMap::new()),
        }
    }

    fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.config.access_key, &self.config.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub async fn get_client(&self, bucket: &str) -> Result<Arc<S3Client>> {
        if let Some(client) = self.client_cache.get(bucket) {
            return Ok(client.clone());
        }

        let mut builder = match self.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "static");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
            }
            None => {
                debug!(bucket, "No static S3 keys configured, using default credential chain");
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder.region(Region::new(self.config.region.clone()));
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Arc::new(S3Client::from_conf(builder.build()));
        self.client_cache.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    pub async fn get_object_store(&self, bucket: &str) -> Result<Arc<object_store::aws::AmazonS3>> {
        if let Some(store) = self.object_store_cache.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&self.config.region)
            .with_allow_http(self.config.allow_http);

        if let Some((access_key, secret_key)) = self.static_credentials() {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        let store = Arc::new(builder.build()?);
        self.object_store_cache
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    pub async fn register_object_store(
        &self,
        ctx: &SessionContext,
        bucket: &str,
    ) -> Result<()> {
        let store = self.get_object_store(bucket).await?;
        let url = Url::parse(&format!("s3://{}", bucket))?;
        ctx.runtime_env().register_object_store(&url, store);
        Ok(())
    }

    /// Verifies that a bucket exists and is accessible
    pub async fn verify_bucket_exists(&self, bucket: &str) -> Result<()> {
        let client = self.get_client(bucket).await?;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => Err(crate::Error::Storage(format!(
                "Cannot access bucket '{}': {}",
                bucket, e
            ))),
        }
    }
}

/// Opens the storage described by `settings`.
pub async fn open_storage(
    settings: &StorageSettings,
    s3_manager: &Arc<S3Manager>,
) -> Result<Arc<dyn ObjectStorage>> {
    let storage: Arc<dyn ObjectStorage> = match settings.kind {
        StorageKind::Local => Arc::new(LocalStorage::new(&settings.location).await?),
        StorageKind::S3 => {
            s3_manager.verify_bucket_exists(&settings.location).await?;
            Arc::new(S3Storage::new(s3_manager.clone(), &settings.location).await?)
        }
    };

    info!(
        kind = ?settings.kind,
        location = %settings.location,
        "Opened storage"
    );
    Ok(storage)
}

/// Joins key segments, ignoring empty ones and stray slashes.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// `prefix` as a directory key: empty stays empty, otherwise one trailing `/`.
pub fn dir_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}
