use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, RwLock};

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::info;

use datafeed_core::config::{AwsSettings, LandingSettings};

use crate::error::StorageError;

/// Bucket-addressed storage over object_store.
///
/// Local and in-memory backends keep every bucket under one store as a
/// top-level directory; S3 opens one store per bucket on first use.
pub enum StorageBackend {
    Memory(Arc<dyn ObjectStore>),
    Local(LocalBackend),
    S3(S3Backend),
}

impl StorageBackend {
    pub fn memory() -> Self {
        StorageBackend::Memory(Arc::new(InMemory::new()))
    }

    pub fn local(root: &FsPath) -> Result<Self, StorageError> {
        Ok(StorageBackend::Local(LocalBackend::new(root)?))
    }

    /// Select S3, a local directory or memory from settings, in that order.
    pub fn from_settings(settings: &LandingSettings) -> Result<Self, StorageError> {
        if settings.aws.is_configured() {
            Ok(StorageBackend::S3(S3Backend::new(&settings.aws)))
        } else if let Some(dir) = &settings.dir {
            Self::local(dir)
        } else {
            info!("Storage: in-memory backend");
            Ok(Self::memory())
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StorageBackend::Memory(_) => "memory",
            StorageBackend::Local(_) => "local",
            StorageBackend::S3(_) => "s3",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    /// Resolve the store and in-store path holding `key` in `bucket`.
    pub fn locate(&self, bucket: &str, key: &str) -> Result<(Arc<dyn ObjectStore>, Path), StorageError> {
        check_bucket(bucket)?;
        let key_path = parse_key(key)?;
        match self {
            StorageBackend::Memory(store) => Ok((store.clone(), bucket_path(bucket, &key_path))),
            StorageBackend::Local(b) => Ok((b.store.clone(), bucket_path(bucket, &key_path))),
            StorageBackend::S3(b) => Ok((b.store_for(bucket)?, key_path)),
        }
    }

    /// Resolve the store and the path every key in `bucket` lives under.
    pub fn bucket_root(&self, bucket: &str) -> Result<(Arc<dyn ObjectStore>, Option<Path>), StorageError> {
        check_bucket(bucket)?;
        match self {
            StorageBackend::Memory(store) => Ok((store.clone(), Some(Path::from(bucket)))),
            StorageBackend::Local(b) => Ok((b.store.clone(), Some(Path::from(bucket)))),
            StorageBackend::S3(b) => Ok((b.store_for(bucket)?, None)),
        }
    }
}

fn check_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
        return Err(StorageError::InvalidName {
            name: bucket.to_string(),
            reason: "bucket must be a single non-empty path segment".into(),
        });
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<Path, StorageError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(StorageError::InvalidName {
            name: key.to_string(),
            reason: "object name must be non-empty and not end with '/'".into(),
        });
    }
    Path::parse(key).map_err(|e| StorageError::InvalidName {
        name: key.to_string(),
        reason: e.to_string(),
    })
}

fn bucket_path(bucket: &str, key: &Path) -> Path {
    Path::from(bucket).parts().chain(key.parts()).collect()
}

/// Local filesystem backend.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &FsPath) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        let canonical = std::fs::canonicalize(root)?;
        let store = LocalFileSystem::new_with_prefix(&canonical)?;
        info!("Storage: local backend at {}", canonical.display());
        Ok(Self {
            store: Arc::new(store),
            root: canonical,
        })
    }
}

/// S3 backend. Stores are bound to a bucket, so one is built per bucket.
pub struct S3Backend {
    aws: AwsSettings,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Backend {
    pub fn new(aws: &AwsSettings) -> Self {
        info!(region = %aws.region, "Storage: S3 backend");
        Self {
            aws: aws.clone(),
            stores: RwLock::new(HashMap::new()),
        }
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        if let Some(store) = self.stores.read().ok().and_then(|m| m.get(bucket).cloned()) {
            return Ok(store);
        }
        let store = self.build(bucket)?;
        if let Ok(mut stores) = self.stores.write() {
            stores.insert(bucket.to_string(), store.clone());
        }
        Ok(store)
    }

    fn build(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let aws = &self.aws;
        let mut builder = AmazonS3Builder::new().with_region(&aws.region);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                // object_store requires an absolute endpoint URL
                let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_string()
                } else {
                    format!("https://{endpoint}")
                };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
            None => {
                builder = builder.with_url(format!("s3://{bucket}"));
            }
        }

        let store = builder.build()?;
        info!(bucket, region = %aws.region, "Storage: opened S3 bucket");
        Ok(Arc::new(store))
    }
}
