//! The Landing Store: durable raw objects addressed by `bucket/object`.
//!
//! Object names are overwrite targets. Writing the same name twice leaves
//! exactly one object holding the last bytes written, which is what lets
//! duplicate ingestion runs coexist without coordination.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::{ObjectMeta, PutPayload};
use tracing::debug;

use datafeed_core::{AccessPolicy, ObjectUri, Permission, Principal};

use crate::backend::StorageBackend;
use crate::error::StorageError;

/// Metadata of a landed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub uri: ObjectUri,
    pub size: usize,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
}

#[async_trait]
pub trait LandingStore: Send + Sync {
    /// Write `bytes` under `object_name`, replacing any previous object.
    /// Returns once the write is durable.
    async fn put(&self, bucket: &str, object_name: &str, bytes: Bytes) -> Result<ObjectInfo, StorageError>;

    async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError>;

    /// `None` when the object does not exist.
    async fn head(&self, bucket: &str, object_name: &str) -> Result<Option<ObjectInfo>, StorageError>;

    /// Objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;
}

#[async_trait]
impl<T: LandingStore + ?Sized> LandingStore for Arc<T> {
    async fn put(&self, bucket: &str, object_name: &str, bytes: Bytes) -> Result<ObjectInfo, StorageError> {
        (**self).put(bucket, object_name, bytes).await
    }

    async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
        (**self).get(bucket, object_name).await
    }

    async fn head(&self, bucket: &str, object_name: &str) -> Result<Option<ObjectInfo>, StorageError> {
        (**self).head(bucket, object_name).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        (**self).list(bucket, prefix).await
    }
}

/// [`LandingStore`] backed by a [`StorageBackend`].
pub struct ObjectLandingStore {
    backend: StorageBackend,
}

impl ObjectLandingStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    fn info(bucket: &str, object_name: &str, meta: &ObjectMeta) -> ObjectInfo {
        ObjectInfo {
            uri: ObjectUri {
                bucket: bucket.to_string(),
                object_name: object_name.to_string(),
            },
            size: meta.size,
            last_modified: meta.last_modified,
            e_tag: meta.e_tag.clone(),
        }
    }
}

#[async_trait]
impl LandingStore for ObjectLandingStore {
    async fn put(&self, bucket: &str, object_name: &str, bytes: Bytes) -> Result<ObjectInfo, StorageError> {
        let (store, path) = self.backend.locate(bucket, object_name)?;
        let size = bytes.len();
        store.put(&path, PutPayload::from(bytes)).await?;
        let meta = store.head(&path).await?;
        debug!(bucket, object = object_name, size, "object written");
        Ok(Self::info(bucket, object_name, &meta))
    }

    async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
        let (store, path) = self.backend.locate(bucket, object_name)?;
        match store.get(&path).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(StorageError::NotFound(format!("{bucket}/{object_name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, bucket: &str, object_name: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let (store, path) = self.backend.locate(bucket, object_name)?;
        match store.head(&path).await {
            Ok(meta) => Ok(Some(Self::info(bucket, object_name, &meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let (store, root) = self.backend.bucket_root(bucket)?;
        let root_str = root.as_ref().map(|p| format!("{p}/")).unwrap_or_default();

        let metas: Vec<ObjectMeta> = store.list(root.as_ref()).try_collect().await?;
        let mut objects: Vec<ObjectInfo> = metas
            .iter()
            .filter_map(|meta| {
                let full = meta.location.as_ref();
                let name = full.strip_prefix(root_str.as_str()).unwrap_or(full);
                name.starts_with(prefix)
                    .then(|| Self::info(bucket, name, meta))
            })
            .collect();
        objects.sort_by(|a, b| a.uri.object_name.cmp(&b.uri.object_name));
        Ok(objects)
    }
}

/// A landing store opened on behalf of a principal. Writes need
/// `LandingWrite`; reads and listings need `LandingRead`.
pub struct GuardedLandingStore {
    inner: Arc<dyn LandingStore>,
    principal: Principal,
    policy: Arc<AccessPolicy>,
}

impl GuardedLandingStore {
    pub fn new(inner: Arc<dyn LandingStore>, principal: Principal, policy: Arc<AccessPolicy>) -> Self {
        Self {
            inner,
            principal,
            policy,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

#[async_trait]
impl LandingStore for GuardedLandingStore {
    async fn put(&self, bucket: &str, object_name: &str, bytes: Bytes) -> Result<ObjectInfo, StorageError> {
        self.policy.check(&self.principal, &Permission::LandingWrite)?;
        self.inner.put(bucket, object_name, bytes).await
    }

    async fn get(&self, bucket: &str, object_name: &str) -> Result<Bytes, StorageError> {
        self.policy.check(&self.principal, &Permission::LandingRead)?;
        self.inner.get(bucket, object_name).await
    }

    async fn head(&self, bucket: &str, object_name: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.policy.check(&self.principal, &Permission::LandingRead)?;
        self.inner.head(bucket, object_name).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.policy.check(&self.principal, &Permission::LandingRead)?;
        self.inner.list(bucket, prefix).await
    }
}
