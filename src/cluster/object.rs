//! Hosted cluster store on top of an object store.
//!
//! The lease table and the routing table are two buckets (or any two
//! `ObjectStore`s); each cluster keeps one JSON object per table, named after
//! the cluster id. Conditional writes use the object's ETag: the first write
//! is create-only and later writes must match the ETag returned by the load.

use super::store::{
    ClusterStore, LeaseRecord, RoutingSnapshot, StoreError, StoreResult, Versioned,
};
use async_trait::async_trait;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Credentials and table names for the hosted backend.
#[derive(Clone)]
pub struct ObjectStoreSettings {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub lease_table: String,
    pub routing_table: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for ObjectStoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreSettings")
            .field("region", &self.region)
            .field("lease_table", &self.lease_table)
            .field("routing_table", &self.routing_table)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Cluster store backed by two object stores.
#[derive(Debug, Clone)]
pub struct ObjectClusterStore {
    leases: Arc<dyn ObjectStore>,
    routing: Arc<dyn ObjectStore>,
}

impl ObjectClusterStore {
    pub fn new(leases: Arc<dyn ObjectStore>, routing: Arc<dyn ObjectStore>) -> Self {
        Self { leases, routing }
    }

    /// Builds S3 clients for the lease and routing buckets.
    pub fn from_settings(settings: &ObjectStoreSettings) -> StoreResult<Self> {
        let leases = build_s3(settings, &settings.lease_table)?;
        let routing = build_s3(settings, &settings.routing_table)?;
        Ok(Self::new(Arc::new(leases), Arc::new(routing)))
    }

    fn row_path(cluster: &str) -> Path {
        Path::from(format!("{}.json", cluster))
    }
}

fn build_s3(
    settings: &ObjectStoreSettings,
    bucket: &str,
) -> StoreResult<object_store::aws::AmazonS3> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(&settings.region)
        .with_access_key_id(&settings.access_key)
        .with_secret_access_key(&settings.secret_key)
        .with_conditional_put(S3ConditionalPut::ETagMatch);

    if let Some(endpoint) = &settings.endpoint {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }

    builder
        .build()
        .map_err(|e| StoreError::Backend(format!("cannot configure bucket {}: {}", bucket, e)))
}

fn map_error(e: object_store::Error) -> StoreError {
    match e {
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StoreError::Conflict
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

async fn load_row<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &Path,
) -> StoreResult<Option<Versioned<T>>> {
    let result = match store.get(path).await {
        Ok(result) => result,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(map_error(e)),
    };

    let version = result
        .meta
        .e_tag
        .clone()
        .ok_or_else(|| StoreError::Backend(format!("no ETag returned for {}", path)))?;
    let bytes = result.bytes().await.map_err(map_error)?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path, e)))?;

    debug!(path = %path, version = %version, "Loaded cluster row");
    Ok(Some(Versioned { value, version }))
}

async fn put_row<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    path: &Path,
    value: &T,
    expected: Option<&str>,
) -> StoreResult<()> {
    let body = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let mode = match expected {
        None => PutMode::Create,
        Some(e_tag) => PutMode::Update(UpdateVersion {
            e_tag: Some(e_tag.to_string()),
            version: None,
        }),
    };
    let opts = PutOptions {
        mode,
        ..Default::default()
    };

    store
        .put_opts(path, PutPayload::from(body), opts)
        .await
        .map_err(map_error)?;
    Ok(())
}

#[async_trait]
impl ClusterStore for ObjectClusterStore {
    async fn load_lease(&self, cluster: &str) -> StoreResult<Option<Versioned<LeaseRecord>>> {
        load_row(self.leases.as_ref(), &Self::row_path(cluster)).await
    }

    async fn put_lease(
        &self,
        cluster: &str,
        record: &LeaseRecord,
        expected: Option<&str>,
    ) -> StoreResult<()> {
        put_row(self.leases.as_ref(), &Self::row_path(cluster), record, expected).await
    }

    async fn load_routing(&self, cluster: &str) -> StoreResult<Option<Versioned<RoutingSnapshot>>> {
        load_row(self.routing.as_ref(), &Self::row_path(cluster)).await
    }

    async fn put_routing(
        &self,
        cluster: &str,
        snapshot: &RoutingSnapshot,
        expected: Option<&str>,
    ) -> StoreResult<()> {
        put_row(self.routing.as_ref(), &Self::row_path(cluster), snapshot, expected).await
    }
}
