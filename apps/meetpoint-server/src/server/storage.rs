use std::sync::Arc;

use anyhow::anyhow;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, path::Path as ObjectPath, ObjectStore,
};

use super::{
    core::{AppConfig, AppState},
    errors::ApiFailure,
    types::{StorageObjectItem, StorageTreeResponse},
};

pub(crate) fn build_object_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    if let Some(bucket) = &config.s3_bucket {
        let bucket = bucket.trim();
        if bucket.is_empty() {
            return Err(anyhow!("s3 bucket cannot be empty"));
        }
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(config.s3_region.as_deref().unwrap_or("us-east-1"));
        match (&config.s3_access_key, &config.s3_secret_key) {
            (Some(access_key), Some(secret_key)) => {
                builder = builder
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key);
            }
            (None, None) => {}
            _ => return Err(anyhow!("s3 access key and secret key must be set together")),
        }
        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| anyhow!("s3 store init failed: {e}"))?;
        return Ok(Arc::new(store));
    }

    std::fs::create_dir_all(&config.storage_root)
        .map_err(|e| anyhow!("storage root init failed: {e}"))?;
    let store = LocalFileSystem::new_with_prefix(&config.storage_root)
        .map_err(|e| anyhow!("local store init failed: {e}"))?;
    Ok(Arc::new(store))
}

pub(crate) fn profile_photo_key(user_id: &str, extension: &str) -> String {
    format!("users/{user_id}/profile-photo.{extension}")
}

pub(crate) fn extension_for_photo_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Folder-like listing of the object store, one delimiter level at a time.
pub(crate) async fn list_tree(
    state: &AppState,
    prefix: Option<&str>,
) -> Result<StorageTreeResponse, ApiFailure> {
    let prefix_path = prefix
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ObjectPath::from);
    let listing = state
        .object_store
        .list_with_delimiter(prefix_path.as_ref())
        .await
        .map_err(|_| ApiFailure::Internal)?;

    let prefixes = listing
        .common_prefixes
        .into_iter()
        .map(|path| path.to_string())
        .collect();
    let objects = listing
        .objects
        .into_iter()
        .map(|meta| StorageObjectItem {
            key: meta.location.to_string(),
            size_bytes: meta.size,
        })
        .collect();

    Ok(StorageTreeResponse { prefixes, objects })
}
