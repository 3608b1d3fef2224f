//! Artifact exporter and artifact bucket lifecycle.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Store;
use crate::provider::{ObjectStoreApi, ProviderError, PutObjectRequest};
use crate::retry::{retry_if, RetryConfig};
use crate::{Error, Result, ARTIFACT_KIND};

const ACL_PRIVATE: &str = "private";

/// Uploads every recorded artifact under `<clusterName>/`
#[derive(Clone)]
pub struct Exporter {
    store: Store,
    s3: Arc<dyn ObjectStoreApi>,
}

impl Exporter {
    /// Exporter writing to the configured bucket
    pub fn new(store: Store, s3: Arc<dyn ObjectStoreApi>) -> Self {
        Self { store, s3 }
    }

    /// Upload every artifact whose local file exists. Failures are logged
    /// and skipped. Returns the number of uploaded objects.
    pub async fn upload(&self) -> usize {
        let (bucket, ours, exists, entries) = self.store.read(|c| {
            (
                c.s3_bucket.name.clone(),
                c.s3_bucket.create,
                c.status.s3_bucket_created,
                c.artifacts(),
            )
        });
        if bucket.is_empty() {
            debug!("no artifact bucket, skipping upload");
            return 0;
        }
        if ours && !exists {
            debug!(bucket = %bucket, "artifact bucket not created yet or already deleted, skipping upload");
            return 0;
        }
        let metadata = BTreeMap::from([("Kind".to_string(), ARTIFACT_KIND.to_string())]);

        let mut uploaded = 0;
        for entry in entries {
            if !entry.local_path.exists() {
                debug!(path = %entry.local_path.display(), "artifact missing locally, skipping");
                continue;
            }
            let req = PutObjectRequest {
                bucket: bucket.clone(),
                key: entry.remote_key.clone(),
                path: entry.local_path.clone(),
                acl: ACL_PRIVATE.to_string(),
                metadata: metadata.clone(),
            };
            match self.s3.put_object(&req).await {
                Ok(()) => uploaded += 1,
                Err(e) => warn!(key = %entry.remote_key, error = %e, "failed to upload artifact"),
            }
        }
        info!(bucket = %bucket, uploaded, "uploaded artifacts");
        uploaded
    }

    /// Create the bucket when asked to, then write a probe object
    pub async fn create_bucket(&self) -> Result<()> {
        let (s3_bucket, region, name, created) = self.store.read(|c| {
            (
                c.s3_bucket.clone(),
                c.region.clone(),
                c.name.clone(),
                c.status.s3_bucket_created,
            )
        });
        if s3_bucket.name.is_empty() || !s3_bucket.create {
            return Ok(());
        }
        if !created {
            // recorded first so an interrupted create is still cleaned up
            self.store.update(|c| c.status.s3_bucket_created = true);
            let retry = RetryConfig::fixed(5, Duration::from_secs(5));
            let res = retry_if(
                &retry,
                "create_bucket",
                || self.s3.create_bucket(&s3_bucket.name, &region),
                ProviderError::is_transient,
            )
            .await;
            match res {
                Ok(()) => info!(bucket = %s3_bucket.name, "created artifact bucket"),
                Err(e) if e.is_already_exists() => info!(bucket = %s3_bucket.name, "artifact bucket already exists"),
                Err(e) => return Err(e.into()),
            }
        }

        let mut probe = tempfile::NamedTempFile::new()?;
        writeln!(probe, "{name}")?;
        let req = PutObjectRequest {
            bucket: s3_bucket.name.clone(),
            key: format!("{name}/bucket-probe.txt"),
            path: probe.path().to_path_buf(),
            acl: ACL_PRIVATE.to_string(),
            metadata: BTreeMap::from([("Kind".to_string(), ARTIFACT_KIND.to_string())]),
        };
        self.s3.put_object(&req).await?;
        Ok(())
    }

    /// Delete this cluster's objects and the bucket, unless the bucket was
    /// not created here or must be kept
    pub async fn delete_bucket(&self) -> Result<()> {
        let (s3_bucket, name, created) = self
            .store
            .read(|c| (c.s3_bucket.clone(), c.name.clone(), c.status.s3_bucket_created));
        if !created || s3_bucket.create_keep || s3_bucket.name.is_empty() {
            return Ok(());
        }
        let bucket = s3_bucket.name;

        let keys = match self.s3.list_objects(&bucket, &format!("{name}/")).await {
            Ok(keys) => keys,
            Err(e) if e.is_not_found() => {
                info!(bucket = %bucket, "artifact bucket already gone");
                self.store.update(|c| c.status.s3_bucket_created = false);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut failed = Vec::new();
        for key in &keys {
            match self.s3.delete_object(&bucket, key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => failed.push(format!("{key}: {e}")),
            }
        }
        if !failed.is_empty() {
            return Err(Error::Teardown(failed));
        }
        match self.s3.delete_bucket(&bucket).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.store.update(|c| c.status.s3_bucket_created = false);
        info!(bucket = %bucket, objects = keys.len(), "deleted artifact bucket");
        Ok(())
    }
}
