//! Object store factory and firmware artifact paths.
//!
//! Firmware artifacts are stored in an [`ObjectStore`] under
//! `firmware/{org}/{kind}/{version}.{ext}`. Versions are unique per
//! organisation, so the path is collision-free, and keeping the organisation
//! in the prefix makes per-tenant lifecycle rules possible on cloud backends.

use std::sync::Arc;

use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;

use crate::config::StorageConfig;
use crate::error::{FleetError, FleetResult};
use crate::types::{ArtifactKind, OrgId};

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the object store cannot be created (e.g., invalid
/// path, or S3 requested without the `s3` feature).
pub fn create_object_store(config: &StorageConfig) -> FleetResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Local { path } => {
            std::fs::create_dir_all(path)
                .map_err(|e| FleetError::unavailable(format!("cannot create {path:?}: {e}")))?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            Ok(Arc::new(store))
        }
        StorageConfig::Memory => Ok(Arc::new(InMemory::new())),
        #[cfg(feature = "s3")]
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            allow_http,
        } => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

            if let Some(r) = region {
                builder = builder.with_region(r);
            }
            if let Some(ref ep) = endpoint {
                builder = builder.with_endpoint(ep);
            }
            if let Some(ref key) = access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(ref secret) = secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }

            let store = builder.build()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => Err(FleetError::unavailable(
            "S3 storage requires the 's3' feature to be enabled",
        )),
    }
}

/// Blob path for a firmware artifact.
///
/// The bin artifact keeps a `.bin` extension; hex and bootloader artifacts
/// are both HEX-format files and use `.hex`.
#[must_use]
pub fn artifact_path(org: &OrgId, kind: ArtifactKind, version: &str) -> Path {
    let ext = match kind {
        ArtifactKind::Bin => "bin",
        ArtifactKind::Hex | ArtifactKind::Bootloader => "hex",
    };
    Path::from(format!("firmware/{org}/{}/{version}.{ext}", kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_are_org_scoped() {
        let org = OrgId::new("01hq3ma9");
        assert_eq!(
            artifact_path(&org, ArtifactKind::Bin, "1.2.0").to_string(),
            "firmware/01hq3ma9/bin/1.2.0.bin"
        );
        assert_eq!(
            artifact_path(&org, ArtifactKind::Hex, "1.2.0").to_string(),
            "firmware/01hq3ma9/hex/1.2.0.hex"
        );
        assert_eq!(
            artifact_path(&org, ArtifactKind::Bootloader, "1.2.0").to_string(),
            "firmware/01hq3ma9/bootloader/1.2.0.hex"
        );
    }

    #[tokio::test]
    async fn create_memory_store() {
        let store = create_object_store(&StorageConfig::Memory).unwrap();

        let path = Path::from("test.bin");
        store.put(&path, "hello".into()).await.unwrap();
        let result = store.get(&path).await.unwrap();
        let bytes = result.bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn create_local_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::Local {
            path: temp_dir.path().to_path_buf(),
        };
        let store = create_object_store(&config).unwrap();

        let path = Path::from("test.bin");
        store.put(&path, "hello".into()).await.unwrap();
        let result = store.get(&path).await.unwrap();
        let bytes = result.bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
