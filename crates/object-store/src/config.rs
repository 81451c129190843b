//! Store configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ObjectStoreError, Result};

/// Bucket created at startup when none is configured.
pub const DEFAULT_BUCKET: &str = "objectstore";

/// Default capacity of the request queue feeding the sequencing loop.
pub const DEFAULT_REQUEST_BUFFER: usize = 256;

/// Backing object storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory storage, lost when the store is dropped.
    Memory,
    /// Local filesystem rooted at `path`.
    Local { path: PathBuf },
    /// S3 or any S3-compatible service (MinIO, etc.).
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        #[serde(default)]
        region: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Prefix for every object key, usually the owning model's identifier.
    pub namespace: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub backend: BackendConfig,
    /// SQLite file for the metadata index. In-memory when absent.
    #[serde(default)]
    pub metadata_db: Option<PathBuf>,
    /// Directory for upload temp files. System temp dir when absent.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

fn default_request_buffer() -> usize {
    DEFAULT_REQUEST_BUFFER
}

impl ObjectStoreConfig {
    /// Fully ephemeral configuration: in-memory metadata and objects.
    pub fn ephemeral(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            bucket: default_bucket(),
            backend: BackendConfig::Memory,
            metadata_db: None,
            temp_dir: None,
            request_buffer: DEFAULT_REQUEST_BUFFER,
        }
    }

    /// Local configuration keeping everything under `data_dir`
    /// (db at `data_dir/objectstore.db`, objects at `data_dir/objects/`,
    /// temp files at `data_dir/tmp/`).
    pub fn local(namespace: impl Into<String>, data_dir: &Path) -> Self {
        Self {
            namespace: namespace.into(),
            bucket: default_bucket(),
            backend: BackendConfig::Local {
                path: data_dir.join("objects"),
            },
            metadata_db: Some(data_dir.join("objectstore.db")),
            temp_dir: Some(data_dir.join("tmp")),
            request_buffer: DEFAULT_REQUEST_BUFFER,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ObjectStoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(ObjectStoreError::Config("namespace must not be empty".into()));
        }
        if self.namespace.contains('/') {
            return Err(ObjectStoreError::Config(format!(
                "namespace {:?} must not contain '/'",
                self.namespace
            )));
        }
        if self.bucket.is_empty() || self.bucket.contains('/') {
            return Err(ObjectStoreError::Config(format!(
                "invalid bucket name {:?}",
                self.bucket
            )));
        }
        if self.request_buffer == 0 {
            return Err(ObjectStoreError::Config(
                "request_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_config() {
        let config = ObjectStoreConfig::from_toml_str(
            r#"
            namespace = "model-1"
            metadata_db = "/var/lib/store/objectstore.db"

            [backend]
            type = "local"
            path = "/var/lib/store/objects"
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "model-1");
        assert_eq!(config.bucket, DEFAULT_BUCKET);
        assert_eq!(config.request_buffer, DEFAULT_REQUEST_BUFFER);
        assert_eq!(
            config.backend,
            BackendConfig::Local {
                path: PathBuf::from("/var/lib/store/objects")
            }
        );
        assert!(config.temp_dir.is_none());
    }

    #[test]
    fn test_parse_s3_config() {
        let config = ObjectStoreConfig::from_toml_str(
            r#"
            namespace = "model-2"
            bucket = "controller"

            [backend]
            type = "s3"
            endpoint = "http://localhost:9000"
            access_key = "minioadmin"
            secret_key = "minioadmin"
            bucket = "blobs"
            "#,
        )
        .unwrap();

        assert_eq!(config.bucket, "controller");
        match config.backend {
            BackendConfig::S3 { bucket, region, .. } => {
                assert_eq!(bucket, "blobs");
                assert!(region.is_none());
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_namespace() {
        let err = ObjectStoreConfig::from_toml_str(
            r#"
            namespace = "a/b"
            [backend]
            type = "memory"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ObjectStoreError::Config(_)));

        assert!(ObjectStoreConfig::ephemeral("").validate().is_err());
    }
}
