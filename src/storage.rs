use async_trait::async_trait;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Byte storage for attachment blobs, keyed by content hash. Writes happen
/// after the owning record exists; they are best-effort, not transactional
/// with the database row.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save(&self, hash: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn load(&self, hash: &str) -> Result<(Vec<u8>, String), StoreError>;
    async fn delete(&self, hash: &str) -> Result<(), StoreError>;
}

/// Hashes are ASCII hex; anything else cannot address a blob. Checked before
/// the two-char fan-out slice so arbitrary path input never panics.
fn valid_hash(hash: &str) -> bool {
    hash.len() >= 2 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------- Filesystem implementation (default; dev and tests) -----

pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new() -> Self {
        let base = std::env::var("TABULA_DATA_DIR").unwrap_or_else(|_| "data".into());
        let mut root = PathBuf::from(base);
        root.push("attachments");
        Self { root }
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        let mut p = self.root.clone();
        p.push(&hash[0..2]);
        p.push(hash);
        p
    }
}

impl Default for FsAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn save(&self, hash: &str, _mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(hash);
        if path.exists() {
            return Err(StoreError::Duplicate);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Other(e.to_string()))?;
        }
        std::fs::write(&path, bytes).map_err(|e| StoreError::Other(e.to_string()))
    }
    async fn load(&self, hash: &str) -> Result<(Vec<u8>, String), StoreError> {
        if !valid_hash(hash) {
            return Err(StoreError::NotFound);
        }
        let bytes = std::fs::read(self.path_for(hash)).map_err(|_| StoreError::NotFound)?;
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes, mime))
    }
    async fn delete(&self, hash: &str) -> Result<(), StoreError> {
        if valid_hash(hash) {
            let _ = std::fs::remove_file(self.path_for(hash));
        }
        Ok(())
    }
}

// ---------------- S3 implementation (MinIO compatible) -------------------

pub struct S3AttachmentStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3AttachmentStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "tabula-attachments".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing; MinIO endpoints rarely have wildcard DNS.
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3/MinIO attachment store");

        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            client
                .create_bucket()
                .bucket(&bucket)
                .send()
                .await
                .map_err(|e2| anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"))?;
            info!("created bucket '{bucket}'");
        }

        Ok(Self { bucket, client, prefix: "attachments".into() })
    }

    fn key_for(&self, hash: &str) -> String {
        format!("{}/{}/{}", self.prefix, &hash[0..2], hash)
    }
}

#[async_trait]
impl AttachmentStore for S3AttachmentStore {
    async fn save(&self, hash: &str, _mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let key = self.key_for(hash);
        if self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .is_ok()
        {
            return Err(StoreError::Duplicate);
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(
                infer::get(bytes)
                    .map(|t| t.mime_type().to_string())
                    .unwrap_or_else(|| "application/octet-stream".into()),
            );
        if let Err(e) = put.send().await {
            error!("put_object failed hash={hash} key={key} bucket={}: {e:?}", self.bucket);
            return Err(StoreError::Other(e.to_string()));
        }
        Ok(())
    }
    async fn load(&self, hash: &str) -> Result<(Vec<u8>, String), StoreError> {
        if !valid_hash(hash) {
            return Err(StoreError::NotFound);
        }
        let key = self.key_for(hash);
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|_| StoreError::NotFound)?;
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes, mime))
    }
    async fn delete(&self, hash: &str) -> Result<(), StoreError> {
        if !valid_hash(hash) {
            return Ok(());
        }
        let key = self.key_for(hash);
        // Best-effort delete: treat not found as success
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;
        Ok(())
    }
}

/// Factory used in main: S3 when an endpoint is configured, filesystem
/// otherwise.
pub async fn build_attachment_store() -> Arc<dyn AttachmentStore> {
    if std::env::var("S3_ENDPOINT").is_ok() {
        match S3AttachmentStore::new().await {
            Ok(store) => return Arc::new(store),
            Err(e) => panic!("Failed to initialize S3 attachment store: {e}"),
        }
    }
    Arc::new(FsAttachmentStore::new())
}
