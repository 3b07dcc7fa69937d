// src/publish/minio.rs
// S3-compatible object store (MinIO) behind `object_store`'s Amazon S3 backend.

use anyhow::{bail, Context, Result};
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    path::Path as ObjectPath,
    Attribute, AttributeValue, Attributes, ObjectStore, PutMultipartOpts, PutOptions, PutPayload,
    RetryConfig, WriteMultipart,
};
use std::path::{Path, PathBuf};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, instrument};

use crate::config::MinioSettings;

/// Files up to this size go in one PUT, larger ones as a multipart upload.
const SINGLE_PUT_LIMIT: u64 = 16 << 20;
const PART_SIZE: usize = 8 << 20;
/// Parts in flight during a multipart upload.
const MAX_CONCURRENT_PARTS: usize = 4;

/// One file to push: `<source_path><source_name>` → `<dest_path><dest_name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTransfer {
    pub source_path: PathBuf,
    pub source_name: String,
    pub dest_path: String,
    pub dest_name: String,
}

impl FileTransfer {
    pub fn source(&self) -> PathBuf {
        self.source_path.join(&self.source_name)
    }

    /// Object key below the client prefix.
    pub fn dest_key(&self) -> String {
        let dir = self.dest_path.trim_matches('/');
        if dir.is_empty() {
            self.dest_name.clone()
        } else {
            format!("{}/{}", dir, self.dest_name)
        }
    }
}

#[derive(Clone, Debug)]
pub struct MinioClient {
    store: AmazonS3,
    bucket: String,
    /// Prepended to every key, the environment name.
    prefix: String,
}

impl MinioClient {
    /// Path-style client on `settings.endpoint`. Without credentials requests
    /// go out unsigned.
    pub fn new(settings: &MinioSettings, prefix: &str) -> Result<Self> {
        if settings.bucket.is_empty() {
            bail!("object store bucket is not configured");
        }
        let store = AmazonS3Builder::new()
            .with_endpoint(settings.endpoint.trim_end_matches('/'))
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_access_key_id(&settings.user)
            .with_secret_access_key(&settings.password)
            .with_skip_signature(settings.user.is_empty())
            .with_virtual_hosted_style_request(false)
            .with_allow_http(true)
            .with_retry(RetryConfig {
                max_retries: settings.max_retries,
                ..RetryConfig::default()
            })
            .build()
            .with_context(|| format!("configuring object store at {}", settings.endpoint))?;
        Ok(Self {
            store,
            bucket: settings.bucket.clone(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Full object key: `<prefix>/<key>`.
    pub fn full_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn location(&self, key: &str) -> ObjectPath {
        ObjectPath::from(self.full_key(key))
    }

    /// Does `key` exist in the bucket?
    #[instrument(level = "debug", skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&self.location(key)).await {
            Ok(meta) => {
                debug!(size = meta.size, "object found");
                Ok(true)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("HEAD {}", self.full_key(key))),
        }
    }

    /// Upload the local file `src` under `key`. Returns the bytes sent.
    #[instrument(level = "debug", skip(self, src), fields(src = %src.display()))]
    pub async fn put_file(&self, key: &str, src: &Path, content_type: &'static str) -> Result<u64> {
        let len = tokio::fs::metadata(src)
            .await
            .with_context(|| format!("reading {}", src.display()))?
            .len();
        let location = self.location(key);
        let attributes = Attributes::from_iter([(
            Attribute::ContentType,
            AttributeValue::from(content_type),
        )]);

        if len <= SINGLE_PUT_LIMIT {
            let body = tokio::fs::read(src)
                .await
                .with_context(|| format!("reading {}", src.display()))?;
            let opts = PutOptions {
                attributes,
                ..PutOptions::default()
            };
            self.store
                .put_opts(&location, PutPayload::from(body), opts)
                .await
                .with_context(|| format!("PUT {}", location))?;
            return Ok(len);
        }

        let opts = PutMultipartOpts {
            attributes,
            ..PutMultipartOpts::default()
        };
        let upload = self
            .store
            .put_multipart_opts(&location, opts)
            .await
            .with_context(|| format!("starting multipart upload of {}", location))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
        match stream_into(&mut writer, src).await {
            Ok(()) => {
                writer
                    .finish()
                    .await
                    .with_context(|| format!("completing multipart upload of {}", location))?;
                Ok(len)
            }
            Err(e) => {
                // leave no dangling parts behind
                let _ = writer.abort().await;
                Err(e)
            }
        }
    }

    /// Upload every transfer in order. The first failure aborts the batch.
    /// Returns the full keys written.
    pub async fn send_files(&self, files: &[FileTransfer]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(files.len());
        for f in files {
            let key = f.dest_key();
            let bytes = self
                .put_file(&key, &f.source(), content_type_for(&f.dest_name))
                .await?;
            info!(object = %self.full_key(&key), bucket = %self.bucket, bytes, "uploaded");
            written.push(self.full_key(&key));
        }
        Ok(written)
    }
}

async fn stream_into(writer: &mut WriteMultipart, src: &Path) -> Result<()> {
    let mut file = File::open(src)
        .await
        .with_context(|| format!("opening {}", src.display()))?;
    let mut buf = vec![0u8; PART_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer
            .wait_for_capacity(MAX_CONCURRENT_PARTS)
            .await
            .context("uploading part")?;
        writer.write(&buf[..n]);
    }
}

pub fn content_type_for(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    match lower.rsplit('.').next() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}
