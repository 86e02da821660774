use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Expiry of URLs handed to external players
pub const PLAYER_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Object storage operations the upload pipeline and link handlers need
///
/// Failures are reported as `false`/`None` rather than errors; the
/// implementation logs the cause.
#[async_trait]
pub trait ObjectStorageGateway: Send + Sync {
    /// Stream the file at `local_path` to `key`, reporting cumulative bytes
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> bool;

    /// Time-limited GET URL for `key`
    async fn presigned_url(&self, key: &str, expiry: Duration) -> Option<String>;

    /// MX Player deep link for `key`, backed by a 24h presigned URL
    async fn external_player_url(&self, key: &str, display_name: &str) -> Option<String> {
        let url = self.presigned_url(key, PLAYER_URL_EXPIRY).await?;
        Some(mx_player_intent(&url, display_name))
    }

    /// Remove an object
    async fn delete(&self, key: &str) -> bool;

    /// Check that the bucket is reachable
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Object key for an uploaded file
/// Format: files/{file_id}/{sanitized name}
pub fn storage_key(file_id: Uuid, file_name: &str) -> String {
    format!("files/{}/{}", file_id, sanitize_file_name(file_name))
}

/// Build an Android intent that opens `url` in MX Player
pub fn mx_player_intent(url: &str, title: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("https", url));

    format!(
        "intent://{rest}#Intent;package=com.mxtech.videoplayer.ad;type=video/*;scheme={scheme};S.title={title};end",
        rest = rest,
        scheme = scheme,
        title = utf8_percent_encode(title, NON_ALPHANUMERIC),
    )
}

/// S3-compatible implementation of [`ObjectStorageGateway`]
pub struct S3Gateway {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Gateway {
    /// Create a new gateway from explicit credentials
    pub async fn new(config: &S3Config) -> Result<Self> {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "filebot-config",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for Wasabi/MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 gateway initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    async fn try_upload(
        &self,
        local_path: &Path,
        key: &str,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64> {
        let size = tokio::fs::metadata(local_path)
            .await
            .context("Failed to read staged file metadata")?
            .len();
        let content_type = content_type_for(key);

        debug!(key = %key, size_bytes = size, "Uploading file to S3");

        // Check if we should use multipart upload
        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(local_path, key, &content_type, on_progress)
                .await?;
        } else {
            self.simple_upload(local_path, key, &content_type).await?;
            on_progress(size);
        }

        Ok(size)
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, local_path: &Path, key: &str, content_type: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .context("Failed to open staged file")?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload file to S3")?;

        Ok(())
    }

    /// Multipart upload for large files; aborted on any part failure
    async fn multipart_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        let parts = match self
            .upload_parts(local_path, key, &upload_id, on_progress)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart_upload(key, &upload_id).await;
                return Err(e);
            }
        };

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
        {
            self.abort_multipart_upload(key, &upload_id).await;
            return Err(e).context("Failed to complete multipart upload");
        }

        Ok(())
    }

    /// Read the file part by part and upload up to `upload_concurrency` parts at once
    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<Vec<CompletedPart>> {
        let file = File::open(local_path)
            .await
            .context("Failed to open staged file")?;
        let part_size = self.config.part_size_bytes;
        let transferred = AtomicU64::new(0);
        let transferred = &transferred;

        let chunks = futures::stream::try_unfold((file, 1i32), move |(mut file, part_number)| async move {
            let chunk = read_chunk(&mut file, part_size).await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            Ok::<_, anyhow::Error>(Some(((part_number, chunk), (file, part_number + 1))))
        });

        let mut parts: Vec<CompletedPart> = chunks
            .map_ok(|(part_number, chunk)| async move {
                let len = chunk.len() as u64;

                let response = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .with_context(|| format!("Failed to upload part {}", part_number))?;

                let total = transferred.fetch_add(len, Ordering::SeqCst) + len;
                on_progress(total);

                Ok::<_, anyhow::Error>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(response.e_tag().unwrap_or_default())
                        .build(),
                )
            })
            .try_buffer_unordered(self.config.upload_concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(|part| part.part_number());
        Ok(parts)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(error = %e, key = %key, "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl ObjectStorageGateway for S3Gateway {
    #[instrument(skip(self, local_path, on_progress), fields(key = %key))]
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> bool {
        match self.try_upload(local_path, key, on_progress).await {
            Ok(size) => {
                info!(key = %key, size_bytes = size, "File uploaded successfully");
                metrics::counter!("filebot.bytes.uploaded").increment(size);
                true
            }
            Err(e) => {
                error!(error = ?e, key = %key, "Upload failed");
                metrics::counter!("filebot.storage.errors").increment(1);
                false
            }
        }
    }

    async fn presigned_url(&self, key: &str, expiry: Duration) -> Option<String> {
        let presigning_config = match PresigningConfig::expires_in(expiry) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Invalid presigning expiry");
                return None;
            }
        };

        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
        {
            Ok(presigned) => Some(presigned.uri().to_string()),
            Err(e) => {
                warn!(error = %e, key = %key, "Failed to generate presigned URL");
                None
            }
        }
    }

    async fn health(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("Bucket {} is not reachable", self.bucket))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> bool {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Object deleted from S3");
                true
            }
            Err(e) => {
                warn!(error = %e, key = %key, "Failed to delete object");
                false
            }
        }
    }
}

async fn read_chunk(file: &mut File, part_size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; part_size];
    let mut filled = 0;

    while filled < part_size {
        let n = file
            .read(&mut buf[filled..])
            .await
            .context("Failed to read staged file")?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

/// Sanitize a file name for use as the last key segment
fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Get content type for an object key
fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::http::{header, Method, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::any;
    use axum::Router;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_storage_key_format() {
        let file_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(
            storage_key(file_id, "holiday video.mp4"),
            "files/550e8400-e29b-41d4-a716-446655440000/holiday_video.mp4"
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name("фото 1.jpg"), "фото_1.jpg");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("files/x/clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("files/x/photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("files/x/blob"), "application/octet-stream");
    }

    #[test]
    fn test_mx_player_intent() {
        let intent = mx_player_intent("https://bucket.s3.example.com/files/a.mp4?X-Amz=1", "My Clip");

        assert_eq!(
            intent,
            "intent://bucket.s3.example.com/files/a.mp4?X-Amz=1#Intent;package=com.mxtech.videoplayer.ad;type=video/*;scheme=https;S.title=My%20Clip;end"
        );
    }

    fn local_config() -> S3Config {
        S3Config {
            bucket: "uploads".to_string(),
            region: "us-east-1".to_string(),
            access_key: "minio".to_string(),
            secret_key: "minio-secret".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            force_path_style: true,
            presigned_url_expiry_secs: 3600,
            upload_concurrency: 4,
            multipart_threshold_bytes: 5 * 1024 * 1024,
            part_size_bytes: 5 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_presigned_url_is_signed_locally() {
        let gateway = S3Gateway::new(&local_config()).await.unwrap();

        let url = gateway
            .presigned_url("files/a/clip.mp4", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/uploads/files/a/clip.mp4?"));
        assert!(url.contains("X-Amz-Expires=3600"));
    }

    #[tokio::test]
    async fn test_presigned_url_is_none_when_signing_fails() {
        let gateway = S3Gateway::new(&local_config()).await.unwrap();

        // S3 caps presigned URLs at one week
        let url = gateway
            .presigned_url("files/a/clip.mp4", Duration::from_secs(8 * 24 * 60 * 60))
            .await;

        assert_eq!(url, None);
    }

    /// In-process S3 endpoint covering the calls the gateway makes
    #[derive(Default)]
    struct FakeS3 {
        parts: Mutex<Vec<u32>>,
        completed: Mutex<u32>,
    }

    fn xml(body: &str) -> Response {
        (
            [(header::CONTENT_TYPE, "application/xml")],
            format!(r#"<?xml version="1.0" encoding="UTF-8"?>{}"#, body),
        )
            .into_response()
    }

    async fn fake_s3(
        State(s3): State<Arc<FakeS3>>,
        method: Method,
        Query(query): Query<HashMap<String, String>>,
        _body: Bytes,
    ) -> Response {
        if method == Method::POST && query.contains_key("uploads") {
            return xml(
                r#"<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Bucket>uploads</Bucket><Key>files/x/clip.mp4</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>"#,
            );
        }
        if method == Method::POST && query.contains_key("uploadId") {
            *s3.completed.lock() += 1;
            return xml(
                r#"<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Bucket>uploads</Bucket><Key>files/x/clip.mp4</Key><ETag>"done"</ETag></CompleteMultipartUploadResult>"#,
            );
        }
        if method == Method::PUT {
            if let Some(part) = query.get("partNumber").and_then(|n| n.parse().ok()) {
                s3.parts.lock().push(part);
            }
            return ([(header::ETAG, "\"etag\"")], "").into_response();
        }
        StatusCode::OK.into_response()
    }

    async fn spawn_fake_s3() -> (String, Arc<FakeS3>) {
        let s3 = Arc::new(FakeS3::default());
        let router = Router::new()
            .route("/*path", any(fake_s3))
            .layer(axum::extract::DefaultBodyLimit::disable())
            .with_state(s3.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), s3)
    }

    #[tokio::test]
    async fn test_multipart_upload_reports_progress_per_part() {
        const MB: u64 = 1024 * 1024;
        let (endpoint, s3) = spawn_fake_s3().await;
        let config = S3Config {
            endpoint_url: Some(endpoint),
            upload_concurrency: 1,
            multipart_threshold_bytes: 5 * MB,
            part_size_bytes: 5 * MB as usize,
            ..local_config()
        };
        let gateway = S3Gateway::new(&config).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![7u8; 12 * MB as usize]).unwrap();

        let ticks = Mutex::new(Vec::new());
        let uploaded = gateway
            .upload(&path, "files/x/clip.mp4", &|n: u64| ticks.lock().push(n))
            .await;

        assert!(uploaded);
        assert_eq!(ticks.into_inner(), vec![5 * MB, 10 * MB, 12 * MB]);
        assert_eq!(*s3.parts.lock(), vec![1, 2, 3]);
        assert_eq!(*s3.completed.lock(), 1);
    }

    #[tokio::test]
    async fn test_health_checks_bucket() {
        let (endpoint, _s3) = spawn_fake_s3().await;
        let config = S3Config {
            endpoint_url: Some(endpoint),
            ..local_config()
        };
        let gateway = S3Gateway::new(&config).await.unwrap();

        assert!(gateway.health().await.is_ok());
    }

    /// Gateway that only presigns, recording the requested expiry
    struct PresignOnly {
        url: Option<String>,
        requested: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl ObjectStorageGateway for PresignOnly {
        async fn upload(&self, _: &Path, _: &str, _: &(dyn Fn(u64) + Send + Sync)) -> bool {
            false
        }

        async fn presigned_url(&self, _key: &str, expiry: Duration) -> Option<String> {
            self.requested.lock().push(expiry);
            self.url.clone()
        }

        async fn delete(&self, _key: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_external_player_url_uses_long_expiry() {
        let gateway = PresignOnly {
            url: Some("https://example.com/files/a.mp4".to_string()),
            requested: Mutex::new(Vec::new()),
        };

        let url = gateway.external_player_url("files/a.mp4", "a.mp4").await.unwrap();

        assert!(url.starts_with("intent://example.com/files/a.mp4#Intent;"));
        assert_eq!(*gateway.requested.lock(), vec![PLAYER_URL_EXPIRY]);
    }

    #[tokio::test]
    async fn test_external_player_url_is_none_when_presign_fails() {
        let gateway = PresignOnly {
            url: None,
            requested: Mutex::new(Vec::new()),
        };

        assert_eq!(gateway.external_player_url("files/a.mp4", "a.mp4").await, None);
    }
}
