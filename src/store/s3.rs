use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{
    BehaviorVersion, Builder, Credentials, Region, RequestChecksumCalculation,
    ResponseChecksumValidation,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{KEY_SEPARATOR, ObjectEntry, ObjectStore, StoreError, StoreResult, partial_path};
use crate::config::StoreConfig;

const CREDENTIALS_PROVIDER: &str = "bucketsync";

/// Object store speaking the S3 API, as served by MinIO.
///
/// Requests use path-style addressing (`<endpoint>/<bucket>/<key>`) and only
/// send checksums when an operation requires them, which keeps older MinIO
/// releases happy.
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
}

/// Full endpoint URL; a bare `host:port` gets a scheme from `secure`.
pub fn endpoint_url(endpoint: &str, secure: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if secure {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

impl S3ObjectStore {
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| StoreError::Config("store.endpoint is not set".to_string()))?;
        let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) else {
            return Err(StoreError::Config(
                "store.access_key and store.secret_key must both be set".to_string(),
            ));
        };

        let endpoint = endpoint_url(endpoint, config.secure);
        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                CREDENTIALS_PROVIDER,
            ));

        if config.skip_tls_verify {
            warn!(endpoint = %endpoint, "TLS certificate verification is disabled");
            let connector = hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(accept_any_certificate())
                .https_or_http()
                .enable_http1()
                .build();
            builder = builder.http_client(HyperClientBuilder::new().build(connector));
        }

        debug!(endpoint = %endpoint, region = %config.region, "Configured S3 client");
        Ok(Self {
            client: Client::from_conf(builder.build()),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectEntry>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut entries = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| remote_error("list", bucket, prefix, e))?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                entries.push(ObjectEntry {
                    key: key.to_string(),
                    is_dir_marker: key.ends_with(KEY_SEPARATOR) && object.size().unwrap_or(0) == 0,
                });
            }
        }

        debug!(bucket, prefix, count = entries.len(), "Listed objects");
        Ok(entries)
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> StoreResult<()> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("get", bucket, key, e))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        let partial = partial_path(local_path)?;
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| StoreError::io("create", &partial, e))?;
        let mut body = object.body.into_async_read();

        let written = match tokio::io::copy(&mut body, &mut file).await {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(StoreError::io("download", local_path, e));
            }
        };
        file.flush()
            .await
            .map_err(|e| StoreError::io("flush", &partial, e))?;
        drop(file);

        tokio::fs::rename(&partial, local_path)
            .await
            .map_err(|e| StoreError::io("rename", local_path, e))?;
        debug!(bucket, key, bytes = written, "Fetched object");
        Ok(())
    }

    async fn put(&self, bucket: &str, local_path: &Path, key: &str) -> StoreResult<()> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            StoreError::io("read", local_path, std::io::Error::other(e.to_string()))
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| remote_error("put", bucket, key, e))?;
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(remote_error("head bucket", bucket, "", e)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BucketAlreadyOwnedByYou") => Ok(()),
            Err(e) => Err(remote_error("create bucket", bucket, "", e)),
        }
    }
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn remote_error<E>(
    operation: &'static str,
    bucket: &str,
    key: &str,
    err: SdkError<E, HttpResponse>,
) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.code() {
        Some("NoSuchBucket") => return StoreError::NoSuchBucket(bucket.to_string()),
        Some("NoSuchKey") => {
            return StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            };
        }
        _ => {}
    }

    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return StoreError::Unavailable(DisplayErrorContext(&err).to_string());
    }

    StoreError::Remote {
        operation,
        target: format!("{}/{}", bucket, key),
        message: DisplayErrorContext(&err).to_string(),
    }
}

/// Trusts every server certificate. Only used when `skip_tls_verify` is set.
struct AcceptAnyCertificate;

impl rustls::client::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn accept_any_certificate() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn s3_config() -> StoreConfig {
        let mut config = AppConfig::default().store;
        config.endpoint = Some("minio.storage:9000".to_string());
        config.access_key = Some("admin".to_string());
        config.secret_key = Some("secret-key".to_string());
        config
    }

    #[test]
    fn test_endpoint_scheme_follows_secure_flag() {
        assert_eq!(endpoint_url("minio:9000", false), "http://minio:9000");
        assert_eq!(endpoint_url("minio:9000/", true), "https://minio:9000");
        assert_eq!(endpoint_url("https://minio:9000", false), "https://minio:9000");
    }

    #[tokio::test]
    async fn test_from_config_builds_endpoint() {
        let mut config = s3_config();
        config.secure = true;
        let store = S3ObjectStore::from_config(&config).unwrap();
        assert_eq!(store.endpoint(), "https://minio.storage:9000");
    }

    #[tokio::test]
    async fn test_skip_tls_verify_builds_client() {
        let mut config = s3_config();
        config.secure = true;
        config.skip_tls_verify = true;
        assert!(S3ObjectStore::from_config(&config).is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = s3_config();
        config.secret_key = None;
        assert!(matches!(
            S3ObjectStore::from_config(&config),
            Err(StoreError::Config(_))
        ));
    }
}
