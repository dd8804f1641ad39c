use super::{StatusError, StatusResult, StatusSink};
use async_trait::async_trait;
use reqwest::{Certificate, Method, StatusCode, header};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MERGE_PATCH: &str = "application/merge-patch+json";

enum Auth {
    None,
    Bearer(String),
    /// Projected tokens rotate, so the file is re-read on every request.
    ServiceAccount(PathBuf),
}

/// Stores progress as the `data` of a ConfigMap.
///
/// An upsert is a JSON merge patch; if the ConfigMap does not exist yet it
/// is created, and a create that loses a race to another writer falls back
/// to patching once more.
pub struct KubernetesStatusSink {
    base_url: String,
    client: reqwest::Client,
    auth: Auth,
}

impl KubernetesStatusSink {
    /// Connect to the API server from inside a pod using its service account.
    pub fn in_cluster(timeout: Duration) -> StatusResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| StatusError::Config("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        let sa_dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let ca_path = sa_dir.join("ca.crt");
        let ca = std::fs::read(&ca_path).map_err(|source| StatusError::Io {
            path: ca_path.display().to_string(),
            source,
        })?;

        let client = reqwest::Client::builder()
            .add_root_certificate(Certificate::from_pem(&ca)?)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: format!("https://{}:{}", host, port),
            client,
            auth: Auth::ServiceAccount(sa_dir.join("token")),
        })
    }

    /// Talk to an explicit API endpoint, e.g. through `kubectl proxy`.
    pub fn with_base_url(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> StatusResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            auth: token.map_or(Auth::None, Auth::Bearer),
        })
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/configmaps", self.base_url, namespace)
    }

    async fn token(&self) -> StatusResult<Option<String>> {
        match &self.auth {
            Auth::None => Ok(None),
            Auth::Bearer(token) => Ok(Some(token.clone())),
            Auth::ServiceAccount(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| Some(t.trim().to_string()))
                .map_err(|source| StatusError::Io {
                    path: path.display().to_string(),
                    source,
                }),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        content_type: &str,
        body: &Value,
    ) -> StatusResult<(StatusCode, String)> {
        let mut request = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT, "application/json")
            .body(serde_json::to_vec(body)?);

        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> StatusResult<StatusCode> {
        let url = format!("{}/{}", self.collection_url(namespace), name);
        let (status, body) = self
            .send(Method::PATCH, url, MERGE_PATCH, &json!({ "data": fields }))
            .await?;

        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        Err(rejected("patch", namespace, name, status, body))
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> StatusResult<StatusCode> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": fields,
        });
        let (status, text) = self
            .send(Method::POST, self.collection_url(namespace), "application/json", &body)
            .await?;

        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(status);
        }
        Err(rejected("create", namespace, name, status, text))
    }
}

fn rejected(
    operation: &'static str,
    namespace: &str,
    name: &str,
    status: StatusCode,
    body: String,
) -> StatusError {
    StatusError::Rejected {
        operation,
        namespace: namespace.to_string(),
        name: name.to_string(),
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl StatusSink for KubernetesStatusSink {
    async fn upsert(
        &self,
        namespace: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> StatusResult<()> {
        if self.patch(namespace, name, fields).await? != StatusCode::NOT_FOUND {
            debug!(namespace, configmap = name, "Updated ConfigMap");
            return Ok(());
        }

        if self.create(namespace, name, fields).await? != StatusCode::CONFLICT {
            info!(namespace, configmap = name, "Created ConfigMap");
            return Ok(());
        }

        // Someone else created it between our patch and create.
        if self.patch(namespace, name, fields).await? == StatusCode::NOT_FOUND {
            return Err(rejected(
                "patch",
                namespace,
                name,
                StatusCode::NOT_FOUND,
                "ConfigMap vanished after create conflict".to_string(),
            ));
        }
        Ok(())
    }
}
