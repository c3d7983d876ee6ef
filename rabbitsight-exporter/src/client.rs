//! HTTP client for the RabbitMQ management API and the Prometheus query API.

use std::collections::BTreeMap;
use std::time::Duration;

use rabbitsight_common::Scalar;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Certificate, Identity, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::bert;
use crate::config::{Credentials, TlsConfig};

/// Path of the Prometheus instant query endpoint.
pub const QUERY_PATH: &str = "/api/v1/query";

/// Encoding requested from the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Json,
    Bert,
}

impl WireFormat {
    fn accept(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Bert => "application/bert",
        }
    }

    /// Format of a response body, judged by its `Content-Type`.
    ///
    /// Brokers and proxies may ignore `Accept`, so anything not declared as
    /// BERT is decoded as JSON.
    fn of_content_type(content_type: Option<&str>) -> Self {
        let mime = content_type
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .unwrap_or_default();
        if mime.eq_ignore_ascii_case("application/bert") {
            WireFormat::Bert
        } else {
            WireFormat::Json
        }
    }
}

/// Upstream request failures.
///
/// The three runtime kinds stay distinct so exporters can decide what to
/// skip and what to propagate.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response was received (connection refused, timeout, TLS failure).
    #[error("no response from {url}: {source}")]
    NoResponse {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A response arrived with a non-success status; the body is not read.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    /// The body was not valid JSON/BERT or did not have the expected shape.
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    NoResponse,
    Status,
    Decode,
    Build,
}

impl ClientError {
    pub fn kind(&self) -> ClientErrorKind {
        match self {
            ClientError::NoResponse { .. } => ClientErrorKind::NoResponse,
            ClientError::Status { .. } => ClientErrorKind::Status,
            ClientError::Decode { .. } => ClientErrorKind::Decode,
            ClientError::Build(_) => ClientErrorKind::Build,
        }
    }
}

/// Prometheus instant query envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: QueryData,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryData {
    #[serde(default, rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<QueryResult>,
}

/// One row of an instant vector: labels plus a `[timestamp, value]` pair.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub value: Vec<Scalar>,
}

impl QueryResult {
    /// The sample value, i.e. the second element of `value`.
    pub fn sample(&self) -> Option<&Scalar> {
        self.value.get(1)
    }
}

/// Builder for [`UpstreamClient`].
#[derive(Debug, Clone)]
pub struct UpstreamClientBuilder {
    base: Url,
    credentials: Option<Credentials>,
    format: WireFormat,
    timeout: Option<Duration>,
    tls: Option<TlsConfig>,
}

impl UpstreamClientBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Certificate material, applied only to `https` base URLs.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<UpstreamClient, ClientError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        if self.base.scheme() == "https" {
            if let Some(tls) = &self.tls {
                builder = apply_tls(builder, tls)?;
            }
        }

        let http = builder
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        Ok(UpstreamClient {
            http,
            base: self.base,
            credentials: self.credentials,
            format: self.format,
        })
    }
}

fn read_pem(path: &std::path::Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|e| ClientError::Build(format!("{}: {}", path.display(), e)))
}

/// Certificate files are optional; missing files are skipped.
fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsConfig,
) -> Result<reqwest::ClientBuilder, ClientError> {
    if tls.ca_file.exists() {
        let pem = read_pem(&tls.ca_file)?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| ClientError::Build(format!("invalid CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(cert);
        debug!(path = %tls.ca_file.display(), "Loaded CA certificate");
    }

    if tls.cert_file.exists() && tls.key_file.exists() {
        let mut pem = read_pem(&tls.cert_file)?;
        pem.push(b'\n');
        pem.extend(read_pem(&tls.key_file)?);
        let identity = Identity::from_pem(&pem)
            .map_err(|e| ClientError::Build(format!("invalid client certificate: {}", e)))?;
        builder = builder.identity(identity);
        debug!(path = %tls.cert_file.display(), "Loaded client certificate");
    }

    Ok(builder.danger_accept_invalid_certs(tls.insecure_skip_verify))
}

/// A reusable HTTP client bound to one upstream base URL.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: Url,
    credentials: Option<Credentials>,
    format: WireFormat,
}

impl UpstreamClient {
    pub fn builder(base: Url) -> UpstreamClientBuilder {
        UpstreamClientBuilder {
            base,
            credentials: None,
            format: WireFormat::Json,
            timeout: None,
            tls: None,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Join `path` onto the base URL, keeping any base path prefix.
    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }

    /// Issue one request and decode the body into a generic value.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let url = self.url(path);

        let mut request = self
            .http
            .request(method, url.clone())
            .header(ACCEPT, self.format.accept());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .map_err(|source| ClientError::NoResponse {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
            });
        }

        let format = WireFormat::of_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response
            .bytes()
            .await
            .map_err(|source| ClientError::NoResponse {
                url: url.to_string(),
                source,
            })?;

        trace!(url = %url, bytes = body.len(), ?format, "Upstream response received");

        match format {
            WireFormat::Json => serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            }),
            WireFormat::Bert => bert::decode(&body).map_err(|e| ClientError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// GET `path` and decode the result into `T`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let value = self.execute(Method::GET, path, query).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode {
            url: self.url(path).to_string(),
            message: e.to_string(),
        })
    }

    /// Run a Prometheus instant query.
    pub async fn query(&self, expr: &str) -> Result<QueryResponse, ClientError> {
        self.get(QUERY_PATH, &[("query", expr)]).await
    }
}
