//! Configuration for the RabbitMQ exporter.
//!
//! Configuration is read from an optional JSON5 file, overlaid with
//! environment variables and then resolved into immutable [`Settings`].
//! Every problem found here is fatal at startup.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rabbitsight_common::{LogFormat, LoggingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::capability::CapabilitySet;
use crate::filter::{EntityFilter, EntityRule};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Failed to read credential file {path}: {source}")]
    CredentialFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid {key} pattern: {source}")]
    InvalidPattern {
        key: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),
    #[error("Unknown exporter: {0}")]
    UnknownExporter(String),
    #[error("Exporter registered twice: {0}")]
    DuplicateExporter(String),
    #[error("Validation error: {0}")]
    Validation(String),
    /// An exporter's upstream is not configured; the exporter is skipped.
    #[error("Exporter {exporter} unavailable: {reason}")]
    Unavailable {
        exporter: &'static str,
        reason: String,
    },
}

/// How the exporter reaches the broker. Only affects the `self` label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Direct,
    LoadBalancer,
}

impl std::str::FromStr for ConnectionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ConnectionMode::Direct),
            "loadbalancer" => Ok(ConnectionMode::LoadBalancer),
            other => Err(ConfigError::Validation(format!(
                "rabbit connection must be direct or loadbalancer, got {:?}",
                other
            ))),
        }
    }
}

/// Raw exporter configuration, as found in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Management API base URL.
    #[serde(default = "default_rabbit_url")]
    pub rabbit_url: String,

    #[serde(default = "default_guest")]
    pub rabbit_user: String,

    #[serde(default = "default_guest")]
    pub rabbit_pass: String,

    /// "direct" or "loadbalancer".
    #[serde(default = "default_connection")]
    pub rabbit_connection: String,

    /// Listen address for the metrics endpoint (empty = all interfaces).
    #[serde(default)]
    pub publish_addr: String,

    #[serde(default = "default_publish_port")]
    pub publish_port: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,

    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,

    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Metric families dropped from the output.
    #[serde(default)]
    pub exclude_metrics: Vec<String>,

    #[serde(default = "default_include")]
    pub include_exchanges: String,

    #[serde(default = "default_skip")]
    pub skip_exchanges: String,

    #[serde(default = "default_include")]
    pub include_queues: String,

    #[serde(default = "default_skip")]
    pub skip_queues: String,

    #[serde(default = "default_include")]
    pub include_vhost: String,

    #[serde(default = "default_skip")]
    pub skip_vhost: String,

    /// Comma separated capability names.
    #[serde(default = "default_capabilities")]
    pub rabbit_capabilities: String,

    #[serde(default = "default_enabled_exporters")]
    pub enabled_exporters: Vec<String>,

    #[serde(default = "default_aliveness_vhost")]
    pub aliveness_vhost: String,

    /// Per-scrape timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum entities per class and fetch (0 = unlimited).
    #[serde(default)]
    pub max_entities: usize,

    #[serde(default)]
    pub resource_id: String,

    #[serde(default)]
    pub service_instance_guid: String,

    #[serde(default)]
    pub service_namespace: String,

    /// Prometheus query API host used by the cpu exporter.
    #[serde(default)]
    pub prometheus_host: String,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_rabbit_url() -> String {
    "http://127.0.0.1:15672".to_string()
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_connection() -> String {
    "direct".to_string()
}

fn default_publish_port() -> String {
    "9419".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("ca.pem")
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("client-cert.pem")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("client-key.pem")
}

fn default_include() -> String {
    EntityRule::DEFAULT_INCLUDE.to_string()
}

fn default_skip() -> String {
    EntityRule::DEFAULT_EXCLUDE.to_string()
}

fn default_capabilities() -> String {
    "no_sort,bert".to_string()
}

fn default_enabled_exporters() -> Vec<String> {
    ["exchange", "node", "overview", "queue", "cpu"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_aliveness_vhost() -> String {
    "/".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_prometheus_port() -> String {
    "9090".to_string()
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            rabbit_url: default_rabbit_url(),
            rabbit_user: default_guest(),
            rabbit_pass: default_guest(),
            rabbit_connection: default_connection(),
            publish_addr: String::new(),
            publish_port: default_publish_port(),
            metrics_path: default_metrics_path(),
            ca_file: default_ca_file(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            insecure_skip_verify: false,
            exclude_metrics: Vec::new(),
            include_exchanges: default_include(),
            skip_exchanges: default_skip(),
            include_queues: default_include(),
            skip_queues: default_skip(),
            include_vhost: default_include(),
            skip_vhost: default_skip(),
            rabbit_capabilities: default_capabilities(),
            enabled_exporters: default_enabled_exporters(),
            aliveness_vhost: default_aliveness_vhost(),
            timeout: default_timeout(),
            max_entities: 0,
            resource_id: String::new(),
            service_instance_guid: String::new(),
            service_namespace: String::new(),
            prometheus_host: String::new(),
            prometheus_port: default_prometheus_port(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Split a comma separated list, dropping blank entries.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn read_secret(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| ConfigError::CredentialFile {
            path: path.to_path_buf(),
            source,
        })
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay values from an environment lookup function.
    ///
    /// Empty variables are treated as unset. `*_FILE` variants of the
    /// credentials take precedence over the plain variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("RABBIT_URL") {
            self.rabbit_url = v;
        }
        if let Some(v) = get("RABBIT_CONNECTION") {
            self.rabbit_connection = v;
        }

        if let Some(path) = get("RABBIT_USER_FILE") {
            self.rabbit_user = read_secret(Path::new(&path))?;
        } else if let Some(v) = get("RABBIT_USER") {
            self.rabbit_user = v;
        }
        if let Some(path) = get("RABBIT_PASSWORD_FILE") {
            self.rabbit_pass = read_secret(Path::new(&path))?;
        } else if let Some(v) = get("RABBIT_PASSWORD") {
            self.rabbit_pass = v;
        }

        if let Some(v) = get("PUBLISH_PORT") {
            self.publish_port = v;
        }
        if let Some(v) = get("PUBLISH_ADDR") {
            self.publish_addr = v;
        }
        if let Some(v) = get("METRICS_PATH") {
            self.metrics_path = v;
        }
        if let Some(v) = get("OUTPUT_FORMAT") {
            self.logging.format = LogFormat::from_output_format(&v).ok_or_else(|| {
                ConfigError::Validation(format!("output format must be TTY or JSON, got {:?}", v))
            })?;
        }

        if let Some(v) = get("CAFILE") {
            self.ca_file = PathBuf::from(v);
        }
        if let Some(v) = get("CERTFILE") {
            self.cert_file = PathBuf::from(v);
        }
        if let Some(v) = get("KEYFILE") {
            self.key_file = PathBuf::from(v);
        }
        if let Some(v) = get("SKIPVERIFY") {
            self.insecure_skip_verify = matches!(v.as_str(), "true" | "1" | "TRUE");
        }

        if let Some(v) = get("EXCLUDE_METRICS") {
            self.exclude_metrics = split_list(&v);
        }

        let patterns: [(&str, &mut String); 6] = [
            ("SKIP_EXCHANGES", &mut self.skip_exchanges),
            ("INCLUDE_EXCHANGES", &mut self.include_exchanges),
            ("SKIP_QUEUES", &mut self.skip_queues),
            ("INCLUDE_QUEUES", &mut self.include_queues),
            ("SKIP_VHOST", &mut self.skip_vhost),
            ("INCLUDE_VHOST", &mut self.include_vhost),
        ];
        for (key, slot) in patterns {
            if let Some(v) = get(key) {
                *slot = v;
            }
        }

        if let Some(v) = get("RABBIT_CAPABILITIES") {
            self.rabbit_capabilities = v;
        }
        if let Some(v) = get("RABBIT_EXPORTERS") {
            self.enabled_exporters = split_list(&v);
        }
        if let Some(v) = get("ALIVENESS_VHOST") {
            self.aliveness_vhost = v;
        }

        if let Some(v) = get("RABBIT_TIMEOUT") {
            self.timeout = v.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("timeout is not a number: {:?}", v))
            })?;
        }
        if let Some(v) = get("MAX_QUEUES") {
            self.max_entities = v.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("max queues is not a number: {:?}", v))
            })?;
        }

        if let Some(v) = get("RESOURCE_ID") {
            self.resource_id = v;
        }
        if let Some(v) = get("SERVICE_INSTANCE_GUID") {
            self.service_instance_guid = v;
        }
        if let Some(v) = get("SERVICE_NAMESPACE") {
            self.service_namespace = v;
        }
        if let Some(v) = get("PROMETHEUS_HOST") {
            self.prometheus_host = v;
        }
        if let Some(v) = get("PROMETHEUS_PORT") {
            self.prometheus_port = v;
        }

        Ok(())
    }

    /// Validate and compile the configuration.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let rabbit_url = Url::parse(&self.rabbit_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "rabbit URL must start with http:// or https://, got {:?}",
                    self.rabbit_url
                ))
            })?;

        let connection: ConnectionMode = self.rabbit_connection.parse()?;

        let port: u16 = self.publish_port.trim().parse().map_err(|_| {
            ConfigError::Validation(format!(
                "the configured port is not a valid number: {:?}",
                self.publish_port
            ))
        })?;
        let listen = listen_addr(&self.publish_addr, port)?;

        if !self.metrics_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.timeout == 0 {
            return Err(ConfigError::Validation("timeout must be > 0".to_string()));
        }

        if self.enabled_exporters.is_empty() {
            return Err(ConfigError::Validation(
                "at least one exporter must be enabled".to_string(),
            ));
        }

        let rule = |key: &'static str, include: &str, exclude: &str| {
            EntityRule::new(include, exclude)
                .map_err(|source| ConfigError::InvalidPattern { key, source })
        };
        let filter = EntityFilter::new(
            rule("exchange", &self.include_exchanges, &self.skip_exchanges)?,
            rule("queue", &self.include_queues, &self.skip_queues)?,
            rule("vhost", &self.include_vhost, &self.skip_vhost)?,
            self.max_entities,
        );

        let capabilities = CapabilitySet::parse(&self.rabbit_capabilities)?;

        let prometheus = if self.prometheus_host.is_empty() {
            None
        } else {
            let port: u16 = self.prometheus_port.trim().parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "prometheus port is not a valid number: {:?}",
                    self.prometheus_port
                ))
            })?;
            let url = Url::parse(&format!("http://{}:{}", self.prometheus_host, port))
                .map_err(|e| ConfigError::Validation(format!("invalid prometheus host: {}", e)))?;
            Some(url)
        };

        Ok(Settings {
            rabbit_url,
            credentials: Credentials {
                username: self.rabbit_user,
                password: self.rabbit_pass,
            },
            connection,
            listen,
            metrics_path: self.metrics_path,
            tls: TlsConfig {
                ca_file: self.ca_file,
                cert_file: self.cert_file,
                key_file: self.key_file,
                insecure_skip_verify: self.insecure_skip_verify,
            },
            exclude_metrics: self.exclude_metrics.into_iter().collect(),
            filter,
            capabilities,
            enabled_exporters: self.enabled_exporters,
            aliveness_vhost: self.aliveness_vhost,
            timeout: Duration::from_secs(self.timeout),
            cpu: CpuTarget {
                resource_id: self.resource_id,
                instance_guid: self.service_instance_guid,
                namespace: self.service_namespace,
            },
            prometheus,
            logging: self.logging,
        })
    }
}

/// Resolve the listen address. Host names are looked up once at startup.
fn listen_addr(addr: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let host = match addr.trim() {
        "" => "0.0.0.0",
        a => a.trim_start_matches('[').trim_end_matches(']'),
    };
    let invalid = |reason: String| {
        ConfigError::Validation(format!("Invalid listen address {}:{}: {}", host, port, reason))
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host name resolved to no addresses".to_string()))
}

/// Basic-auth credentials for the management API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Client certificate material for HTTPS management URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub insecure_skip_verify: bool,
}

/// Identifiers templated into the cpu utilization query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTarget {
    pub resource_id: String,
    pub instance_guid: String,
    pub namespace: String,
}

/// Resolved, immutable settings shared by every scrape.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rabbit_url: Url,
    pub credentials: Credentials,
    pub connection: ConnectionMode,
    pub listen: SocketAddr,
    pub metrics_path: String,
    pub tls: TlsConfig,
    pub exclude_metrics: HashSet<String>,
    pub filter: EntityFilter,
    pub capabilities: CapabilitySet,
    pub enabled_exporters: Vec<String>,
    pub aliveness_vhost: String,
    pub timeout: Duration,
    pub cpu: CpuTarget,
    /// Prometheus query API base URL, when configured.
    pub prometheus: Option<Url>,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Settings built from defaults only.
    pub fn from_defaults() -> Result<Self, ConfigError> {
        ExporterConfig::default().resolve()
    }
}
