use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level poller configuration document.
///
/// The document is produced and merged by external tooling; this module
/// only deserializes it and validates the parts the core consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "Exporters", default)]
    pub exporters: HashMap<String, ExporterConfig>,
    #[serde(rename = "Pollers", default)]
    pub pollers: HashMap<String, PollerConfig>,
    #[serde(rename = "Admin", default)]
    pub admin: AdminConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poller_named(&self, name: &str) -> Result<&PollerConfig> {
        self.pollers
            .get(name)
            .ok_or_else(|| Error::Config(format!("poller {name:?} not defined")))
    }

    /// Startup validation of the parts the core depends on. Exporter
    /// references must resolve and each exporter block must be usable.
    pub fn validate(&self) -> Result<()> {
        for (name, exporter) in &self.exporters {
            exporter.validate(name)?;
        }
        for (poller_name, poller) in &self.pollers {
            for exporter in &poller.exporters {
                if !self.exporters.contains_key(exporter) {
                    return Err(Error::Config(format!(
                        "poller {poller_name:?} references unknown exporter {exporter:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    #[default]
    BasicAuth,
    CertificateAuth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub path: String,
    #[serde(default = "default_script_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderMode {
    Record,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub path: String,
    pub mode: RecorderMode,
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

/// One remote cluster observed by this process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub auth_style: AuthStyle,
    pub ca_cert: Option<String>,
    pub certificate_script: Option<ScriptConfig>,
    /// Outbound call bound in seconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default)]
    pub collectors: Vec<CollectorRequest>,
    pub credentials_file: Option<String>,
    pub credentials_script: Option<ScriptConfig>,
    pub datacenter: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub exporters: Vec<String>,
    /// Extra global labels, a list of single-entry maps so order is kept.
    #[serde(default)]
    pub labels: Vec<HashMap<String, String>>,
    /// Collector classes that log verbosely.
    #[serde(default)]
    pub log: Vec<String>,
    pub log_max_bytes: Option<u64>,
    pub log_max_files: Option<u32>,
    pub password: Option<String>,
    #[serde(default)]
    pub prefer_zapi: bool,
    pub prom_port: Option<u16>,
    pub recorder: Option<RecorderConfig>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub tls_min_version: Option<String>,
    #[serde(default)]
    pub use_insecure_tls: bool,
    pub username: Option<String>,
    #[serde(default)]
    pub is_kfs: bool,
}

impl PollerConfig {
    /// Global labels in declaration order: datacenter first, then the
    /// configured label list.
    pub fn global_labels(&self) -> Vec<(String, String)> {
        let mut labels = Vec::new();
        if let Some(dc) = &self.datacenter {
            labels.push(("datacenter".to_string(), dc.clone()));
        }
        for entry in &self.labels {
            for (k, v) in entry {
                labels.push((k.clone(), v.clone()));
            }
        }
        labels
    }
}

/// A collector request: either a bare class name or a class with an
/// explicit object list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CollectorRequest {
    Class(String),
    WithObjects(HashMap<String, Vec<String>>),
}

impl CollectorRequest {
    pub fn class(&self) -> &str {
        match self {
            CollectorRequest::Class(name) => name,
            CollectorRequest::WithObjects(map) => {
                map.keys().next().map(String::as_str).unwrap_or("")
            }
        }
    }

    pub fn objects(&self) -> &[String] {
        match self {
            CollectorRequest::Class(_) => &[],
            CollectorRequest::WithObjects(map) => {
                map.values().next().map(Vec::as_slice).unwrap_or(&[])
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "exporter")]
pub enum ExporterConfig {
    #[serde(rename = "Prometheus")]
    Prometheus(PromConfig),
    #[serde(rename = "InfluxDB")]
    Influx(InfluxConfig),
}

impl ExporterConfig {
    fn validate(&self, name: &str) -> Result<()> {
        match self {
            ExporterConfig::Prometheus(prom) => prom.validate(name),
            ExporterConfig::Influx(influx) => influx.validate(name),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromConfig {
    pub port: Option<u16>,
    /// Inclusive range `"start-end"` scanned for a free port when no
    /// per-poller override is set.
    pub port_range: Option<String>,
    #[serde(default = "default_local_http_addr")]
    pub local_http_addr: String,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub add_meta_tags: bool,
    #[serde(default)]
    pub sort_labels: bool,
    #[serde(default)]
    pub allow_addrs_regex: Vec<String>,
}

impl PromConfig {
    pub fn port_range_bounds(&self) -> Result<Option<(u16, u16)>> {
        let Some(range) = &self.port_range else {
            return Ok(None);
        };
        let parsed = range
            .split_once('-')
            .and_then(|(lo, hi)| Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)));
        match parsed {
            Some((lo, hi)) if lo <= hi => Ok(Some((lo, hi))),
            _ => Err(Error::Config(format!(
                "invalid port_range {range:?}, expected \"start-end\""
            ))),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        self.port_range_bounds()
            .map_err(|e| Error::Config(format!("exporter {name:?}: {e}")))?;
        match self.local_http_addr.as_str() {
            "" | "0.0.0.0" | "localhost" | "127.0.0.1" => Ok(()),
            other => Err(Error::Config(format!(
                "exporter {name:?}: unsupported local_http_addr {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfluxConfig {
    pub url: Option<String>,
    pub addr: Option<String>,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allow_addrs_regex: Vec<String>,
}

impl InfluxConfig {
    /// The write endpoint. Exactly one of `url` and `addr` must be set;
    /// supplying both is rejected rather than silently preferring one.
    pub fn endpoint_url(&self) -> Result<String> {
        match (&self.url, &self.addr) {
            (Some(_), Some(_)) => Err(Error::Config(
                "influx exporter: both url and addr are set, configure exactly one".to_string(),
            )),
            (None, None) => Err(Error::Config(
                "influx exporter: one of url or addr is required".to_string(),
            )),
            (Some(url), None) => Ok(url.clone()),
            (None, Some(addr)) => Ok(format!(
                "https://{addr}:8086/api/v2/write?org={}&bucket={}",
                self.org, self.bucket
            )),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        self.endpoint_url()
            .map(|_| ())
            .map_err(|e| Error::Config(format!("exporter {name:?}: {e}")))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    pub httpsd: Option<HttpsdConfig>,
}

/// Service-discovery endpoint served by the external admin program. The
/// core derives its publish URL from `listen` and `tls`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpsdConfig {
    pub listen: String,
    pub auth_basic: Option<BasicAuthConfig>,
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_heart_beat")]
    pub heart_beat: u64,
    #[serde(default = "default_expire_after")]
    pub expire_after: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

/// Credentials resolved for one poller. Password files, scripts and
/// certificate material are resolved by external collaborators; the core
/// consumes the end result.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub auth_style: AuthStyle,
    pub username: String,
    pub password: String,
    pub ca_cert: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
}

impl Credentials {
    pub fn from_poller(poller: &PollerConfig) -> Result<Self> {
        let credentials = Credentials {
            auth_style: poller.auth_style,
            username: poller.username.clone().unwrap_or_default(),
            password: poller.password.clone().unwrap_or_default(),
            ca_cert: poller.ca_cert.clone(),
            ssl_cert: poller.ssl_cert.clone(),
            ssl_key: poller.ssl_key.clone(),
        };
        match credentials.auth_style {
            AuthStyle::BasicAuth if credentials.username.is_empty() => Err(Error::Auth(
                "basic_auth requires a username".to_string(),
            )),
            AuthStyle::CertificateAuth
                if credentials.ssl_cert.is_none() || credentials.ssl_key.is_none() =>
            {
                Err(Error::Auth(
                    "certificate_auth requires ssl_cert and ssl_key".to_string(),
                ))
            }
            _ => Ok(credentials),
        }
    }
}

fn default_client_timeout() -> u64 {
    30
}

fn default_script_timeout() -> u64 {
    10
}

fn default_keep_last() -> usize {
    60
}

fn default_local_http_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_heart_beat() -> u64 {
    45
}

fn default_expire_after() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
Exporters:
  prom:
    exporter: Prometheus
    port_range: 12990-13010
    add_meta_tags: true
  influx:
    exporter: InfluxDB
    addr: influx.example.com
    org: metrics
    bucket: default
    token: t0k3n
Pollers:
  cluster-01:
    addr: 10.0.1.1
    username: admin
    password: secret
    datacenter: rtp
    labels:
      - org: abc
      - site: RTP
    collectors:
      - Rest
      - ZapiPerf:
          - Volume
    exporters:
      - prom
Admin:
  httpsd:
    listen: :8118
"#;

    #[test]
    fn full_document_deserializes() {
        let config: Config = serde_yaml::from_str(DOC).unwrap();
        config.validate().unwrap();

        let poller = config.poller_named("cluster-01").unwrap();
        assert_eq!(poller.addr, "10.0.1.1");
        assert_eq!(poller.client_timeout, 30);
        assert_eq!(poller.collectors.len(), 2);
        assert_eq!(poller.collectors[0].class(), "Rest");
        assert_eq!(poller.collectors[1].class(), "ZapiPerf");
        assert_eq!(poller.collectors[1].objects(), ["Volume".to_string()]);

        let labels = poller.global_labels();
        assert_eq!(
            labels,
            vec![
                ("datacenter".to_string(), "rtp".to_string()),
                ("org".to_string(), "abc".to_string()),
                ("site".to_string(), "RTP".to_string()),
            ]
        );

        assert_eq!(config.admin.httpsd.unwrap().heart_beat, 45);
    }

    #[test]
    fn unknown_exporter_reference_is_config_error() {
        let doc = r#"
Pollers:
  p1:
    addr: 1.2.3.4
    exporters: [nope]
"#;
        let config: Config = serde_yaml::from_str(doc).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn port_range_bounds_parse_and_reject() {
        let prom = PromConfig {
            port_range: Some("2000-2030".to_string()),
            ..PromConfig::default()
        };
        assert_eq!(prom.port_range_bounds().unwrap(), Some((2000, 2030)));

        let bad = PromConfig {
            port_range: Some("2030-2000".to_string()),
            ..PromConfig::default()
        };
        assert!(bad.port_range_bounds().is_err());
    }

    #[test]
    fn influx_url_and_addr_are_mutually_exclusive() {
        let both = InfluxConfig {
            url: Some("https://example.com/write".to_string()),
            addr: Some("example.com".to_string()),
            ..InfluxConfig::default()
        };
        assert!(matches!(both.endpoint_url(), Err(Error::Config(_))));

        let neither = InfluxConfig::default();
        assert!(neither.endpoint_url().is_err());

        let addr_only = InfluxConfig {
            addr: Some("influx.example.com".to_string()),
            org: "metrics".to_string(),
            bucket: "default".to_string(),
            ..InfluxConfig::default()
        };
        assert_eq!(
            addr_only.endpoint_url().unwrap(),
            "https://influx.example.com:8086/api/v2/write?org=metrics&bucket=default"
        );
    }

    #[test]
    fn certificate_auth_requires_key_material() {
        let poller = PollerConfig {
            auth_style: AuthStyle::CertificateAuth,
            ..PollerConfig::default()
        };
        assert!(matches!(
            Credentials::from_poller(&poller),
            Err(Error::Auth(_))
        ));
    }
}
