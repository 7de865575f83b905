//! Pull exporter: renders published matrices into an in-memory cache
//! and serves them over HTTP. Scrapes never touch collector state; the
//! cache is replaced under a short write lock when a collector exports.

use crate::render::{render_matrix, RenderOptions};
use crate::Exporter;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use oxpoll_common::config::PromConfig;
use oxpoll_common::error::{Error, Result};
use oxpoll_matrix::Matrix;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// Bound when neither an override nor a port range yields a socket.
pub const DEFAULT_PROM_PORT: u16 = 12990;

#[derive(Debug)]
struct Rendered {
    object: String,
    lines: Vec<String>,
}

pub struct PromExporter {
    name: String,
    render: RenderOptions,
    allow_addrs: Vec<Regex>,
    cache: RwLock<BTreeMap<String, Rendered>>,
}

impl PromExporter {
    pub fn new(name: impl Into<String>, config: &PromConfig) -> Result<Self> {
        let allow_addrs = config
            .allow_addrs_regex
            .iter()
            .map(|raw| {
                Regex::new(raw)
                    .map_err(|e| Error::Config(format!("allow_addrs_regex {raw:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PromExporter {
            name: name.into(),
            render: RenderOptions {
                sort_labels: config.sort_labels,
                add_meta_tags: config.add_meta_tags,
            },
            allow_addrs,
            cache: RwLock::new(BTreeMap::new()),
        })
    }

    /// Picks the listen socket: per-poller override first, then the first
    /// free port of the configured range, then the fixed fallback.
    pub fn allocate_listener(
        config: &PromConfig,
        override_port: Option<u16>,
    ) -> Result<(TcpListener, u16)> {
        let host = match config.local_http_addr.as_str() {
            "" => "0.0.0.0".to_string(),
            other => other.to_string(),
        };

        let candidates: Vec<u16> = if let Some(port) = override_port.or(config.port) {
            vec![port]
        } else if let Some((lo, hi)) = config.port_range_bounds()? {
            (lo..=hi).collect()
        } else {
            vec![DEFAULT_PROM_PORT]
        };

        for port in &candidates {
            if let Ok(listener) = TcpListener::bind((host.as_str(), *port)) {
                listener.set_nonblocking(true)?;
                return Ok((listener, *port));
            }
        }
        Err(Error::Config(format!(
            "no free scrape port among {candidates:?} on {host}"
        )))
    }

    /// Whether a peer address passes the allow-list. An empty list
    /// allows everyone.
    pub fn addr_allowed(&self, ip: IpAddr) -> bool {
        if self.allow_addrs.is_empty() {
            return true;
        }
        let ip = ip.to_string();
        self.allow_addrs.iter().any(|re| re.is_match(&ip))
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let router = Router::new()
            .route("/", get(index))
            .route("/metrics", get(all_series))
            .route("/health", get(health))
            .route("/{object}", get(object_series))
            .with_state(self);

        let listener = tokio::net::TcpListener::from_std(listener)?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::Transient(format!("scrape listener: {e}")))
    }

    fn dump(&self, object: Option<&str>) -> String {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        let mut body = String::new();
        for rendered in cache.values() {
            if object.is_some_and(|o| o != rendered.object) {
                continue;
            }
            for line in &rendered.lines {
                body.push_str(line);
                body.push('\n');
            }
        }
        body
    }

    fn objects(&self) -> Vec<String> {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        let mut objects: Vec<String> = cache.values().map(|r| r.object.clone()).collect();
        objects.sort();
        objects.dedup();
        objects
    }
}

#[async_trait]
impl Exporter for PromExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, matrices: &[Matrix]) -> Result<()> {
        let rendered: Vec<(String, Rendered)> = matrices
            .iter()
            .map(|m| {
                (
                    m.uuid().to_string(),
                    Rendered {
                        object: m.object().to_string(),
                        lines: render_matrix(m, &self.render),
                    },
                )
            })
            .collect();

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        for (uuid, entry) in rendered {
            cache.insert(uuid, entry);
        }
        Ok(())
    }
}

fn trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn reject_or<F>(exporter: &PromExporter, peer: SocketAddr, allowed: F) -> Response
where
    F: FnOnce() -> Response,
{
    if exporter.addr_allowed(peer.ip()) {
        allowed()
    } else {
        tracing::warn!(peer = %peer, "Scrape rejected by allow_addrs_regex");
        (StatusCode::FORBIDDEN, "forbidden\n").into_response()
    }
}

fn text_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn all_series(
    State(exporter): State<Arc<PromExporter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    reject_or(&exporter, peer, || {
        tracing::debug!(trace_id = %trace_id(), peer = %peer, "Scrape");
        text_response(exporter.dump(None))
    })
}

async fn object_series(
    State(exporter): State<Arc<PromExporter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(object): Path<String>,
) -> Response {
    reject_or(&exporter, peer, || text_response(exporter.dump(Some(&object))))
}

async fn index(
    State(exporter): State<Arc<PromExporter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    reject_or(&exporter, peer, || {
        let mut body = String::from("<html><body><h2>oxpoll</h2><ul>");
        let _ = write!(body, "<li><a href=\"/metrics\">metrics</a></li>");
        for object in exporter.objects() {
            let _ = write!(body, "<li><a href=\"/{object}\">{object}</a></li>");
        }
        body.push_str("</ul></body></html>");
        Html(body).into_response()
    })
}

async fn health() -> &'static str {
    "OK\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(range: Option<&str>, allow: &[&str]) -> PromConfig {
        PromConfig {
            port_range: range.map(str::to_string),
            local_http_addr: "127.0.0.1".to_string(),
            allow_addrs_regex: allow.iter().map(|s| s.to_string()).collect(),
            ..PromConfig::default()
        }
    }

    #[test]
    fn override_port_wins() {
        let config = config_with(Some("13100-13110"), &[]);
        let (listener, port) = PromExporter::allocate_listener(&config, Some(13155)).unwrap();
        assert_eq!(port, 13155);
        drop(listener);
    }

    #[test]
    fn range_scan_skips_occupied_ports() {
        let config = config_with(Some("13200-13205"), &[]);
        let blocker = TcpListener::bind(("127.0.0.1", 13200)).unwrap();
        let (listener, port) = PromExporter::allocate_listener(&config, None).unwrap();
        assert_eq!(port, 13201);
        drop((listener, blocker));
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let config = config_with(Some("13300-13300"), &[]);
        let blocker = TcpListener::bind(("127.0.0.1", 13300)).unwrap();
        assert!(PromExporter::allocate_listener(&config, None).is_err());
        drop(blocker);
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        let exporter = PromExporter::new("prom", &config_with(None, &[])).unwrap();
        assert!(exporter.addr_allowed("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn allow_list_filters_by_regex() {
        let exporter =
            PromExporter::new("prom", &config_with(None, &[r"^127\.0\.0\.\d+$"])).unwrap();
        assert!(exporter.addr_allowed("127.0.0.1".parse().unwrap()));
        assert!(!exporter.addr_allowed("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn bad_allow_regex_is_config_error() {
        assert!(PromExporter::new("prom", &config_with(None, &["("])).is_err());
    }

    #[tokio::test]
    async fn export_replaces_cache_by_matrix_identity() {
        let exporter = PromExporter::new("prom", &config_with(None, &[])).unwrap();

        let mut m = Matrix::new("p.rest.volume", "volume");
        m.new_instance("v0").unwrap();
        m.new_metric_float64("read_ops").unwrap();
        m.set_value("read_ops", "v0", 1.0).unwrap();
        exporter.export(std::slice::from_ref(&m)).await.unwrap();
        assert!(exporter.dump(None).contains("volume_read_ops"));

        m.set_value("read_ops", "v0", 2.0).unwrap();
        exporter.export(std::slice::from_ref(&m)).await.unwrap();
        let body = exporter.dump(None);
        assert!(body.contains("} 2"));
        assert!(!body.contains("} 1"));

        assert_eq!(exporter.dump(Some("other")), "");
    }
}
