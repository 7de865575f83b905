//! Push exporter: renders matrices as InfluxDB line protocol and POSTs
//! each cycle's batch to the configured write endpoint. Failures are
//! reported to the caller and never terminate the poller.

use crate::render::field_name;
use crate::Exporter;
use async_trait::async_trait;
use oxpoll_common::config::InfluxConfig;
use oxpoll_common::error::{Error, Result};
use oxpoll_matrix::Matrix;
use std::fmt::Write as _;
use std::time::Duration;

pub struct InfluxExporter {
    name: String,
    url: String,
    token: String,
    http: reqwest::Client,
}

impl InfluxExporter {
    pub fn new(name: impl Into<String>, config: &InfluxConfig, timeout_secs: u64) -> Result<Self> {
        let url = config.endpoint_url()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("influx client: {e}")))?;
        Ok(InfluxExporter {
            name: name.into(),
            url,
            token: config.token.clone(),
            http,
        })
    }

    /// One line per instance carrying all valid exportable fields.
    pub fn render_lines(matrix: &Matrix, timestamp_ns: i64) -> Vec<String> {
        if !matrix.is_exportable() {
            return Vec::new();
        }

        let mut instance_keys = matrix.instance_keys();
        instance_keys.sort();
        let mut metric_keys = matrix.metric_keys();
        metric_keys.sort();

        let mut lines = Vec::new();
        for instance_key in &instance_keys {
            let instance = match matrix.get_instance(instance_key) {
                Some(i) if i.is_exportable() => i,
                _ => continue,
            };

            let mut line = escape_measurement(matrix.object());
            for (name, value) in matrix.global_labels() {
                let _ = write!(line, ",{}={}", escape_tag(name), escape_tag(value));
            }
            for (name, value) in instance.labels() {
                if value.is_empty() {
                    continue;
                }
                let _ = write!(line, ",{}={}", escape_tag(name), escape_tag(value));
            }

            let mut fields = String::new();
            for metric_key in &metric_keys {
                let metric = match matrix.get_metric(metric_key) {
                    Some(m) if m.is_exportable() => m,
                    _ => continue,
                };
                let value = match metric.value(instance.index()) {
                    Some(v) if v.is_finite() => v,
                    _ => continue,
                };
                if !fields.is_empty() {
                    fields.push(',');
                }
                let _ = write!(fields, "{}={value}", escape_tag(&field_name(metric)));
            }

            if fields.is_empty() {
                continue;
            }
            let _ = write!(line, " {fields} {timestamp_ns}");
            lines.push(line);
        }
        lines
    }
}

#[async_trait]
impl Exporter for InfluxExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, matrices: &[Matrix]) -> Result<()> {
        let timestamp_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let body: String = matrices
            .iter()
            .flat_map(|m| Self::render_lines(m, timestamp_ns))
            .collect::<Vec<_>>()
            .join("\n");
        if body.is_empty() {
            return Ok(());
        }

        let response = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("influx write: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(Error::Auth(format!("influx write rejected: {status}")))
        } else {
            Err(Error::Transient(format!("influx write failed: {status}")))
        }
    }
}

fn escape_tag(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

fn escape_measurement(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_tags_and_fields() {
        let mut m = Matrix::new("p.rest.volume", "volume");
        m.set_global_label("cluster", "c1");
        m.new_metric_float64("read_ops").unwrap();
        m.new_metric_float64("write_ops").unwrap();
        let inst = m.new_instance("v0").unwrap();
        inst.set_label("volume", "vol zero");
        m.set_value("read_ops", "v0", 10.0).unwrap();
        m.set_value("write_ops", "v0", 4.5).unwrap();

        let lines = InfluxExporter::render_lines(&m, 1234);
        assert_eq!(
            lines,
            vec!["volume,cluster=c1,volume=vol\\ zero read_ops=10,write_ops=4.5 1234"]
        );
    }

    #[test]
    fn instances_without_fields_are_skipped() {
        let mut m = Matrix::new("p.rest.volume", "volume");
        m.new_metric_float64("read_ops").unwrap();
        m.new_instance("v0").unwrap();
        assert!(InfluxExporter::render_lines(&m, 0).is_empty());
    }
}
