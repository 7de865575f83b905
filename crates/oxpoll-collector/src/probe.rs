//! One-shot capability probe: asks the cluster who it is before
//! collectors are selected. A probe failure is never fatal; the caller
//! continues with an empty capability record.

use crate::client::rest::RestClient;
use crate::client::zapi::ZapiClient;
use oxpoll_common::config::Credentials;
use oxpoll_common::error::Result;
use oxpoll_common::remote::{Remote, Version};
use oxpoll_common::tree::Node;
use serde_json::Value;

const CLUSTER_QUERY: &str = "api/cluster?fields=version,name,san_optimized,disaggregated";

#[derive(Clone)]
pub struct ProbeTarget {
    pub addr: String,
    pub credentials: Credentials,
    pub client_timeout: u64,
    pub use_insecure_tls: bool,
}

/// Gathers version and capability flags. The REST call supplies the
/// version and platform flags; a trivial ZAPI invocation decides whether
/// the legacy transport still answers.
pub async fn gather_cluster_info(target: &ProbeTarget) -> Result<Remote> {
    let mut rest = RestClient::new(
        &target.addr,
        target.credentials.clone(),
        target.client_timeout,
        target.use_insecure_tls,
        None,
    )?;
    let info = rest.get_json(CLUSTER_QUERY).await?;
    let mut remote = remote_from_cluster_info(&info);

    match probe_zapi(target).await {
        Ok(clustered) => {
            remote.zapis_exist = true;
            remote.clustered = clustered;
        }
        Err(e) => {
            tracing::debug!(error = %e, "Legacy transport not answering");
            remote.zapis_exist = false;
        }
    }
    Ok(remote)
}

async fn probe_zapi(target: &ProbeTarget) -> Result<bool> {
    let mut zapi = ZapiClient::new(
        &target.addr,
        target.credentials.clone(),
        target.client_timeout,
        target.use_insecure_tls,
        None,
    )?;
    let results = zapi.invoke(&Node::new("system-get-version")).await?;
    Ok(results.get_child_content("is-clustered") == Some("true"))
}

/// The version object carries generation/major/minor; older releases
/// only give the full string.
pub fn remote_from_cluster_info(info: &Value) -> Remote {
    let version = info
        .get("version")
        .map(|v| {
            let number = |key: &str| {
                v.get(key)
                    .and_then(Value::as_u64)
                    .map(|n| n as u16)
            };
            match (number("generation"), number("major"), number("minor")) {
                (Some(major), Some(minor), Some(patch)) => Version {
                    major,
                    minor,
                    patch,
                },
                _ => v
                    .get("full")
                    .and_then(Value::as_str)
                    .and_then(parse_full_version)
                    .unwrap_or_default(),
            }
        })
        .unwrap_or_default();

    Remote {
        version,
        model: info
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        zapis_exist: false,
        is_disaggregated: info
            .get("disaggregated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        is_san_optimized: info
            .get("san_optimized")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        clustered: false,
    }
}

/// Pulls `9.11.1` out of strings like `NetApp Release 9.11.1P4: …`.
fn parse_full_version(full: &str) -> Option<Version> {
    full.split_whitespace().find_map(|word| {
        let trimmed: String = word
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if trimmed.contains('.') {
            trimmed.parse().ok()
        } else {
            None
        }
    })
}
