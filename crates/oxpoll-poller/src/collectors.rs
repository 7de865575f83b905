//! Construction of concrete collectors from a (class, object) election:
//! template load, base assembly, client wiring and plugin loading.
//! KeyPerf builds on the REST perf implementation with its own template
//! directory; StorageGrid builds on the REST inventory implementation.

use oxpoll_collector::base::CollectorBase;
use oxpoll_collector::client::rest::RestClient;
use oxpoll_collector::client::zapi::ZapiClient;
use oxpoll_collector::plugin::{PluginContext, PluginRegistry};
use oxpoll_collector::recorder::Recorder;
use oxpoll_collector::rest::Rest;
use oxpoll_collector::restperf::RestPerf;
use oxpoll_collector::template::load_template;
use oxpoll_collector::zapi::Zapi;
use oxpoll_collector::zapiperf::ZapiPerf;
use oxpoll_collector::Collector;
use oxpoll_common::config::{Credentials, PollerConfig};
use oxpoll_common::error::{Error, Result};
use std::path::Path;

pub struct BuildInput<'a> {
    pub poller_name: &'a str,
    pub poller: &'a PollerConfig,
    pub credentials: &'a Credentials,
    pub conf_dir: &'a Path,
    pub registry: &'a PluginRegistry,
}

pub fn build_collector(
    class: &str,
    object: &str,
    input: &BuildInput<'_>,
) -> Result<Box<dyn Collector>> {
    let params = load_template(input.conf_dir, class, object)?;
    let mut base = CollectorBase::new(input.poller_name, class, object, params)?;
    base.set_global_labels(&input.poller.global_labels());

    let recorder = input
        .poller
        .recorder
        .as_ref()
        .map(Recorder::from_config)
        .transpose()?;

    let mut collector: Box<dyn Collector> = match class {
        "Rest" | "StorageGrid" | "KeyPerf" | "RestPerf" => {
            let client = RestClient::new(
                &input.poller.addr,
                input.credentials.clone(),
                input.poller.client_timeout,
                input.poller.use_insecure_tls,
                recorder,
            )?;
            if class == "Rest" || class == "StorageGrid" {
                Box::new(Rest::new(base, client)?)
            } else {
                Box::new(RestPerf::new(base, client)?)
            }
        }
        "Zapi" | "ZapiPerf" => {
            let client = ZapiClient::new(
                &input.poller.addr,
                input.credentials.clone(),
                input.poller.client_timeout,
                input.poller.use_insecure_tls,
                recorder,
            )?;
            if class == "Zapi" {
                Box::new(Zapi::new(base, client)?)
            } else {
                Box::new(ZapiPerf::new(base, client)?)
            }
        }
        other => {
            return Err(Error::Config(format!("unknown collector class {other:?}")));
        }
    };

    let context = PluginContext {
        poller: input.poller_name.to_string(),
        object: object.to_string(),
        parent_uuid: collector.base().matrix.uuid().to_string(),
        parent_params: collector.base().params.clone(),
        params: oxpoll_common::tree::Node::new("plugin"),
        addr: input.poller.addr.clone(),
        credentials: input.credentials.clone(),
        client_timeout: input.poller.client_timeout,
        use_insecure_tls: input.poller.use_insecure_tls,
    };
    let parent_params = collector.base().params.clone();
    collector.base_mut().plugins = input.registry.load_declared(&parent_params, context)?;

    Ok(collector)
}

/// Objects a class collects when the request does not name any: one per
/// template file in the class's directory, in name order.
pub fn default_objects(conf_dir: &Path, class: &str) -> Result<Vec<String>> {
    let dir = conf_dir.join(class.to_lowercase());
    let mut objects = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(|e| {
        Error::Config(format!("template directory {} unreadable: {e}", dir.display()))
    })?;
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".yaml") {
            objects.push(stem.to_string());
        }
    }
    objects.sort();
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxpoll_common::config::AuthStyle;

    fn write_template(dir: &Path, class: &str, object: &str, body: &str) {
        let class_dir = dir.join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        std::fs::write(class_dir.join(format!("{object}.yaml")), body).unwrap();
    }

    #[test]
    fn builds_a_rest_collector_with_plugins() {
        let dir = tempfile::tempdir().unwrap();
        write_template(
            dir.path(),
            "rest",
            "volume",
            "query: api/storage/volumes\ncounters:\n  - ^^uuid => uuid\n  - space.used\nplugins:\n  - Aggregator:\n      - node\n",
        );

        let poller = PollerConfig {
            addr: "10.0.0.1".to_string(),
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..PollerConfig::default()
        };
        let credentials = Credentials {
            auth_style: AuthStyle::BasicAuth,
            username: "admin".to_string(),
            password: "secret".to_string(),
            ..Credentials::default()
        };
        let registry = PluginRegistry::default();
        let input = BuildInput {
            poller_name: "p1",
            poller: &poller,
            credentials: &credentials,
            conf_dir: dir.path(),
            registry: &registry,
        };

        let collector = build_collector("Rest", "volume", &input).unwrap();
        assert_eq!(collector.class(), "Rest");
        assert_eq!(collector.base().plugins.len(), 1);
    }

    #[test]
    fn unknown_class_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "ems", "event", "query: x\ncounters:\n  - ^^a\n");
        let poller = PollerConfig::default();
        let credentials = Credentials::default();
        let registry = PluginRegistry::default();
        let input = BuildInput {
            poller_name: "p1",
            poller: &poller,
            credentials: &credentials,
            conf_dir: dir.path(),
            registry: &registry,
        };
        assert!(matches!(
            build_collector("Ems", "event", &input),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn default_objects_come_from_template_files() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "rest", "volume", "query: x\ncounters: [^^a]\n");
        write_template(dir.path(), "rest", "aggregate", "query: x\ncounters: [^^a]\n");
        assert_eq!(
            default_objects(dir.path(), "Rest").unwrap(),
            ["aggregate", "volume"]
        );
    }
}
