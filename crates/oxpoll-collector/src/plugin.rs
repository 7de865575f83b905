//! Per-object transformations that run after a successful data cycle.
//! Plugins receive the cycle's matrix, may relabel it, and may emit
//! extra matrices that join the export set. Builders live in a fixed
//! registry; templates reference them by name.

use async_trait::async_trait;
use oxpoll_common::config::Credentials;
use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_matrix::Matrix;
use std::collections::HashMap;

/// Everything a plugin may need from its parent collector, passed by
/// value so the plugin never reaches back into the collector.
#[derive(Clone)]
pub struct PluginContext {
    pub poller: String,
    pub object: String,
    pub parent_uuid: String,
    /// The parent collector's full template.
    pub parent_params: Node,
    /// The plugin's own template section.
    pub params: Node,
    pub addr: String,
    pub credentials: Credentials,
    pub client_timeout: u64,
    pub use_insecure_tls: bool,
}

#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Transforms the cycle's matrix. Returned matrices are exported
    /// alongside it this cycle.
    async fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>>;
}

pub type PluginBuilder = fn(&PluginContext) -> Result<Box<dyn Plugin>>;

pub struct PluginRegistry {
    builders: HashMap<&'static str, PluginBuilder>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, builder: PluginBuilder) {
        self.builders.insert(name, builder);
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn build(&self, name: &str, context: &PluginContext) -> Result<Box<dyn Plugin>> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown plugin {name:?}")))?;
        builder(context)
    }

    /// Builds every plugin the template declares, in declaration order.
    pub fn load_declared(
        &self,
        parent_params: &Node,
        mut context: PluginContext,
    ) -> Result<Vec<Box<dyn Plugin>>> {
        let Some(declared) = parent_params.get_child("plugins") else {
            return Ok(Vec::new());
        };
        let mut plugins = Vec::new();
        for entry in declared.iter_children() {
            // bare list entries carry the name as content; parameterized
            // ones are single-key mappings whose key is the plugin name
            let (name, params) = if !entry.name().is_empty() {
                (entry.name().to_string(), entry.clone())
            } else if !entry.content().is_empty() {
                (entry.content().to_string(), entry.clone())
            } else if let Some(inner) = entry.iter_children().next() {
                (inner.name().to_string(), inner.clone())
            } else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            context.params = params;
            plugins.push(self.build(&name, &context)?);
        }
        Ok(plugins)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("Aggregator", crate::plugins::aggregator::new);
        registry.register("VolumeTag", crate::plugins::volume_tag::new);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PluginContext {
        PluginContext {
            poller: "p1".to_string(),
            object: "Volume".to_string(),
            parent_uuid: "p1.Rest.Volume".to_string(),
            parent_params: Node::new("template"),
            params: Node::new("plugin"),
            addr: "10.0.0.1".to_string(),
            credentials: Credentials {
                username: "admin".to_string(),
                ..Credentials::default()
            },
            client_timeout: 30,
            use_insecure_tls: true,
        }
    }

    #[test]
    fn unknown_plugin_is_config_error() {
        let registry = PluginRegistry::default();
        assert!(matches!(
            registry.build("Nope", &context()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn declared_plugins_load_in_order() {
        let registry = PluginRegistry::default();
        let params = Node::from_yaml_str(
            "t",
            "plugins:\n  - Aggregator:\n      - node\n",
        )
        .unwrap();
        let plugins = registry.load_declared(&params, context()).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name(), "Aggregator");
    }

    #[test]
    fn default_registry_knows_builtins() {
        let registry = PluginRegistry::default();
        assert!(registry.has_plugin("Aggregator"));
        assert!(registry.has_plugin("VolumeTag"));
    }
}
