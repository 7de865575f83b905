//! Template interpretation shared by all collectors.
//!
//! A merged template arrives as a [`Node`] tree. The `counters` section
//! lists fields in the remote's schema: `^^` marks an instance-key
//! field, `^` a label, anything else a numeric metric; `=>` renames the
//! exported field.

use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_matrix::ExportOptions;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Key,
    Label,
    Metric,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterDef {
    /// Field path in the remote's schema, e.g. `space.used`.
    pub path: String,
    /// Exported name.
    pub display: String,
    pub kind: CounterKind,
}

pub fn parse_counter(raw: &str) -> CounterDef {
    let raw = raw.trim();
    let (kind, rest) = if let Some(rest) = raw.strip_prefix("^^") {
        (CounterKind::Key, rest)
    } else if let Some(rest) = raw.strip_prefix('^') {
        (CounterKind::Label, rest)
    } else {
        (CounterKind::Metric, raw)
    };

    let (path, display) = match rest.split_once("=>") {
        Some((path, display)) => (path.trim().to_string(), display.trim().to_string()),
        None => {
            let path = rest.trim().to_string();
            let display = path
                .rsplit('.')
                .next()
                .unwrap_or(path.as_str())
                .replace('-', "_");
            (path, display)
        }
    };

    CounterDef {
        path,
        display,
        kind,
    }
}

/// All counter definitions of a template, in declaration order.
pub fn parse_counters(params: &Node) -> Result<Vec<CounterDef>> {
    let counters = params
        .get_child("counters")
        .ok_or_else(|| Error::Config("template has no counters section".to_string()))?;
    let defs: Vec<CounterDef> = counters
        .get_all_child_content()
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(parse_counter)
        .collect();
    if defs.is_empty() {
        return Err(Error::Config("template counters section is empty".to_string()));
    }
    Ok(defs)
}

/// Export options from the template's `export_options` section.
pub fn parse_export_options(params: &Node) -> ExportOptions {
    let mut options = ExportOptions::default();
    let Some(section) = params.get_child("export_options") else {
        options.include_all_labels = true;
        return options;
    };
    if let Some(keys) = section.get_child("instance_keys") {
        options.instance_keys = keys
            .get_all_child_content()
            .into_iter()
            .map(str::to_string)
            .collect();
    }
    if let Some(labels) = section.get_child("instance_labels") {
        options.instance_labels = labels
            .get_all_child_content()
            .into_iter()
            .map(str::to_string)
            .collect();
    }
    if section.get_child_content("include_all_labels") == Some("true") {
        options.include_all_labels = true;
    }
    options
}

/// Reads one object template from `<conf_dir>/<class>/<object>.yaml`.
/// Merging of layered templates happens before the file reaches disk.
pub fn load_template(conf_dir: &Path, class: &str, object: &str) -> Result<Node> {
    let path = conf_dir
        .join(class.to_lowercase())
        .join(format!("{}.yaml", object.to_lowercase()));
    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("template {} unreadable: {e}", path.display()))
    })?;
    Node::from_yaml_str(object, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_markers_classify() {
        let key = parse_counter("^^uuid => id");
        assert_eq!(key.kind, CounterKind::Key);
        assert_eq!(key.path, "uuid");
        assert_eq!(key.display, "id");

        let label = parse_counter("^svm.name => svm");
        assert_eq!(label.kind, CounterKind::Label);
        assert_eq!(label.path, "svm.name");
        assert_eq!(label.display, "svm");

        let metric = parse_counter("space.used");
        assert_eq!(metric.kind, CounterKind::Metric);
        assert_eq!(metric.display, "used");
    }

    #[test]
    fn default_display_flattens_dashes() {
        let def = parse_counter("^volume-id-attributes.containing-aggregate-name");
        assert_eq!(def.display, "containing_aggregate_name");
    }

    #[test]
    fn export_options_default_to_all_labels() {
        let params = Node::from_yaml_str("t", "query: api/x").unwrap();
        let options = parse_export_options(&params);
        assert!(options.include_all_labels);

        let params = Node::from_yaml_str(
            "t",
            "export_options:\n  instance_keys: [volume, svm]\n  instance_labels: [state]\n",
        )
        .unwrap();
        let options = parse_export_options(&params);
        assert!(!options.include_all_labels);
        assert_eq!(options.instance_keys, ["volume", "svm"]);
        assert_eq!(options.instance_labels, ["state"]);
    }

    #[test]
    fn missing_counters_section_is_config_error() {
        let params = Node::from_yaml_str("t", "query: api/x").unwrap();
        assert!(matches!(parse_counters(&params), Err(Error::Config(_))));
    }
}
