//! Sums exportable cells across instances that share a label and emits
//! the result as a derived matrix, one instance per distinct label
//! value. The template names the grouping label:
//!
//! ```yaml
//! plugins:
//!   - Aggregator:
//!       - node
//! ```

use crate::plugin::{Plugin, PluginContext};
use async_trait::async_trait;
use oxpoll_common::error::{Error, Result};
use oxpoll_matrix::Matrix;

pub fn new(context: &PluginContext) -> Result<Box<dyn Plugin>> {
    let labels: Vec<String> = context
        .params
        .get_all_child_content()
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(Error::Config(
            "Aggregator plugin needs at least one grouping label".to_string(),
        ));
    }
    Ok(Box::new(Aggregator {
        parent_uuid: context.parent_uuid.clone(),
        labels,
    }))
}

struct Aggregator {
    parent_uuid: String,
    labels: Vec<String>,
}

#[async_trait]
impl Plugin for Aggregator {
    fn name(&self) -> &str {
        "Aggregator"
    }

    async fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        let mut produced = Vec::new();
        for label in &self.labels {
            produced.push(aggregate_by(data, label, &self.parent_uuid)?);
        }
        Ok(produced)
    }
}

fn aggregate_by(data: &Matrix, label: &str, parent_uuid: &str) -> Result<Matrix> {
    let mut out = Matrix::new(
        format!("{parent_uuid}.Aggregator.{label}"),
        format!("{}_{label}", data.object()),
    );
    for (name, value) in data.global_labels() {
        out.set_global_label(name.clone(), value.clone());
    }

    let metric_keys = data.metric_keys();
    for key in &metric_keys {
        let source = data.get_metric(key).unwrap_or_else(|| unreachable!());
        let metric = out.new_metric_float64(key.clone())?;
        metric.set_name(source.name());
        metric.set_label(source.label());
        metric.set_array(source.is_array());
        metric.set_unit(source.unit());
        metric.set_exportable(source.is_exportable());
    }

    let mut source_keys = data.instance_keys();
    source_keys.sort();
    for source_key in source_keys {
        let Some(instance) = data.get_instance(&source_key) else {
            continue;
        };
        if !instance.is_exportable() {
            continue;
        }
        let Some(group) = instance.get_label(label).map(str::to_string) else {
            continue;
        };

        if out.get_instance(&group).is_none() {
            let grouped = out.new_instance(group.clone())?;
            grouped.set_label(label, group.clone());
        }
        for key in &metric_keys {
            let value = data
                .get_metric(key)
                .and_then(|m| m.value(instance.index()));
            if let Some(value) = value {
                out.add_value(key, &group, value)?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_by_label_value() {
        let mut data = Matrix::new("p.restperf.volume", "volume");
        data.set_global_label("cluster", "c1");
        data.new_metric_float64("read_ops").unwrap();
        for (key, node, ops) in [("v0", "node1", 10.0), ("v1", "node1", 5.0), ("v2", "node2", 7.0)]
        {
            let instance = data.new_instance(key).unwrap();
            instance.set_label("node", node);
            data.set_value("read_ops", key, ops).unwrap();
        }

        let out = aggregate_by(&data, "node", "p.restperf.volume").unwrap();
        assert_eq!(out.object(), "volume_node");
        assert_eq!(out.instance_len(), 2);
        assert_eq!(out.value("read_ops", "node1"), Some(15.0));
        assert_eq!(out.value("read_ops", "node2"), Some(7.0));
        assert_eq!(out.global_labels(), data.global_labels());
    }

    #[test]
    fn hidden_instances_do_not_contribute() {
        let mut data = Matrix::new("p.restperf.volume", "volume");
        data.new_metric_float64("read_ops").unwrap();
        let instance = data.new_instance("v0").unwrap();
        instance.set_label("node", "node1");
        instance.set_exportable(false);
        data.set_value("read_ops", "v0", 10.0).unwrap();

        let out = aggregate_by(&data, "node", "u").unwrap();
        assert_eq!(out.instance_len(), 0);
    }
}
