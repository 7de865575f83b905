//! Textual series rendering: one `object_metric{labels} value` line per
//! exportable (instance × metric) pair. Invalid and non-finite cells are
//! omitted. Global labels come first; array buckets render as a
//! `metric="bucket"` label.

use oxpoll_matrix::{Instance, Matrix, Metric};
use std::collections::HashSet;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub sort_labels: bool,
    pub add_meta_tags: bool,
}

pub fn render_matrix(matrix: &Matrix, options: &RenderOptions) -> Vec<String> {
    if !matrix.is_exportable() {
        return Vec::new();
    }

    let mut lines = Vec::new();
    let mut meta_seen: HashSet<String> = HashSet::new();

    let mut instance_keys = matrix.instance_keys();
    instance_keys.sort();
    let mut metric_keys = matrix.metric_keys();
    metric_keys.sort();

    for instance_key in &instance_keys {
        let instance = match matrix.get_instance(instance_key) {
            Some(i) if i.is_exportable() => i,
            _ => continue,
        };
        let labels = instance_label_set(matrix, instance, options);

        for metric_key in &metric_keys {
            let metric = match matrix.get_metric(metric_key) {
                Some(m) if m.is_exportable() => m,
                _ => continue,
            };
            let value = match metric.value(instance.index()) {
                Some(v) if v.is_finite() => v,
                _ => continue,
            };

            let series = format!("{}_{}", matrix.object(), metric.name());
            if options.add_meta_tags && meta_seen.insert(series.clone()) {
                if !metric.unit().is_empty() {
                    lines.push(format!("# HELP {series} unit: {}", metric.unit()));
                }
                lines.push(format!("# TYPE {series} gauge"));
            }

            let mut label_set = String::new();
            let mut first = true;
            for (name, val) in &labels {
                push_label(&mut label_set, &mut first, name, val);
            }
            if metric.is_array() {
                push_label(&mut label_set, &mut first, "metric", metric.label());
            }

            let mut line = String::with_capacity(64);
            if label_set.is_empty() {
                let _ = write!(line, "{series} {value}");
            } else {
                let _ = write!(line, "{series}{{{label_set}}} {value}");
            }
            lines.push(line);
        }
    }

    lines
}

fn instance_label_set(
    matrix: &Matrix,
    instance: &Instance,
    options: &RenderOptions,
) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = matrix
        .global_labels()
        .iter()
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect();

    let export = matrix.export_options();
    let mut own: Vec<(String, String)> = if export.include_all_labels
        || (export.instance_keys.is_empty() && export.instance_labels.is_empty())
    {
        instance
            .labels()
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    } else {
        export
            .instance_keys
            .iter()
            .chain(export.instance_labels.iter())
            .filter_map(|name| {
                instance
                    .get_label(name)
                    .map(|v| (name.clone(), v.to_string()))
            })
            .collect()
    };

    if options.sort_labels {
        own.sort();
    }
    labels.append(&mut own);
    labels
}

fn push_label(line: &mut String, first: &mut bool, name: &str, value: &str) {
    if !*first {
        line.push(',');
    }
    *first = false;
    let _ = write!(line, "{name}=\"{}\"", escape_label(value));
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Field key for one metric in line-protocol output.
pub fn field_name(metric: &Metric) -> String {
    if metric.is_array() {
        format!("{}_{}", metric.name(), metric.label())
    } else {
        metric.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxpoll_matrix::ExportOptions;

    fn volume_matrix() -> Matrix {
        let mut m = Matrix::new("p.rest.volume", "volume");
        m.set_global_label("datacenter", "rtp");
        m.set_global_label("cluster", "c1");

        m.new_metric_float64("read_ops").unwrap();
        let inst = m.new_instance("v0").unwrap();
        inst.set_label("volume", "vol0");
        inst.set_label("svm", "svm1");
        m.set_value("read_ops", "v0", 42.0).unwrap();
        m
    }

    #[test]
    fn renders_global_labels_first() {
        let lines = render_matrix(&volume_matrix(), &RenderOptions::default());
        assert_eq!(
            lines,
            vec![
                "volume_read_ops{datacenter=\"rtp\",cluster=\"c1\",volume=\"vol0\",svm=\"svm1\"} 42"
            ]
        );
    }

    #[test]
    fn sort_labels_orders_instance_labels() {
        let options = RenderOptions {
            sort_labels: true,
            ..RenderOptions::default()
        };
        let lines = render_matrix(&volume_matrix(), &options);
        // globals stay first in declaration order, instance labels sorted
        assert_eq!(
            lines,
            vec![
                "volume_read_ops{datacenter=\"rtp\",cluster=\"c1\",svm=\"svm1\",volume=\"vol0\"} 42"
            ]
        );
    }

    #[test]
    fn invalid_cells_and_hidden_rows_are_omitted() {
        let mut m = volume_matrix();
        m.new_instance("v1").unwrap();
        // v1 has no value for read_ops: nothing rendered for it
        let lines = render_matrix(&m, &RenderOptions::default());
        assert_eq!(lines.len(), 1);

        m.get_instance_mut("v0").unwrap().set_exportable(false);
        assert!(render_matrix(&m, &RenderOptions::default()).is_empty());
    }

    #[test]
    fn non_exportable_metric_is_omitted() {
        let mut m = volume_matrix();
        m.get_metric_mut("read_ops").unwrap().set_exportable(false);
        assert!(render_matrix(&m, &RenderOptions::default()).is_empty());
    }

    #[test]
    fn export_options_select_labels() {
        let mut m = volume_matrix();
        m.set_export_options(ExportOptions {
            instance_keys: vec!["volume".to_string()],
            instance_labels: vec![],
            include_all_labels: false,
        });
        let lines = render_matrix(&m, &RenderOptions::default());
        assert_eq!(
            lines,
            vec!["volume_read_ops{datacenter=\"rtp\",cluster=\"c1\",volume=\"vol0\"} 42"]
        );
    }

    #[test]
    fn array_buckets_render_with_metric_label() {
        let mut m = Matrix::new("p.restperf.system", "system");
        m.new_instance("node1").unwrap();
        {
            let metric = m.new_metric_float64("cpu_busy#kahuna").unwrap();
            metric.set_name("domain_busy");
            metric.set_label("kahuna");
            metric.set_array(true);
        }
        m.set_value("cpu_busy#kahuna", "node1", 12.5).unwrap();

        let lines = render_matrix(&m, &RenderOptions::default());
        assert_eq!(lines, vec!["system_domain_busy{metric=\"kahuna\"} 12.5"]);
    }

    #[test]
    fn meta_tags_emitted_once_per_series() {
        let mut m = volume_matrix();
        m.new_instance("v1").unwrap();
        m.set_value("read_ops", "v1", 1.0).unwrap();
        m.get_metric_mut("read_ops").unwrap().set_unit("per_sec");

        let options = RenderOptions {
            add_meta_tags: true,
            ..RenderOptions::default()
        };
        let lines = render_matrix(&m, &options);
        let helps = lines.iter().filter(|l| l.starts_with("# HELP")).count();
        let types = lines.iter().filter(|l| l.starts_with("# TYPE")).count();
        assert_eq!(helps, 1);
        assert_eq!(types, 1);
        assert_eq!(lines.iter().filter(|l| !l.starts_with('#')).count(), 2);
    }

    #[test]
    fn nan_cells_are_omitted() {
        let mut m = volume_matrix();
        m.set_value("read_ops", "v0", f64::NAN).unwrap();
        assert!(render_matrix(&m, &RenderOptions::default()).is_empty());
    }
}
