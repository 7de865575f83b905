use crate::instance::Instance;
use crate::metric::Metric;
use oxpoll_common::error::{Error, Result};
use std::collections::HashMap;

/// Which parts of a matrix a clone carries. `data: false` yields a shaped
/// but empty clone used to receive the next sample.
#[derive(Debug, Clone, Copy)]
pub struct With {
    pub data: bool,
    pub metrics: bool,
    pub instances: bool,
    pub export_instances: bool,
}

impl With {
    pub fn all() -> Self {
        With {
            data: true,
            metrics: true,
            instances: true,
            export_instances: true,
        }
    }
}

/// Which instance keys and labels participate in rendered output, in
/// order. Empty lists mean "all labels".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportOptions {
    pub instance_keys: Vec<String>,
    pub instance_labels: Vec<String>,
    pub include_all_labels: bool,
}

/// The in-memory sample of one object: instances × metrics plus labels.
///
/// A matrix is owned by exactly one collector; exporters only ever see
/// snapshots. The UUID identifies poller, collector class and object.
#[derive(Debug, Clone)]
pub struct Matrix {
    uuid: String,
    object: String,
    global_labels: Vec<(String, String)>,
    instances: HashMap<String, Instance>,
    metrics: HashMap<String, Metric>,
    export_options: ExportOptions,
    exportable: bool,
}

impl Matrix {
    pub fn new(uuid: impl Into<String>, object: impl Into<String>) -> Self {
        Matrix {
            uuid: uuid.into(),
            object: object.into(),
            global_labels: Vec::new(),
            instances: HashMap::new(),
            metrics: HashMap::new(),
            export_options: ExportOptions::default(),
            exportable: true,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = uuid.into();
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn set_object(&mut self, object: impl Into<String>) {
        self.object = object.into();
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn set_global_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.global_labels.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.global_labels.push((name, value)),
        }
    }

    pub fn global_labels(&self) -> &[(String, String)] {
        &self.global_labels
    }

    pub fn set_export_options(&mut self, options: ExportOptions) {
        self.export_options = options;
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    pub fn export_options_mut(&mut self) -> &mut ExportOptions {
        &mut self.export_options
    }

    // --- instances ---

    /// Creates a new row. Every metric grows one unset cell.
    pub fn new_instance(&mut self, key: impl Into<String>) -> Result<&mut Instance> {
        let key = key.into();
        if self.instances.contains_key(&key) {
            return Err(Error::DuplicateInstance(key));
        }
        let instance = Instance::new(self.instances.len());
        for metric in self.metrics.values_mut() {
            metric.append_slot();
        }
        Ok(self.instances.entry(key).or_insert(instance))
    }

    pub fn get_instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn get_instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    /// Removes a row, compacting every metric's value vector and
    /// re-indexing the remaining instances.
    pub fn remove_instance(&mut self, key: &str) -> bool {
        let Some(removed) = self.instances.remove(key) else {
            return false;
        };
        let gone = removed.index();
        for metric in self.metrics.values_mut() {
            metric.remove_slot(gone);
        }
        for instance in self.instances.values_mut() {
            let index = instance.index();
            if index > gone {
                instance.set_index(index - 1);
            }
        }
        true
    }

    pub fn purge_instances(&mut self) {
        self.instances.clear();
        for metric in self.metrics.values_mut() {
            metric.clear_data();
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.instances.iter()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = (&String, &mut Instance)> {
        self.instances.iter_mut()
    }

    pub fn instance_keys(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn instance_len(&self) -> usize {
        self.instances.len()
    }

    // --- metrics ---

    /// Creates a new column sized to the current instance count. Values
    /// travel as 64-bit floats regardless of the source type.
    pub fn new_metric_float64(&mut self, key: impl Into<String>) -> Result<&mut Metric> {
        let key = key.into();
        if self.metrics.contains_key(&key) {
            return Err(Error::DuplicateMetric(key));
        }
        let metric = Metric::new(key.clone(), self.instances.len());
        Ok(self.metrics.entry(key).or_insert(metric))
    }

    pub fn get_metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn get_metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(key)
    }

    pub fn remove_metric(&mut self, key: &str) -> bool {
        self.metrics.remove(key).is_some()
    }

    pub fn get_metrics(&self) -> impl Iterator<Item = (&String, &Metric)> {
        self.metrics.iter()
    }

    pub fn metric_keys(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn metric_len(&self) -> usize {
        self.metrics.len()
    }

    // --- values ---

    pub fn set_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        let index = self
            .instances
            .get(instance)
            .ok_or_else(|| Error::missing("instance", instance))?
            .index();
        self.metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?
            .set_value(index, value)
    }

    /// Parses and stores a textual value. Malformed input fails with a
    /// parse error and leaves the cell unset.
    pub fn set_value_string(&mut self, metric: &str, instance: &str, value: &str) -> Result<()> {
        let index = self
            .instances
            .get(instance)
            .ok_or_else(|| Error::missing("instance", instance))?
            .index();
        self.metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?
            .set_value_string(index, value)
    }

    pub fn value(&self, metric: &str, instance: &str) -> Option<f64> {
        let index = self.instances.get(instance)?.index();
        self.metrics.get(metric)?.value(index)
    }

    /// Adds to a cell, treating an unset cell as zero. Used when several
    /// source counters accumulate into one column.
    pub fn add_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        let current = self.value(metric, instance).unwrap_or(0.0);
        self.set_value(metric, instance, current + value)
    }

    /// Clears every cell while keeping the table shape.
    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }

    /// Deep copy controlled by `with`. Identity, global labels and export
    /// options always carry over.
    pub fn clone_with(&self, with: With) -> Matrix {
        let mut clone = Matrix {
            uuid: self.uuid.clone(),
            object: self.object.clone(),
            global_labels: self.global_labels.clone(),
            instances: HashMap::new(),
            metrics: HashMap::new(),
            export_options: self.export_options.clone(),
            exportable: self.exportable,
        };

        if with.instances {
            clone.instances = self.instances.clone();
            if !with.export_instances {
                for instance in clone.instances.values_mut() {
                    instance.set_exportable(false);
                }
            }
        }

        if with.metrics {
            clone.metrics = self.metrics.clone();
            let len = clone.instances.len();
            for metric in clone.metrics.values_mut() {
                if !with.data {
                    metric.reset();
                }
                metric.resize(len);
            }
        }

        clone
    }

    // --- counter arithmetic ---

    /// Subtracts the previous sample from this one for `metric`, matching
    /// rows by instance key. A cell stays valid only when both sides are
    /// valid and the counter did not wrap; a wrap clears the cell rather
    /// than producing a negative value. Returns the number of cells
    /// cleared because of a wrap.
    pub fn delta(&mut self, metric: &str, previous: &Matrix) -> Result<usize> {
        let prev_metric = previous
            .get_metric(metric)
            .ok_or_else(|| Error::missing("metric", metric))?;

        let mut pairs: Vec<(usize, Option<f64>)> = Vec::with_capacity(self.instances.len());
        for (key, instance) in &self.instances {
            let prev_value = previous
                .get_instance(key)
                .and_then(|p| prev_metric.value(p.index()));
            pairs.push((instance.index(), prev_value));
        }

        let current = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?;

        let mut wraps = 0;
        for (index, prev_value) in pairs {
            match (current.value(index), prev_value) {
                (Some(cur), Some(prev)) if cur >= prev => {
                    current.set_value(index, cur - prev)?;
                }
                (Some(_), Some(_)) => {
                    current.invalidate(index);
                    wraps += 1;
                }
                _ => current.invalidate(index),
            }
        }
        Ok(wraps)
    }

    /// Cell-wise division of `metric` by `denominator`, both columns of
    /// this matrix. A zero or unset denominator clears the cell.
    pub fn divide(&mut self, metric: &str, denominator: &str) -> Result<()> {
        let (den_values, den_record) = self
            .metrics
            .get(denominator)
            .ok_or_else(|| Error::missing("metric", denominator))?
            .values_snapshot();
        let target = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?;

        for index in 0..target.len() {
            let den_valid = den_record.get(index).copied().unwrap_or(false);
            match target.value(index) {
                Some(value) if den_valid && den_values[index] != 0.0 => {
                    target.set_value(index, value / den_values[index])?;
                }
                _ => target.invalidate(index),
            }
        }
        Ok(())
    }

    /// Division used for latency counters: a denominator below
    /// `threshold` yields a valid zero instead of a noisy fraction.
    pub fn divide_with_threshold(
        &mut self,
        metric: &str,
        denominator: &str,
        threshold: f64,
    ) -> Result<()> {
        let (den_values, den_record) = self
            .metrics
            .get(denominator)
            .ok_or_else(|| Error::missing("metric", denominator))?
            .values_snapshot();
        let target = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?;

        for index in 0..target.len() {
            let den_valid = den_record.get(index).copied().unwrap_or(false);
            match target.value(index) {
                Some(_) if den_valid && den_values[index] < threshold => {
                    target.set_value(index, 0.0)?;
                }
                Some(value) if den_valid && den_values[index] != 0.0 => {
                    target.set_value(index, value / den_values[index])?;
                }
                _ => target.invalidate(index),
            }
        }
        Ok(())
    }

    pub fn multiply_by_scalar(&mut self, metric: &str, scalar: f64) -> Result<()> {
        let target = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| Error::missing("metric", metric))?;
        for index in 0..target.len() {
            if let Some(value) = target.value(index) {
                target.set_value(index, value * scalar)?;
            }
        }
        Ok(())
    }
}
