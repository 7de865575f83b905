//! REST inventory collector: walks a collection endpoint's records,
//! assembles instance keys from the template's key fields, stamps
//! labels and numeric fields onto the working matrix.

use crate::base::{CollectorBase, TASK_DATA, TASK_INSTANCE};
use crate::client::rest::{build_href, json_path, json_to_string, RestClient};
use crate::template::{parse_counters, parse_export_options, CounterDef, CounterKind};
use crate::{Collector, InstanceDiff};
use async_trait::async_trait;
use oxpoll_common::error::{Error, Result};
use oxpoll_matrix::{Matrix, With};
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub struct Rest {
    pub(crate) base: CollectorBase,
    pub(crate) client: RestClient,
    pub(crate) query: String,
    pub(crate) counters: Vec<CounterDef>,
}

impl Rest {
    pub fn new(base: CollectorBase, client: RestClient) -> Result<Self> {
        let query = base
            .params
            .get_child_content("query")
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::Config(format!("{}: template has no query", base.object)))?
            .to_string();
        let counters = parse_counters(&base.params)?;
        if !counters.iter().any(|c| c.kind == CounterKind::Key) {
            return Err(Error::Config(format!(
                "{}: template declares no instance key fields",
                base.object
            )));
        }
        Ok(Rest {
            base,
            client,
            query,
            counters,
        })
    }

    fn fields(&self) -> Vec<String> {
        self.counters.iter().map(|c| c.path.clone()).collect()
    }

    fn instance_key(&self, record: &Value) -> Option<String> {
        let mut key = String::new();
        for def in self.counters.iter().filter(|c| c.kind == CounterKind::Key) {
            key.push_str(&json_to_string(json_path(record, &def.path)?));
        }
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

#[async_trait]
impl Collector for Rest {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    async fn init(&mut self) -> Result<()> {
        for def in &self.counters {
            if def.kind == CounterKind::Metric {
                self.base.matrix.new_metric_float64(def.display.clone())?;
            }
        }
        let options = parse_export_options(&self.base.params);
        self.base.matrix.set_export_options(options);
        tracing::debug!(
            object = %self.base.object,
            metrics = self.base.matrix.metric_len(),
            "Initialized inventory cache"
        );
        Ok(())
    }

    async fn poll_instance(&mut self) -> Result<InstanceDiff> {
        let api_start = Instant::now();
        let href = build_href(&self.query, &self.fields(), &[]);
        let records = self.client.fetch_records(&href).await?;
        let api_elapsed = api_start.elapsed();

        let parse_start = Instant::now();
        let mut stale: HashSet<String> = self.base.matrix.instance_keys().into_iter().collect();
        let mut added = 0u64;
        for record in &records {
            let Some(key) = self.instance_key(record) else {
                tracing::warn!(object = %self.base.object, "Skipping record without key fields");
                continue;
            };
            if !stale.remove(&key) {
                self.base.matrix.new_instance(key)?;
                added += 1;
            }
        }
        let removed = stale.len() as u64;
        for key in stale {
            self.base.matrix.remove_instance(&key);
        }

        self.base.record_cycle(
            TASK_INSTANCE,
            api_elapsed,
            parse_start.elapsed(),
            Duration::ZERO,
            records.len() as u64,
        );
        Ok(InstanceDiff { added, removed })
    }

    async fn poll_counter(&mut self) -> Result<()> {
        Ok(())
    }

    async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let api_start = Instant::now();
        let href = build_href(&self.query, &self.fields(), &[]);
        let records = self.client.fetch_records(&href).await?;
        let api_elapsed = api_start.elapsed();

        // zero instances is an empty snapshot for inventory objects
        if records.is_empty() {
            tracing::info!(object = %self.base.object, "Remote reports no instances");
        }

        let parse_start = Instant::now();
        self.base.matrix.reset();
        let mut count = 0u64;

        for record in &records {
            let Some(key) = self.instance_key(record) else {
                continue;
            };
            if self.base.matrix.get_instance(&key).is_none() {
                self.base.matrix.new_instance(key.clone())?;
            }

            for def in &self.counters {
                let Some(value) = json_path(record, &def.path) else {
                    continue;
                };
                match def.kind {
                    CounterKind::Key | CounterKind::Label => {
                        let text = json_to_string(value);
                        if let Some(instance) = self.base.matrix.get_instance_mut(&key) {
                            instance.set_label(def.display.clone(), text);
                            count += 1;
                        }
                    }
                    CounterKind::Metric => {
                        let outcome = match value.as_f64() {
                            Some(number) => {
                                self.base.matrix.set_value(&def.display, &key, number)
                            }
                            None => self.base.matrix.set_value_string(
                                &def.display,
                                &key,
                                &json_to_string(value),
                            ),
                        };
                        match outcome {
                            Ok(()) => count += 1,
                            Err(Error::Parse { .. }) => {
                                tracing::debug!(
                                    metric = %def.display,
                                    instance = %key,
                                    "Unparseable cell skipped"
                                );
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        self.base.record_cycle(
            TASK_DATA,
            api_elapsed,
            parse_start.elapsed(),
            Duration::ZERO,
            count,
        );
        Ok(vec![self.base.matrix.clone_with(With::all())])
    }
}
