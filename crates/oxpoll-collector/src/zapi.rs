//! XML inventory collector: template-driven walk of the instance
//! documents returned by the legacy transport, with tag-based
//! pagination.

use crate::base::{CollectorBase, TASK_DATA, TASK_INSTANCE};
use crate::client::zapi::{node_path, ZapiClient};
use crate::template::{parse_counters, parse_export_options, CounterDef, CounterKind};
use crate::{Collector, InstanceDiff};
use async_trait::async_trait;
use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_matrix::{Matrix, With};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const BATCH_SIZE: &str = "500";

pub struct Zapi {
    pub(crate) base: CollectorBase,
    pub(crate) client: ZapiClient,
    pub(crate) query: String,
    pub(crate) counters: Vec<CounterDef>,
}

impl Zapi {
    pub fn new(base: CollectorBase, client: ZapiClient) -> Result<Self> {
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
        Ok(Zapi {
            base,
            client,
            query,
            counters,
        })
    }

    fn instance_key(&self, instance: &Node) -> Option<String> {
        let mut key = String::new();
        for def in self.counters.iter().filter(|c| c.kind == CounterKind::Key) {
            key.push_str(node_path(instance, &def.path)?.content());
        }
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// Fetches every instance element, following `next-tag` pages in
    /// order.
    async fn fetch_instances(&mut self) -> Result<Vec<Node>> {
        let mut instances = Vec::new();
        let mut tag: Option<String> = None;
        loop {
            let mut request = Node::new(self.query.clone());
            request.new_child("max-records", BATCH_SIZE);
            if let Some(t) = &tag {
                request.new_child("tag", t.clone());
            }
            let results = self.client.invoke(&request).await?;
            if let Some(list) = results.get_child("attributes-list") {
                instances.extend(list.iter_children().cloned());
            }
            tag = results
                .get_child_content("next-tag")
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if tag.is_none() {
                break;
            }
        }
        Ok(instances)
    }
}

#[async_trait]
impl Collector for Zapi {
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
        Ok(())
    }

    async fn poll_instance(&mut self) -> Result<InstanceDiff> {
        let api_start = Instant::now();
        let instances = self.fetch_instances().await?;
        let api_elapsed = api_start.elapsed();

        let parse_start = Instant::now();
        let mut stale: HashSet<String> = self.base.matrix.instance_keys().into_iter().collect();
        let mut added = 0u64;
        for instance in &instances {
            let Some(key) = self.instance_key(instance) else {
                tracing::warn!(object = %self.base.object, "Skipping instance without key fields");
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
            instances.len() as u64,
        );
        Ok(InstanceDiff { added, removed })
    }

    async fn poll_counter(&mut self) -> Result<()> {
        Ok(())
    }

    async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let api_start = Instant::now();
        let instances = self.fetch_instances().await?;
        let api_elapsed = api_start.elapsed();

        if instances.is_empty() {
            tracing::info!(object = %self.base.object, "Remote reports no instances");
        }

        let parse_start = Instant::now();
        self.base.matrix.reset();
        let mut count = 0u64;

        for instance in &instances {
            let Some(key) = self.instance_key(instance) else {
                continue;
            };
            if self.base.matrix.get_instance(&key).is_none() {
                self.base.matrix.new_instance(key.clone())?;
            }

            for def in &self.counters {
                let Some(node) = node_path(instance, &def.path) else {
                    continue;
                };
                let content = node.content().to_string();
                match def.kind {
                    CounterKind::Key | CounterKind::Label => {
                        if let Some(row) = self.base.matrix.get_instance_mut(&key) {
                            row.set_label(def.display.clone(), content);
                            count += 1;
                        }
                    }
                    CounterKind::Metric => {
                        match self.base.matrix.set_value_string(&def.display, &key, &content)
                        {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::zapi::parse_document;
    use oxpoll_common::config::Credentials;

    const TEMPLATE: &str = r#"
name: Volume
query: volume-get-iter
object: volume
counters:
  - ^^volume-id-attributes.name => volume
  - ^volume-id-attributes.owning-vserver-name => svm
  - volume-space-attributes.size-used => size_used
"#;

    fn collector() -> Zapi {
        let params = Node::from_yaml_str("volume", TEMPLATE).unwrap();
        let base = CollectorBase::new("p1", "Zapi", "Volume", params).unwrap();
        let client = ZapiClient::new(
            "127.0.0.1",
            Credentials {
                username: "admin".to_string(),
                ..Credentials::default()
            },
            1,
            true,
            None,
        )
        .unwrap();
        Zapi::new(base, client).unwrap()
    }

    #[test]
    fn instance_key_walks_the_document() {
        let zapi = collector();
        let xml = r#"<volume-attributes>
            <volume-id-attributes>
              <name>vol0</name>
              <owning-vserver-name>svm1</owning-vserver-name>
            </volume-id-attributes>
          </volume-attributes>"#;
        let instance = parse_document(xml).unwrap();
        assert_eq!(zapi.instance_key(&instance), Some("vol0".to_string()));
    }

    #[test]
    fn template_without_query_is_rejected() {
        let params = Node::from_yaml_str("t", "counters:\n  - ^^a\n").unwrap();
        let base = CollectorBase::new("p1", "Zapi", "Volume", params).unwrap();
        let client = ZapiClient::new("127.0.0.1", Credentials::default(), 1, true, None).unwrap();
        assert!(matches!(Zapi::new(base, client), Err(Error::Config(_))));
    }
}
