//! Joins volume comments onto the parent matrix: one extra REST call
//! per cycle, matched by the volume's uuid key, surfaced as a `comment`
//! label on the affected instances.

use crate::client::rest::{build_href, json_to_string, RestClient};
use crate::plugin::{Plugin, PluginContext};
use async_trait::async_trait;
use oxpoll_common::error::Result;
use oxpoll_matrix::Matrix;
use serde_json::Value;

const QUERY: &str = "api/storage/volumes";

pub fn new(context: &PluginContext) -> Result<Box<dyn Plugin>> {
    let client = RestClient::new(
        &context.addr,
        context.credentials.clone(),
        context.client_timeout,
        context.use_insecure_tls,
        None,
    )?;
    Ok(Box::new(VolumeTag { client }))
}

struct VolumeTag {
    client: RestClient,
}

#[async_trait]
impl Plugin for VolumeTag {
    fn name(&self) -> &str {
        "VolumeTag"
    }

    async fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        let href = build_href(QUERY, &["comment".to_string()], &[]);
        let records = self.client.fetch_records(&href).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tagged = 0usize;
        for volume in &records {
            let Some(uuid) = volume.get("uuid").map(json_to_string) else {
                continue;
            };
            let comment = volume.get("comment").map(json_to_string).unwrap_or_default();
            if comment.is_empty() {
                continue;
            }
            if let Some(instance) = data.get_instance_mut(&uuid) {
                instance.set_label("comment", comment);
                tagged += 1;
            }
        }

        let export = data.export_options_mut();
        if !export.include_all_labels
            && !export.instance_labels.iter().any(|l| l == "comment")
        {
            export.instance_labels.push("comment".to_string());
        }

        tracing::debug!(tagged, "Volume comments applied");
        Ok(Vec::new())
    }
}
