//! Driver-level submission envelope and response.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::QueuePromptResp;
use crate::node::{PreNode, SaveImageWebsocket};

/// One input staging instruction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputSpec {
    /// Bucket override; falls back to the request-level bucket.
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub files: Vec<String>,
    /// Managed sub-directory to stage into; defaults to `input`.
    #[serde(default)]
    pub sync_to: String,
}

/// One output routing instruction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub dir_path: String,
    /// Input field holding the image reference; defaults to `images`.
    #[serde(default)]
    pub field_name: String,
}

impl OutputSpec {
    /// Rewrite each listed node whose `field_name` input is a two-element
    /// reference into a websocket save node bound to that reference.
    /// Returns the ids that were rewritten.
    pub fn replace_nodes(
        &self,
        workflow: &mut serde_json::Map<String, Value>,
        enable_metadata: bool,
    ) -> Vec<String> {
        let field_name = if self.field_name.is_empty() {
            "images"
        } else {
            self.field_name.as_str()
        };

        let mut replaced = Vec::new();
        for node_id in &self.node_ids {
            let Some(reference) = workflow
                .get(node_id)
                .and_then(|node| node.get("inputs"))
                .and_then(|inputs| inputs.get(field_name))
            else {
                continue;
            };
            let Ok(images) = serde_json::from_value::<PreNode>(reference.clone()) else {
                continue;
            };

            let node = SaveImageWebsocket {
                images,
                enable_metadata,
            }
            .build();
            if let Ok(value) = serde_json::to_value(&node) {
                workflow.insert(node_id.clone(), value);
                replaced.push(node_id.clone());
            }
        }
        replaced
    }
}

/// Driver-level submission request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub workflow: Option<Value>,
    /// Compatibility alias: used when `workflow` is absent.
    #[serde(default)]
    pub prompt: Option<Value>,
    /// Passed through to the backend; ends up in image metadata.
    #[serde(default)]
    pub extra_data: Option<Value>,
    #[serde(default)]
    pub disable_metadata: bool,
    /// Default bucket for inputs and outputs.
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub enable_node_replace: bool,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
}

/// Collected outputs of one trigger node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeOutputDetail {
    pub node_id: String,
    pub dir_path: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<String>,
}

/// Driver-level response for one submission.
#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(flatten)]
    pub qp_resp: QueuePromptResp,
    pub outputs: Vec<NodeOutputDetail>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Time spent staging input files.
    #[serde(with = "duration_nanos")]
    pub sync_duration: Duration,
    /// Per-node execution durations.
    #[serde(with = "duration_map_nanos")]
    pub nodes_time: HashMap<String, Duration>,
    pub hostname: String,
}

/// Durations travel as integer nanoseconds on the wire.
mod duration_nanos {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }
}

mod duration_map_nanos {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::ser::SerializeMap;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &(value.as_nanos() as u64))?;
        }
        out.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_prefers_workflow_over_prompt() {
        let req: Request = serde_json::from_str(
            r#"{"prompt": {"1": {}}, "workflow": {"2": {}}, "enable_node_replace": true}"#,
        )
        .unwrap();
        assert!(req.workflow.is_some());
        assert!(req.prompt.is_some());
        assert!(req.enable_node_replace);
    }

    #[test]
    fn replace_nodes_rewrites_referenced_save_nodes() {
        let mut workflow = json!({
            "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
            "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "out", "images": ["8", 0]}}
        });
        let spec = OutputSpec {
            node_ids: vec!["9".into(), "42".into()],
            dir_path: "renders".into(),
            field_name: String::new(),
        };

        let map = workflow.as_object_mut().unwrap();
        let replaced = spec.replace_nodes(map, true);
        assert_eq!(replaced, ["9"]);

        let node = &map["9"];
        assert_eq!(node["class_type"], "SaveImageWithPromptsWebsocket");
        assert_eq!(node["inputs"]["images"], json!(["8", 0]));
        // the untouched node keeps its class
        assert_eq!(map["8"]["class_type"], "VAEDecode");
    }

    #[test]
    fn replace_nodes_skips_literal_fields() {
        let mut workflow = json!({
            "9": {"class_type": "SaveImage", "inputs": {"images": "not-a-reference"}}
        });
        let spec = OutputSpec {
            node_ids: vec!["9".into()],
            dir_path: "renders".into(),
            field_name: String::new(),
        };
        let map = workflow.as_object_mut().unwrap();
        assert!(spec.replace_nodes(map, false).is_empty());
        assert_eq!(map["9"]["class_type"], "SaveImage");
    }

    #[test]
    fn replace_nodes_honors_a_custom_field_name() {
        let mut workflow = json!({
            "5": {"class_type": "CompareImages", "inputs": {"a_images": ["2", 0]}}
        });
        let spec = OutputSpec {
            node_ids: vec!["5".into()],
            dir_path: "cmp".into(),
            field_name: "a_images".into(),
        };
        let map = workflow.as_object_mut().unwrap();
        assert_eq!(spec.replace_nodes(map, false), ["5"]);
        assert_eq!(map["5"]["class_type"], "SaveImageWebsocket");
        assert_eq!(map["5"]["inputs"]["images"], json!(["2", 0]));
    }

    #[test]
    fn response_serializes_durations_as_nanos() {
        let response = Response {
            qp_resp: QueuePromptResp {
                prompt_id: "p".into(),
                number: 1,
                node_errors: None,
            },
            outputs: vec![NodeOutputDetail {
                node_id: "9".into(),
                dir_path: "renders".into(),
                files: vec!["p_1.png".into()],
                texts: Vec::new(),
            }],
            start_time: Utc::now(),
            end_time: Utc::now(),
            sync_duration: Duration::from_millis(1500),
            nodes_time: HashMap::from([("9".to_string(), Duration::from_secs(2))]),
            hostname: "gpu-01".into(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["prompt_id"], "p");
        assert_eq!(value["sync_duration"], 1_500_000_000u64);
        assert_eq!(value["nodes_time"]["9"], 2_000_000_000u64);
        assert_eq!(value["outputs"][0]["dir_path"], "renders");
        assert!(value["outputs"][0].get("texts").is_none());
    }
}
