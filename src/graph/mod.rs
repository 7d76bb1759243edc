//! Author-facing graph form and its conversion to the flat API prompt.
//!
//! The graph is the node-and-link document produced by the editor UI. Node and
//! link identifiers arrive as JSON numbers but are handled as strings
//! throughout, matching the id form of the API prompt.

mod converter;
mod object_info;

pub use converter::GraphConverter;
pub use object_info::{
    DirNodeInfoFetcher, HttpNodeInfoFetcher, InputDef, InputOrder, NodeInfo, NodeInfoFetcher,
    NodeInput,
};

use std::collections::BTreeMap;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A full graph document. Fields other than nodes and links are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphData {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub links: Vec<GraphLink>,
}

/// One graph node.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphNode {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<GraphNodeInput>,
    #[serde(default)]
    pub title: Option<String>,
    /// Ordered sequence or name-keyed mapping, depending on the node family.
    #[serde(default)]
    pub widgets_values: Option<Value>,
}

/// A declared input slot of a graph node.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphNodeInput {
    pub name: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub link: Option<String>,
    /// Present when the input doubles as an inline widget.
    #[serde(default)]
    pub widget: Option<Value>,
}

/// A link, decoded from the 6-element array form
/// `[id, from_node, from_slot, to_node, to_slot, data_type]`.
#[derive(Debug, Clone)]
pub struct GraphLink {
    pub id: String,
    pub from_node: String,
    pub from_slot: i64,
    pub to_node: String,
    pub to_slot: i64,
    pub data_type: String,
}

impl<'de> Deserialize<'de> for GraphLink {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LinkVisitor;

        impl<'de> Visitor<'de> for LinkVisitor {
            type Value = GraphLink;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a link array of at least 6 elements")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<GraphLink, A::Error> {
                let mut elements: Vec<Value> = Vec::with_capacity(6);
                while let Some(v) = seq.next_element()? {
                    elements.push(v);
                }
                if elements.len() < 6 {
                    return Err(de::Error::custom("link must have at least 6 elements"));
                }

                let slot = |v: &Value| v.as_f64().map(|f| f as i64).unwrap_or_default();
                Ok(GraphLink {
                    id: coerce_id(&elements[0]),
                    from_node: coerce_id(&elements[1]),
                    from_slot: slot(&elements[2]),
                    to_node: coerce_id(&elements[3]),
                    to_slot: slot(&elements[4]),
                    data_type: coerce_id(&elements[5]),
                })
            }
        }

        deserializer.deserialize_seq(LinkVisitor)
    }
}

fn coerce_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::String(_) | Value::Number(_) => Ok(coerce_id(&v)),
        other => Err(de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let v = Option::<Value>::deserialize(deserializer)?;
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v @ (Value::String(_) | Value::Number(_))) => Ok(Some(coerce_id(&v))),
        Some(other) => Err(de::Error::custom(format!("invalid link id: {other}"))),
    }
}

/// Flat API-prompt form: node id to entry, emitted with stable key order.
pub type ApiPrompt = BTreeMap<String, PromptEntry>;

/// One API-prompt entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub inputs: serde_json::Map<String, Value>,
    pub class_type: String,
    #[serde(rename = "_meta")]
    pub meta: PromptEntryMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntryMeta {
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_coerced_to_strings() {
        let node: GraphNode = serde_json::from_str(
            r#"{"id": 42, "type": "KSampler", "inputs": [{"name": "model", "link": 9}]}"#,
        )
        .unwrap();
        assert_eq!(node.id, "42");
        assert_eq!(node.inputs[0].link.as_deref(), Some("9"));
    }

    #[test]
    fn null_links_stay_unset() {
        let node: GraphNode = serde_json::from_str(
            r#"{"id": 1, "type": "LoadImage", "inputs": [{"name": "image", "link": null}]}"#,
        )
        .unwrap();
        assert!(node.inputs[0].link.is_none());
    }

    #[test]
    fn links_decode_from_arrays() {
        let link: GraphLink = serde_json::from_str(r#"[12, 3, 0, 7, 1, "MODEL"]"#).unwrap();
        assert_eq!(link.id, "12");
        assert_eq!(link.from_node, "3");
        assert_eq!(link.from_slot, 0);
        assert_eq!(link.to_node, "7");
        assert_eq!(link.to_slot, 1);
        assert_eq!(link.data_type, "MODEL");

        assert!(serde_json::from_str::<GraphLink>(r#"[1, 2, 0]"#).is_err());
    }
}
