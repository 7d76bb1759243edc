//! API-prompt node values.
//!
//! A [`PreNode`] is the two-element reference `["node_id", slot]` that binds a
//! node input to another node's output in the flat API-prompt form.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

/// Reference to an upstream node output: id plus output slot index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreNode {
    pub id: String,
    pub slot: i64,
}

impl PreNode {
    pub fn new(id: impl Into<String>, slot: i64) -> Self {
        Self {
            id: id.into(),
            slot,
        }
    }
}

impl Serialize for PreNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.id)?;
        seq.serialize_element(&self.slot)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PreNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PreNodeVisitor;

        impl<'de> Visitor<'de> for PreNodeVisitor {
            type Value = PreNode;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a [node_id, slot] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<PreNode, A::Error> {
                let id: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let slot: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                // drain any trailing elements
                while seq.next_element::<serde_json::Value>()?.is_some() {}
                Ok(PreNode {
                    id,
                    slot: slot as i64,
                })
            }
        }

        deserializer.deserialize_seq(PreNodeVisitor)
    }
}

/// One entry of an API prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiNode {
    pub class_type: String,
    pub inputs: serde_json::Value,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub title: String,
}

/// Builder for the websocket image-save node the driver substitutes for
/// regular save nodes. The node streams its images back over the WebSocket
/// with the 8-byte binary header instead of writing them server-side.
#[derive(Debug, Clone)]
pub struct SaveImageWebsocket {
    pub images: PreNode,
    pub enable_metadata: bool,
}

impl SaveImageWebsocket {
    /// Class emitted when prompt metadata should be embedded in the images.
    pub const CLASS_WITH_METADATA: &'static str = "SaveImageWithPromptsWebsocket";
    pub const CLASS: &'static str = "SaveImageWebsocket";

    pub fn build(self) -> ApiNode {
        let class_type = if self.enable_metadata {
            Self::CLASS_WITH_METADATA
        } else {
            Self::CLASS
        };
        ApiNode {
            class_type: class_type.to_string(),
            inputs: json!({ "images": self.images }),
            meta: None,
        }
    }
}
