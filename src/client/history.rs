//! Execution history payloads.
//!
//! The backend stores each history entry's prompt as a positional five-tuple
//! and each status message as a `[type, data]` pair; both are decoded into
//! named fields here.

use std::collections::HashMap;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::protocol::ExecutionData;

/// `GET /api/history` response, keyed by prompt id.
pub type HistoryResp = HashMap<String, HistoryEntry>;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    /// Node id to raw output mapping.
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
    pub prompt: PromptRecord,
    #[serde(default)]
    pub status: StatusRecord,
}

/// The queued prompt, stored as
/// `[number, prompt_id, workflow, extra_data, output_node_ids]`.
#[derive(Debug, Clone, Default)]
pub struct PromptRecord {
    pub number: u64,
    pub prompt_id: String,
    pub workflow: Value,
    pub extra_data: Value,
    pub output_node_ids: Vec<String>,
}

impl<'de> Deserialize<'de> for PromptRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = PromptRecord;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a prompt record array of 5 elements")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<PromptRecord, A::Error> {
                let mut next = |idx: usize| -> Result<Value, A::Error> {
                    seq.next_element::<Value>()?
                        .ok_or_else(|| de::Error::invalid_length(idx, &"5 elements"))
                };
                let number = next(0)?;
                let prompt_id = next(1)?;
                let workflow = next(2)?;
                let extra_data = next(3)?;
                let output_node_ids = next(4)?;
                if seq.next_element::<Value>()?.is_some() {
                    return Err(de::Error::custom("unexpected array length"));
                }

                Ok(PromptRecord {
                    number: number.as_u64().ok_or_else(|| de::Error::custom("number"))?,
                    prompt_id: prompt_id
                        .as_str()
                        .ok_or_else(|| de::Error::custom("prompt_id"))?
                        .to_string(),
                    workflow,
                    extra_data,
                    output_node_ids: serde_json::from_value(output_node_ids)
                        .map_err(de::Error::custom)?,
                })
            }
        }

        deserializer.deserialize_seq(RecordVisitor)
    }
}

/// Terminal status of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusRecord {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub messages: Vec<StatusMessage>,
}

/// One `[type, data]` status message.
#[derive(Debug, Clone, Default)]
pub struct StatusMessage {
    pub kind: String,
    pub data: ExecutionData,
}

impl<'de> Deserialize<'de> for StatusMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = StatusMessage;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a [type, data] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<StatusMessage, A::Error> {
                let kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let data: ExecutionData = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                if seq.next_element::<Value>()?.is_some() {
                    return Err(de::Error::custom("unexpected array length"));
                }
                Ok(StatusMessage { kind, data })
            }
        }

        deserializer.deserialize_seq(MessageVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_decodes_execution_start() {
        let raw = r#"[
            "execution_start",
            {"prompt_id": "4c1484b8-8b71-4c92-a1e8-6179c56fe67c", "timestamp": 1722433626779}
        ]"#;
        let msg: StatusMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "execution_start");
        assert_eq!(msg.data.prompt_id, "4c1484b8-8b71-4c92-a1e8-6179c56fe67c");
        assert_eq!(msg.data.timestamp, Some(1722433626779));
        assert!(msg.data.nodes.is_empty());
    }

    #[test]
    fn status_message_decodes_cached_nodes() {
        let raw = r#"[
            "execution_cached",
            {"nodes": ["9", "8", "6"], "prompt_id": "p", "timestamp": 1722433626780}
        ]"#;
        let msg: StatusMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "execution_cached");
        assert_eq!(msg.data.nodes, ["9", "8", "6"]);
    }

    #[test]
    fn prompt_record_decodes_the_five_tuple() {
        let raw = r#"[
            12,
            "prompt-1",
            {"1": {"class_type": "KSampler", "inputs": {}}},
            {"client_id": "c"},
            ["9"]
        ]"#;
        let record: PromptRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.number, 12);
        assert_eq!(record.prompt_id, "prompt-1");
        assert_eq!(record.output_node_ids, ["9"]);
        assert!(record.workflow.get("1").is_some());

        assert!(serde_json::from_str::<PromptRecord>(r#"[1, "p", {}]"#).is_err());
    }

    #[test]
    fn history_entry_decodes_end_to_end() {
        let raw = r#"{
            "abc": {
                "outputs": {"9": {"images": [{"filename": "x.png", "subfolder": "", "type": "output"}]}},
                "prompt": [0, "abc", {}, {}, ["9"]],
                "status": {
                    "completed": true,
                    "status_str": "success",
                    "messages": [["execution_start", {"prompt_id": "abc"}]]
                }
            }
        }"#;
        let history: HistoryResp = serde_json::from_str(raw).unwrap();
        let entry = &history["abc"];
        assert!(entry.status.completed);
        assert_eq!(entry.prompt.prompt_id, "abc");
        assert_eq!(entry.status.messages[0].kind, "execution_start");
        assert!(entry.outputs.contains_key("9"));
    }
}
