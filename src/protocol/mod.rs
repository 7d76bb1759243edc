//! Wire protocol for the backend's WebSocket event stream.
//!
//! Text frames carry `{type, data}` JSON events describing per-node execution
//! progress; binary frames carry preview-image bytes (see [`binary`]). Event
//! payloads are decoded per type; unknown types are kept opaque so the stream
//! keeps flowing when the backend grows new message kinds.

mod binary;

pub use binary::{BinaryFrame, ImageKind, PREVIEW_IMAGE};

use serde::de::value::MapAccessDeserializer;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};

const EXCEPTION_TYPE_OOM: &str = "torch.OutOfMemoryError";
const EXCEPTION_TYPE_RUNTIME: &str = "RuntimeError";

/// A decoded text-frame event.
#[derive(Debug, Clone)]
pub enum Event {
    Status(StatusData),
    Progress(ProgressData),
    Executing(ExecutingData),
    Executed(ExecutedData),
    ExecutionStart(ExecutionData),
    ExecutionSuccess(ExecutionData),
    ExecutionCached(ExecutionData),
    ExecutionError(ExecutionErrorData),
    ExecutionInterrupted(ExecutionInterruptedData),
    /// Unrecognized event type; the payload is not decoded.
    Other(String),
}

impl Event {
    /// Decode one text frame. Events with a known type but missing or
    /// malformed payloads are errors; unknown types decode to [`Event::Other`].
    pub fn parse(raw: &str) -> Result<Event> {
        #[derive(Deserialize)]
        struct Envelope<'a> {
            #[serde(rename = "type")]
            kind: String,
            #[serde(borrow)]
            data: Option<&'a RawValue>,
        }

        fn payload<'a, T: Deserialize<'a>>(kind: &str, data: Option<&'a RawValue>) -> Result<T> {
            let raw = data
                .ok_or_else(|| Error::Validation(format!("event {kind:?} without data")))?;
            Ok(serde_json::from_str(raw.get())?)
        }

        let Envelope { kind, data } = serde_json::from_str(raw)?;
        Ok(match kind.as_str() {
            "status" => Event::Status(payload(&kind, data)?),
            "progress" => Event::Progress(payload(&kind, data)?),
            "executing" => Event::Executing(payload(&kind, data)?),
            "executed" => Event::Executed(payload(&kind, data)?),
            "execution_start" => Event::ExecutionStart(payload(&kind, data)?),
            "execution_success" => Event::ExecutionSuccess(payload(&kind, data)?),
            "execution_cached" => Event::ExecutionCached(payload(&kind, data)?),
            "execution_error" => Event::ExecutionError(payload(&kind, data)?),
            "execution_interrupted" => Event::ExecutionInterrupted(payload(&kind, data)?),
            _ => Event::Other(kind),
        })
    }

    /// Prompt id carried by the event, when it has one.
    pub fn prompt_id(&self) -> Option<&str> {
        let id = match self {
            Event::Status(_) | Event::Other(_) => return None,
            Event::Progress(d) => &d.executing.prompt_id,
            Event::Executing(d) => &d.prompt_id,
            Event::Executed(d) => &d.executing.prompt_id,
            Event::ExecutionStart(d) | Event::ExecutionSuccess(d) | Event::ExecutionCached(d) => {
                &d.prompt_id
            }
            Event::ExecutionError(d) => &d.interrupted.prompt_id,
            Event::ExecutionInterrupted(d) => &d.prompt_id,
        };
        Some(id.as_str())
    }
}

/// `status` payload: queue depth broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub status: StatusBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusBody {
    #[serde(default)]
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecInfo {
    #[serde(default)]
    pub queue_remaining: i64,
}

/// `executing` payload. `node == None` marks the terminal event of a prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutingData {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub display_node: Option<String>,
}

/// `progress` payload. The backend emits `value`/`max` as either integers or
/// floats depending on the node, so both are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    #[serde(flatten)]
    pub executing: ExecutingData,
    #[serde(deserialize_with = "lenient_int")]
    pub value: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub max: i64,
}

fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    Ok(n as i64)
}

/// `executed` payload: one node finished and published its outputs.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    #[serde(flatten)]
    pub executing: ExecutingData,
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
}

/// Payload shared by `execution_start` / `execution_success` /
/// `execution_cached`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionData {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// `execution_interrupted` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionInterruptedData {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub executed: Vec<String>,
}

/// `execution_error` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionErrorData {
    #[serde(flatten)]
    pub interrupted: ExecutionInterruptedData,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
    #[serde(default)]
    pub traceback: Option<serde_json::Value>,
    #[serde(default)]
    pub current_inputs: Option<serde_json::Value>,
    #[serde(default)]
    pub current_outputs: Option<serde_json::Value>,
}

impl ExecutionErrorData {
    /// Out-of-memory detection: either torch's dedicated exception type, or a
    /// generic `RuntimeError` whose message mentions running out of memory.
    pub fn is_oom(&self) -> bool {
        match self.exception_type.as_str() {
            EXCEPTION_TYPE_OOM => true,
            EXCEPTION_TYPE_RUNTIME => self.exception_message.contains("out of memory"),
            _ => false,
        }
    }
}

/// A rendered artifact referenced by an `executed` event or a history entry.
///
/// Unknown sibling fields (frame rates, format hints from custom nodes) are
/// preserved across a decode/encode round trip.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl<'de> Deserialize<'de> for FileInfo {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FileInfoVisitor;

        impl<'de> Visitor<'de> for FileInfoVisitor {
            type Value = FileInfo;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a file info object")
            }

            fn visit_map<A>(self, map: A) -> std::result::Result<FileInfo, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut extra: serde_json::Map<String, serde_json::Value> =
                    Deserialize::deserialize(MapAccessDeserializer::new(map))?;

                let mut take_string = |key: &str| -> std::result::Result<String, A::Error> {
                    match extra.remove(key) {
                        Some(serde_json::Value::String(s)) => Ok(s),
                        Some(_) => Err(de::Error::custom(format!("{key} is not a string"))),
                        None => Err(de::Error::custom(format!("missing field {key}"))),
                    }
                };

                Ok(FileInfo {
                    filename: take_string("filename")?,
                    subfolder: take_string("subfolder")?,
                    kind: take_string("type")?,
                    extra,
                })
            }
        }

        deserializer.deserialize_map(FileInfoVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_executing_with_node() {
        let raw = r#"{"type":"executing","data":{"prompt_id":"p1","node":"7"}}"#;
        match Event::parse(raw).unwrap() {
            Event::Executing(d) => {
                assert_eq!(d.prompt_id, "p1");
                assert_eq!(d.node.as_deref(), Some("7"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_executing_final() {
        let raw = r#"{"type":"executing","data":{"prompt_id":"p1","node":null}}"#;
        match Event::parse(raw).unwrap() {
            Event::Executing(d) => assert!(d.node.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_opaque() {
        let raw = r#"{"type":"crystools.monitor","data":{"cpu":12.5}}"#;
        match Event::parse(raw).unwrap() {
            Event::Other(kind) => assert_eq!(kind, "crystools.monitor"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn known_event_without_data_is_an_error() {
        assert!(Event::parse(r#"{"type":"executing"}"#).is_err());
    }

    #[test]
    fn progress_accepts_float_and_int() {
        let raw = r#"{"type":"progress","data":{"prompt_id":"p","value":3.0,"max":20}}"#;
        match Event::parse(raw).unwrap() {
            Event::Progress(d) => {
                assert_eq!(d.value, 3);
                assert_eq!(d.max, 20);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn oom_detection() {
        let oom = ExecutionErrorData {
            exception_type: "torch.OutOfMemoryError".into(),
            ..Default::default()
        };
        assert!(oom.is_oom());

        let runtime_oom = ExecutionErrorData {
            exception_type: "RuntimeError".into(),
            exception_message: "CUDA error: out of memory".into(),
            ..Default::default()
        };
        assert!(runtime_oom.is_oom());

        let plain = ExecutionErrorData {
            exception_type: "RuntimeError".into(),
            exception_message: "shape mismatch".into(),
            ..Default::default()
        };
        assert!(!plain.is_oom());
    }

    #[test]
    fn file_info_keeps_unknown_fields() {
        let raw = r#"{"filename":"x.png","subfolder":"out","type":"output","frame_rate":8,"format":"image/png"}"#;
        let mut info: FileInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.filename, "x.png");
        assert_eq!(info.extra["frame_rate"], 8);

        info.filename = "y.png".to_string();
        info.subfolder = "renamed".to_string();
        let out: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(out["filename"], "y.png");
        assert_eq!(out["subfolder"], "renamed");
        assert_eq!(out["frame_rate"], 8);
        assert_eq!(out["format"], "image/png");
    }

    #[test]
    fn file_info_rejects_non_string_filename() {
        assert!(serde_json::from_str::<FileInfo>(r#"{"filename":123,"subfolder":"","type":"t"}"#).is_err());
    }
}
