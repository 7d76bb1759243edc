//! Graph-to-API-prompt conversion.
//!
//! Reroute and variable-indirection nodes never appear in the API prompt:
//! every link through them is resolved back to the original producing node.
//! Widget values are bound to parameter names by walking the node schema in
//! declaration order.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use super::object_info::{InputDef, NodeInfoFetcher};
use super::{ApiPrompt, GraphData, PromptEntry, PromptEntryMeta};
use crate::error::{Error, Result};
use crate::node::PreNode;

/// Node types that redirect their input to their output.
const REROUTE_TYPES: [&str; 3] = ["Reroute", "Reroute (rgthree)", "SetNode"];

/// Node types that never appear in the API prompt.
const SKIPPED_TYPES: [&str; 8] = [
    "Note",
    "Note Plus (mtb)",
    "Note _O",
    "Reroute",
    "Reroute (rgthree)",
    "SetNode",
    "GetNode",
    "PrimitiveNode",
];

/// Map-shaped widget keys copied through verbatim before schema coercion
/// (VHS_VideoCombine encodes these outside its declared inputs).
const MAP_OVERRIDE_KEYS: [&str; 3] = ["pix_fmt", "crf", "save_metadata"];

/// Converts author-facing graphs into API prompts using a schema fetcher.
pub struct GraphConverter<F> {
    fetcher: F,
}

impl<F: NodeInfoFetcher> GraphConverter<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Convert a raw graph document into pretty-printed API-prompt JSON.
    pub async fn convert(&self, graph: &str) -> Result<String> {
        let data: GraphData = serde_json::from_str(graph)?;
        let prompt = self.convert_graph(&data).await?;
        Ok(serde_json::to_string_pretty(&prompt)?)
    }

    /// Convert a parsed graph into the flat prompt form.
    pub async fn convert_graph(&self, data: &GraphData) -> Result<ApiPrompt> {
        let node_map: HashMap<&str, &super::GraphNode> =
            data.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        // First pass over links: collect redirect bindings, named variables
        // and primitive values.
        let mut redirects: HashMap<String, PreNode> = HashMap::new();
        let mut variables: HashMap<String, PreNode> = HashMap::new();
        let mut primitives: HashMap<String, &Value> = HashMap::new();
        let mut link_map: HashMap<&str, &super::GraphLink> = HashMap::new();

        for link in &data.links {
            link_map.insert(link.id.as_str(), link);

            if let Some(node) = node_map.get(link.to_node.as_str()) {
                if REROUTE_TYPES.contains(&node.kind.as_str()) {
                    let source = PreNode::new(link.from_node.clone(), link.from_slot);
                    redirects.insert(link.to_node.clone(), source.clone());

                    if node.kind == "SetNode" {
                        if let Some(name) = first_widget_str(node.widgets_values.as_ref()) {
                            variables.insert(name.to_string(), source);
                        }
                    }
                }
            }

            if let Some(node) = node_map.get(link.from_node.as_str()) {
                if node.kind == "PrimitiveNode" {
                    if let Some(values) = node.widgets_values.as_ref() {
                        primitives.insert(node.id.clone(), values);
                    }
                }
            }
        }

        // Bind every GetNode to the variable its SetNode declared.
        for node in &data.nodes {
            if node.kind != "GetNode" {
                continue;
            }
            if let Some(name) = first_widget_str(node.widgets_values.as_ref()) {
                if let Some(source) = variables.get(name) {
                    redirects.insert(node.id.clone(), source.clone());
                }
            }
        }

        let mut prompt = ApiPrompt::new();
        for node in &data.nodes {
            if SKIPPED_TYPES.contains(&node.kind.as_str()) {
                continue;
            }

            let info = self.fetcher.fetch_node_info(&node.kind).await.map_err(|e| {
                Error::Validation(format!("get node info for {}: {e}", node.kind))
            })?;

            let mut inputs = Map::new();
            let mut linked: HashSet<&str> = HashSet::new();
            let mut has_widget: HashSet<&str> = HashSet::new();

            // 1. Linked inputs, resolved through the redirect chains.
            for input in &node.inputs {
                if let Some(link) = input.link.as_deref().and_then(|id| link_map.get(id)) {
                    let source = find_original_source(&mut redirects, &link.from_node)
                        .unwrap_or_else(|| PreNode::new(link.from_node.clone(), link.from_slot));

                    if let Some(primitive) = primitives.get(source.id.as_str()) {
                        if let Some(first) = primitive.as_array().and_then(|a| a.first()) {
                            inputs.insert(input.name.clone(), first.clone());
                        }
                    } else {
                        inputs.insert(input.name.clone(), json!([source.id, source.slot]));
                    }
                    linked.insert(input.name.as_str());
                }
                if input.widget.is_some() {
                    has_widget.insert(input.name.as_str());
                }
            }

            // 2. Optional parameters start from their schema defaults.
            for (name, def) in &info.input.optional {
                if let Some(default) = def.get(1).and_then(|o| o.get("default")) {
                    inputs.insert(name.clone(), default.clone());
                }
            }

            // 3. Widget values, either positional or name-keyed.
            match node.widgets_values.as_ref() {
                Some(Value::Array(widgets)) => {
                    let mut cursor = 0usize;
                    for name in &info.input_order.required {
                        if linked.contains(name.as_str()) {
                            if has_widget.contains(name.as_str()) {
                                cursor += if name == "seed" || name == "noise_seed" {
                                    2
                                } else {
                                    1
                                };
                            }
                            continue;
                        }
                        if cursor >= widgets.len() {
                            break;
                        }
                        let Some(def) = info.input.required.get(name) else {
                            continue;
                        };
                        cursor = bind_positional(&mut inputs, name, def, widgets, cursor);
                    }
                    for name in &info.input_order.optional {
                        if linked.contains(name.as_str()) {
                            if has_widget.contains(name.as_str()) {
                                cursor += 1;
                            }
                            continue;
                        }
                        if cursor >= widgets.len() {
                            break;
                        }
                        let Some(def) = info.input.optional.get(name) else {
                            continue;
                        };
                        cursor = bind_positional(&mut inputs, name, def, widgets, cursor);
                    }
                }
                Some(Value::Object(widgets)) => {
                    for key in MAP_OVERRIDE_KEYS {
                        if let Some(value) = widgets.get(key) {
                            inputs.insert(key.to_string(), value.clone());
                        }
                    }
                    for (name, def) in &info.input.required {
                        if linked.contains(name.as_str()) {
                            continue;
                        }
                        if let Some(value) = widgets.get(name) {
                            bind_named(&mut inputs, name, def, value);
                        }
                    }
                    for (name, def) in &info.input.optional {
                        if linked.contains(name.as_str()) {
                            continue;
                        }
                        if let Some(value) = widgets.get(name) {
                            bind_named(&mut inputs, name, def, value);
                        }
                    }
                }
                _ => {}
            }

            let title = node
                .title
                .clone()
                .unwrap_or_else(|| info.display_name.clone());

            prompt.insert(
                node.id.clone(),
                PromptEntry {
                    inputs,
                    class_type: node.kind.clone(),
                    meta: PromptEntryMeta { title },
                },
            );
        }

        Ok(prompt)
    }
}

fn first_widget_str(widgets: Option<&Value>) -> Option<&str> {
    widgets?.as_array()?.first()?.as_str()
}

/// Follow the redirect map to the original producing node, compressing the
/// chain as it goes so later queries resolve in one hop.
fn find_original_source(redirects: &mut HashMap<String, PreNode>, node_id: &str) -> Option<PreNode> {
    let mut last = redirects.get(node_id)?.clone();
    loop {
        let next_id = last.id.clone();
        let Some(next) = find_original_source(redirects, &next_id) else {
            break;
        };
        if next.id == last.id {
            break;
        }
        redirects.insert(node_id.to_string(), next.clone());
        last = next;
    }
    Some(last)
}

/// Consume widget values for one positional parameter, returning the new
/// cursor position.
fn bind_positional(
    inputs: &mut Map<String, Value>,
    name: &str,
    def: &InputDef,
    widgets: &[Value],
    cursor: usize,
) -> usize {
    let widget = &widgets[cursor];
    if widget.is_null() {
        return cursor + 1;
    }

    mark_upload(inputs, name, def);

    let Some(tag) = def.first() else {
        return cursor + 1;
    };

    // Choice lists take the widget value as-is.
    if tag.is_array() {
        inputs.insert(name.to_string(), widget.clone());
        return cursor + 1;
    }
    let Some(tag) = tag.as_str() else {
        return cursor + 1;
    };

    match tag {
        "INT" => {
            if let Some(v) = widget.as_f64() {
                inputs.insert(name.to_string(), json!(v as i64));
            }
            if name == "seed" || name == "noise_seed" {
                // The editor stores the "control after generate" flag in the
                // slot right after the seed value.
                return cursor + 2;
            }
        }
        "FLOAT" => {
            if let Some(v) = widget.as_f64() {
                inputs.insert(name.to_string(), json!(v));
            }
        }
        "STRING" => {
            if widget.is_string() {
                inputs.insert(name.to_string(), widget.clone());
            }
        }
        "BOOLEAN" => {
            inputs.insert(name.to_string(), widget.clone());
        }
        other => {
            // Non-scalar parameter with no widget slot of its own; leave the
            // cursor where it is.
            debug!(param = name, tag = other, "skipping non-scalar widget parameter");
            return cursor;
        }
    }

    cursor + 1
}

/// Bind one name-keyed widget value.
fn bind_named(inputs: &mut Map<String, Value>, name: &str, def: &InputDef, value: &Value) {
    if value.is_null() {
        return;
    }

    mark_upload(inputs, name, def);

    let Some(tag) = def.first() else {
        return;
    };
    if tag.is_array() {
        inputs.insert(name.to_string(), value.clone());
        return;
    }
    let Some(tag) = tag.as_str() else {
        return;
    };

    match tag {
        "INT" => {
            if let Some(v) = value.as_f64() {
                inputs.insert(name.to_string(), json!(v as i64));
            }
        }
        "FLOAT" => {
            if let Some(v) = value.as_f64() {
                inputs.insert(name.to_string(), json!(v));
            }
        }
        "STRING" => {
            if value.is_string() {
                inputs.insert(name.to_string(), value.clone());
            }
        }
        "BOOLEAN" => {
            if value.is_boolean() {
                inputs.insert(name.to_string(), value.clone());
            }
        }
        _ => {}
    }
}

/// Parameters flagged `image_upload` get a companion `upload` input naming
/// them.
fn mark_upload(inputs: &mut Map<String, Value>, name: &str, def: &InputDef) {
    if let Some(options) = def.get(1).and_then(Value::as_object) {
        if options.get("image_upload") == Some(&Value::Bool(true)) {
            inputs.insert("upload".to_string(), json!(name));
        }
    }
}
