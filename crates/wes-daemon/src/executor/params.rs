// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow parameter conversion for backend submission.

use serde_json::{Map, Value};
use wes_core::WorkflowType;

/// Parameter key naming the backend workflow. Never forwarded as an input.
pub const WORKFLOW_ID_PARAM: &str = "workflow_id";

/// Convert run parameters into backend inputs.
///
/// CWL runs keep `{"class": "File", "path": ...}` objects as they are; every
/// other workflow type gets the bare path, both for single values and inside
/// lists. Non-object parameters produce an empty input map.
pub fn convert_params(params: &Value, workflow_type: Option<WorkflowType>) -> Map<String, Value> {
    let keep_file_objects = workflow_type == Some(WorkflowType::Cwl);
    let Some(object) = params.as_object() else {
        return Map::new();
    };

    object
        .iter()
        .filter(|(key, _)| key.as_str() != WORKFLOW_ID_PARAM)
        .map(|(key, value)| {
            let converted = match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| convert_value(item, keep_file_objects))
                        .collect(),
                ),
                other => convert_value(other, keep_file_objects),
            };
            (key.clone(), converted)
        })
        .collect()
}

fn convert_value(value: &Value, keep_file_objects: bool) -> Value {
    match file_path(value) {
        Some(path) if !keep_file_objects => Value::String(path.to_string()),
        _ => value.clone(),
    }
}

/// The `path` of a CWL `File` object.
fn file_path(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.get("class").and_then(Value::as_str) != Some("File") {
        return None;
    }
    object.get("path").and_then(Value::as_str)
}
