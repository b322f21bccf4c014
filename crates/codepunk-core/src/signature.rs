// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Deterministic identity of a tool call, used to detect the model issuing
/// the same call across iterations.
///
/// Lowercased tool name plus the canonical JSON of the arguments: object
/// keys recursively sorted, compact encoding. Two calls with the same
/// semantic arguments produce the same signature regardless of key order.
pub fn stable_signature(name: &str, arguments: &Value) -> String {
    format!("{}#{}", name.to_lowercase(), canonical_json(arguments))
}

fn canonical_json(v: &Value) -> String {
    canonicalize(v).to_string()
}

fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, val) in entries {
                out.insert(k.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
