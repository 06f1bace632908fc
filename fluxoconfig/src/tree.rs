//! Helpers over the raw `serde_yaml::Value` tree backing [`crate::Config`].
//!
//! Keys are compared lower-cased everywhere: the tree is normalised once at
//! load time and every lookup lower-cases the requested path.

use anyhow::{bail, Result};
use serde_yaml::{Mapping, Value};

fn key(segment: &str) -> Value {
    Value::String(segment.to_lowercase())
}

/// Recursively lower-cases every string key.
pub(crate) fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Mapping(entries) => Value::Mapping(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, normalize_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Overlays `overlay` on `base`. Mappings are merged key by key; any other
/// overlay value replaces what `base` holds.
pub(crate) fn overlay(base: &mut Value, overlay_value: &Value) {
    if let (Value::Mapping(base_map), Value::Mapping(overlay_map)) = (&mut *base, overlay_value) {
        for (k, v) in overlay_map {
            match base_map.get_mut(k) {
                Some(existing) => overlay(existing, v),
                None => {
                    base_map.insert(k.clone(), v.clone());
                }
            }
        }
        return;
    }
    *base = overlay_value.clone();
}

/// Clones the node found at `path`.
pub(crate) fn lookup(root: &Value, path: &[&str]) -> Result<Value> {
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        let Value::Mapping(entries) = node else {
            bail!("configuration node '{}' has no children", path[..depth].join("."));
        };
        match entries.get(key(segment)) {
            Some(child) => node = child,
            None => bail!("configuration key '{}' is not set", path[..=depth].join(".")),
        }
    }
    Ok(node.clone())
}

/// Stores `value` at `path`, creating intermediate mappings as needed.
pub(crate) fn insert(root: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut node = root;
    for segment in parents {
        let Value::Mapping(entries) = node else {
            bail!("cannot set '{}': '{segment}' is not a section", path.join("."));
        };
        node = entries
            .entry(key(segment))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    match node {
        Value::Mapping(entries) => {
            entries.insert(key(last), value);
            Ok(())
        }
        _ => bail!("cannot set '{}': parent is not a section", path.join(".")),
    }
}

/// Interprets an environment variable as a YAML scalar ("42", "true", ...),
/// keeping it as a plain string when it does not parse.
pub(crate) fn parse_scalar(raw: &str) -> Value {
    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
