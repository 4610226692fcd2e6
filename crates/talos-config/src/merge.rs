//! MERGE / RESET semantics for component configuration.
//!
//! A deployment carries, per component, an optional configuration update:
//! `reset` restores JSON Pointer paths to the recipe defaults (or removes
//! them when no default exists), then `merge` deep-overlays a document.
//! Scalars replace by value, lists replace wholesale, objects merge
//! recursively.

use serde_json::Value;

use talos_core::ConfigurationUpdate;

/// Computes the proposed configuration for one component.
///
/// `current` is the live configuration (absent for a component being
/// installed), `defaults` is the recipe's default configuration.
#[must_use]
pub fn proposed_configuration(
    current: Option<&Value>,
    defaults: &Value,
    update: Option<&ConfigurationUpdate>,
) -> Value {
    let mut proposed = current.cloned().unwrap_or_else(|| defaults.clone());

    let Some(update) = update else {
        return proposed;
    };

    if let Some(reset) = &update.reset {
        if reset.is_empty() {
            proposed = defaults.clone();
        } else {
            for pointer in reset {
                apply_reset(&mut proposed, defaults, pointer);
            }
        }
    }

    if let Some(merge) = &update.merge {
        deep_merge(&mut proposed, merge);
    }

    proposed
}

/// Deep-merges `overlay` into `base`.
///
/// Objects merge key-wise; anything else (scalars, lists) replaces the base
/// value. Keys present in `base` but absent from `overlay` are preserved.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_child) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_child) => deep_merge(base_child, overlay_child),
                    None => {
                        base_map.insert(key.clone(), overlay_child.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Restores one JSON Pointer path to the recipe default, or removes it when
/// no default exists. An empty pointer resets the whole document.
pub fn apply_reset(base: &mut Value, defaults: &Value, pointer: &str) {
    if pointer.is_empty() {
        *base = defaults.clone();
        return;
    }

    match defaults.pointer(pointer) {
        Some(default) => set_pointer(base, pointer, default.clone()),
        None => remove_pointer(base, pointer),
    }
}

fn pointer_tokens(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// Sets `value` at `pointer`, creating intermediate objects as needed.
fn set_pointer(base: &mut Value, pointer: &str, value: Value) {
    let tokens = pointer_tokens(pointer);
    let Some((last, prefix)) = tokens.split_last() else {
        return;
    };

    let mut node = base;
    for token in prefix {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            _ => return,
        };
    }

    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = node.as_object_mut() {
        map.insert(last.clone(), value);
    }
}

/// Removes the value at `pointer`, if present.
fn remove_pointer(base: &mut Value, pointer: &str) {
    let tokens = pointer_tokens(pointer);
    let Some((last, prefix)) = tokens.split_last() else {
        return;
    };

    let mut node = base;
    for token in prefix {
        match node.get_mut(token) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(map) = node.as_object_mut() {
        map.remove(last);
    }
}
