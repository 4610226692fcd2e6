//! Configuration token interpolation.
//!
//! After resolution, each component's configuration is rendered by
//! substituting tokens of the form `{configuration:/path}` (own
//! configuration), `{<other>:configuration:/path}` (another component's
//! configuration) and system tokens such as `{kernel:rootPath}` or
//! `{artifacts:path}`. Substitution is a single pass; unresolved tokens are
//! left literal, and substituted text is never re-scanned.

use std::collections::BTreeMap;

use serde_json::Value;

/// Lookup context for one component's interpolation pass.
#[derive(Debug)]
pub struct InterpolationContext<'a> {
    component: &'a str,
    configurations: &'a BTreeMap<String, Value>,
    system: BTreeMap<String, String>,
}

impl<'a> InterpolationContext<'a> {
    /// Creates a context for `component`, resolving cross-component tokens
    /// against `configurations` (proposed configuration per component name).
    #[must_use]
    pub const fn new(component: &'a str, configurations: &'a BTreeMap<String, Value>) -> Self {
        Self {
            component,
            configurations,
            system: BTreeMap::new(),
        }
    }

    /// Registers a system token, e.g. `kernel:rootPath` or `artifacts:path`.
    #[must_use]
    pub fn with_system(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.system.insert(token.into(), value.into());
        self
    }

    fn resolve(&self, token: &str) -> Option<String> {
        if let Some(pointer) = token.strip_prefix("configuration:") {
            return self.lookup(self.component, pointer);
        }

        if let Some((component, pointer)) = token.split_once(":configuration:") {
            return self.lookup(component, pointer);
        }

        self.system.get(token).cloned()
    }

    fn lookup(&self, component: &str, pointer: &str) -> Option<String> {
        let config = self.configurations.get(component)?;
        let value = if pointer.is_empty() {
            config
        } else {
            config.pointer(pointer)?
        };
        Some(render(value))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpolates every string in `value`, returning the rendered document.
#[must_use]
pub fn interpolate(value: &Value, ctx: &InterpolationContext<'_>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(s, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| interpolate(item, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, child)| (key.clone(), interpolate(child, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolates tokens in a single string.
#[must_use]
pub fn interpolate_str(input: &str, ctx: &InterpolationContext<'_>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match ctx.resolve(token) {
                    Some(replacement) => output.push_str(&replacement),
                    None => {
                        output.push('{');
                        output.push_str(token);
                        output.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unbalanced brace; keep the remainder literal.
                output.push_str(&rest[open..]);
                return output;
            }
        }
    }

    output.push_str(rest);
    output
}
