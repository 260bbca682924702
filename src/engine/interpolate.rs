//! Placeholder resolution for template values.
//!
//! Strings may contain `${inputs.host}`-style references into the run context
//! or the `${random|N}` directive. An object of the exact shape
//! `{"ref": "inputs.port"}` resolves to the referenced value itself, keeping
//! its JSON type.

use std::sync::OnceLock;

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("Invalid regex"))
}

/// Variables visible to a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub internal: Map<String, Value>,
}

impl RunContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        match name {
            "inputs" => Some(&self.inputs),
            "outputs" => Some(&self.outputs),
            "internal" => Some(&self.internal),
            _ => None,
        }
    }

    /// Look up `type.key[.nested...]`. `Ok(None)` when the key is absent.
    pub fn lookup(&self, dotted: &str) -> Result<Option<&Value>, AppError> {
        let (ty, path) = split_reference(dotted)?;
        let section = self
            .section(ty)
            .ok_or_else(|| AppError::Template(format!("Unknown variable type '{ty}' in '{dotted}'")))?;

        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return Ok(None);
        };
        let mut current = match section.get(first) {
            Some(v) => v,
            None => return Ok(None),
        };
        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Write `value` at `outputs.x` / `internal.x`, creating intermediate objects.
    pub fn assign(&mut self, dotted: &str, value: Value) -> Result<(), AppError> {
        let (ty, path) = split_reference(dotted)?;
        let section = match ty {
            "outputs" => &mut self.outputs,
            "internal" => &mut self.internal,
            other => {
                return Err(AppError::Template(format!(
                    "Cannot assign to '{other}' in '{dotted}'"
                )))
            }
        };

        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| AppError::Template(format!("Empty assignment target '{dotted}'")))?;

        let mut current = section;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                return Err(AppError::Template(format!("Cannot descend into '{dotted}'")));
            };
            current = map;
        }
        current.insert(last.to_string(), value);
        Ok(())
    }
}

fn split_reference(dotted: &str) -> Result<(&str, &str), AppError> {
    match dotted.trim().split_once('.') {
        Some((ty, path)) if !ty.is_empty() && !path.is_empty() => Ok((ty, path)),
        _ => Err(AppError::Template(format!(
            "Malformed reference '{dotted}', expected 'type.key'"
        ))),
    }
}

/// Resolve every placeholder and `ref` in `value` against `ctx`.
pub fn interpolate(value: &Value, ctx: &RunContext) -> Result<Value, AppError> {
    match value {
        Value::String(s) => Ok(Value::String(render_str(s, ctx)?)),
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate(v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            if let Some(target) = as_ref(map) {
                return Ok(ctx.lookup(target)?.cloned().unwrap_or(Value::Null));
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn as_ref(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get("ref").and_then(Value::as_str)
}

/// Substitute placeholders inside a single string.
pub fn render_str(s: &str, ctx: &RunContext) -> Result<String, AppError> {
    if !s.contains("${") {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(s) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        out.push_str(&resolve_placeholder(body.as_str(), ctx)?);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

fn resolve_placeholder(body: &str, ctx: &RunContext) -> Result<String, AppError> {
    let body = body.trim();
    if let Some((directive, arg)) = body.split_once('|') {
        return match directive.trim() {
            "random" => {
                let len: usize = arg.trim().parse().map_err(|_| {
                    AppError::Template(format!("Invalid random length in '${{{body}}}'"))
                })?;
                Ok(random_token(len))
            }
            other => Err(AppError::Template(format!("Unknown directive '{other}'"))),
        };
    }

    match ctx.lookup(body)? {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(AppError::Template(format!("Unresolved reference '{body}'"))),
    }
}

/// Random `[A-Za-z0-9]` token of length `len`.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
