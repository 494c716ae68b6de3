//! Variable resolution and interpolation.
//!
//! Configuration documents may use `${NAME}` and `${env:NAME}`
//! placeholders. A string that is exactly one placeholder resolves to the
//! variable's value with its original type; embedded placeholders
//! stringify (objects and lists as JSON). `$${NAME}` escapes to a literal
//! `${NAME}`. Unknown names stay untouched. Variable values may reference
//! other variables by full-match placeholder; cycles are configuration
//! errors.

use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::error::ServerError;

/// `${NAME}` / `${env:NAME}`, ignoring `$${...}` escapes.
pub fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\$\$\{|\$\{([A-Za-z_][A-Za-z0-9_]*(?::[A-Za-z_][A-Za-z0-9_]*)?)\})")
            .unwrap()
    })
}

fn full_match_name(s: &str) -> Option<&str> {
    if !s.starts_with("${") || !s.ends_with('}') || s.starts_with("$${") {
        return None;
    }
    let caps = var_pattern().captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Resolve a variable or environment-backed placeholder name. Returns
/// `None` when the name is unknown so callers can leave the placeholder
/// intact.
pub fn lookup_var(name: &str, vars: &HashMap<String, Value>) -> Option<Value> {
    if let Some(env_name) = name.strip_prefix("env:") {
        if env_name.is_empty() {
            return None;
        }
        return std::env::var(env_name).ok().map(Value::String);
    }
    vars.get(name).cloned()
}

/// Resolve variable-to-variable references.
///
/// Only full-match references are chased (`a: ${b}` takes b's resolved
/// value, whatever its type); partial interpolation inside variable values
/// happens later with the document pass. Unknown references are left as
/// the placeholder string. Cycles error.
pub fn resolve_variables(
    vars: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, ServerError> {
    fn resolve_one(
        name: &str,
        vars: &HashMap<String, Value>,
        resolved: &mut HashMap<String, Value>,
        resolving: &mut HashSet<String>,
    ) -> Result<Value, ServerError> {
        if let Some(value) = resolved.get(name) {
            return Ok(value.clone());
        }
        if resolving.contains(name) {
            return Err(ServerError::Configuration(format!(
                "Detected variable resolution cycle at '{name}'"
            )));
        }
        resolving.insert(name.to_string());
        let raw = vars.get(name).cloned().unwrap_or(Value::Null);
        let result = if let Value::String(s) = &raw {
            match full_match_name(s) {
                Some(reference) if reference.starts_with("env:") => {
                    lookup_var(reference, vars).unwrap_or(raw.clone())
                }
                Some(reference) if vars.contains_key(reference) => {
                    resolve_one(reference, vars, resolved, resolving)?
                }
                _ => raw.clone(),
            }
        } else {
            raw
        };
        resolving.remove(name);
        resolved.insert(name.to_string(), result.clone());
        Ok(result)
    }

    let mut resolved = HashMap::new();
    let mut resolving = HashSet::new();
    for name in vars.keys() {
        resolve_one(name, vars, &mut resolved, &mut resolving)?;
    }
    Ok(resolved)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Interpolate placeholders inside an arbitrary string. `$${` collapses to
/// a literal `${` in the output.
pub fn interpolate_string(s: &str, vars: &HashMap<String, Value>) -> String {
    let interpolated = var_pattern().replace_all(s, |caps: &regex::Captures<'_>| {
        match caps.get(1) {
            // Escaped `$${` sequence matched without a name group.
            None => caps.get(0).unwrap().as_str().to_string(),
            Some(name) => match lookup_var(name.as_str(), vars) {
                Some(value) => value_to_string(&value),
                None => caps.get(0).unwrap().as_str().to_string(),
            },
        }
    });
    interpolated.replace("$${", "${")
}

/// Apply variables over a whole document: full-match strings keep the
/// value's type, other strings interpolate, containers recurse.
pub fn apply_variables(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = full_match_name(s) {
                if let Some(resolved) = lookup_var(name, vars) {
                    return resolved;
                }
                return value.clone();
            }
            Value::String(interpolate_string(s, vars))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), apply_variables(v, vars)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| apply_variables(v, vars)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn full_match_keeps_value_type() {
        let vars = vars(&[("LIST", json!([1, 2, 3]))]);
        let out = apply_variables(&json!("${LIST}"), &vars);
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn embedded_placeholder_stringifies() {
        let vars = vars(&[("NAME", json!("world")), ("N", json!(3))]);
        let out = apply_variables(&json!("hello ${NAME} x${N}"), &vars);
        assert_eq!(out, json!("hello world x3"));
    }

    #[test]
    fn unknown_names_are_left_alone() {
        let out = apply_variables(&json!("keep ${MISSING}"), &HashMap::new());
        assert_eq!(out, json!("keep ${MISSING}"));
    }

    #[test]
    fn escaped_placeholder_is_literal() {
        let vars = vars(&[("NAME", json!("x"))]);
        let out = apply_variables(&json!("$${NAME} and ${NAME}"), &vars);
        assert_eq!(out, json!("${NAME} and x"));
    }

    #[test]
    fn variable_references_resolve_transitively() {
        let raw = vars(&[("A", json!("${B}")), ("B", json!("${C}")), ("C", json!(42))]);
        let resolved = resolve_variables(&raw).unwrap();
        assert_eq!(resolved["A"], json!(42));
        assert_eq!(resolved["B"], json!(42));
    }

    #[test]
    fn variable_cycle_is_an_error() {
        let raw = vars(&[("A", json!("${B}")), ("B", json!("${A}"))]);
        let err = resolve_variables(&raw).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn env_lookup_resolves() {
        std::env::set_var("SKEIN_VARS_TEST", "from-env");
        let out = apply_variables(&json!("${env:SKEIN_VARS_TEST}"), &HashMap::new());
        assert_eq!(out, json!("from-env"));
        std::env::remove_var("SKEIN_VARS_TEST");
    }

    #[test]
    fn recurses_into_containers() {
        let vars = vars(&[("V", json!("x"))]);
        let doc = json!({"a": ["${V}", {"b": "${V} y"}]});
        let out = apply_variables(&doc, &vars);
        assert_eq!(out, json!({"a": ["x", {"b": "x y"}]}));
    }
}
