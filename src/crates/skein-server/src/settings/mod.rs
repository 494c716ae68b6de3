//! Configuration loading.
//!
//! Settings documents are YAML or JSON5, selected by file extension. A
//! `$include` key expands relative glob patterns (string, list, or an
//! options map with `local`/`file`/`files`, `import_vars`, `vars` and
//! `var_prefix`); included mappings deep-merge with later includes and
//! sibling keys winning. `variables` blocks collect across includes (the
//! root document wins), resolve variable-to-variable references with
//! cycle detection, and interpolate over the merged document before
//! validation.

pub mod vars;

use glob::glob;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use skein_core::config::Settings;

use crate::error::{Result, ServerError};
use vars::{apply_variables, resolve_variables};

const INCLUDE_KEY: &str = "$include";

/// Load, merge and validate settings from a file.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let (document, included_vars, root_vars) = load_and_preprocess(path, &mut HashSet::new())?;
    let Value::Object(_) = &document else {
        return Err(ServerError::Configuration(
            "Root configuration must be a mapping/object".into(),
        ));
    };

    // Included defaults first, then root-level overrides.
    let mut vars_map: HashMap<String, Value> = included_vars;
    vars_map.extend(root_vars);
    let vars_map = resolve_variables(&vars_map)?;

    let document = apply_variables(&document, &vars_map);
    let mut settings: Settings = serde_json::from_value(document)
        .map_err(|e| ServerError::Configuration(format!("invalid settings document: {e}")))?;
    settings.sync_workflow_names();
    Ok(settings)
}

fn load_raw_file(path: &Path) -> Result<Value> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let text = std::fs::read_to_string(path)?;
    let value: Value = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&text)
            .map_err(|e| ServerError::Configuration(format!("{}: {e}", path.display())))?,
        "json" | "json5" | "jsonc" => json5::from_str(&text)
            .map_err(|e| ServerError::Configuration(format!("{}: {e}", path.display())))?,
        other => {
            return Err(ServerError::Configuration(format!(
                "Unsupported config file extension: .{other}"
            )))
        }
    };
    Ok(if value.is_null() { Value::Object(Map::new()) } else { value })
}

/// Deep-merge `b` over `a`: nested mappings merge recursively, everything
/// else (lists included) is replaced by the overriding value.
fn deep_merge(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                let merged = match out.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, other) => other.clone(),
    }
}

/// Collect a `variables` block: a mapping, a list of one-key mappings, or
/// a list of `{key, value}` entries.
fn collect_variables(doc: &Value) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    let Some(spec) = doc.get("variables") else {
        return out;
    };
    match spec {
        Value::Object(map) => {
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                let Value::Object(map) = item else { continue };
                if let (Some(Value::String(key)), Some(value)) = (map.get("key"), map.get("value"))
                {
                    out.insert(key.clone(), value.clone());
                } else {
                    for (k, v) in map {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn apply_var_prefix(vars: HashMap<String, Value>, prefix: Option<&str>) -> HashMap<String, Value> {
    match prefix {
        None | Some("") => vars,
        Some(prefix) => vars
            .into_iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v))
            .collect(),
    }
}

#[derive(Clone, Default)]
struct IncludeOpts {
    import_vars: bool,
    inline_vars: Map<String, Value>,
    var_prefix: Option<String>,
}

/// Expand one relative glob under `base` into matching files.
///
/// Absolute patterns and parent traversal are rejected; every match must
/// resolve inside the base directory and at least one file must match.
fn expand_include_pattern(base: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if Path::new(pattern).is_absolute() {
        return Err(ServerError::Configuration(format!(
            "Include pattern must be relative: '{pattern}'"
        )));
    }
    let normalized = pattern.replace('\\', "/");
    if normalized
        .split('/')
        .any(|part| part == "..")
    {
        return Err(ServerError::Configuration(format!(
            "Include pattern may not contain '..': '{pattern}'"
        )));
    }

    let full = base.join(&normalized);
    let full_str = full.to_string_lossy().to_string();
    let base_canonical = base
        .canonicalize()
        .unwrap_or_else(|_| base.to_path_buf());

    let mut matches = Vec::new();
    let entries = glob(&full_str)
        .map_err(|e| ServerError::Configuration(format!("Bad include pattern '{pattern}': {e}")))?;
    for entry in entries {
        let Ok(candidate) = entry else { continue };
        if !candidate.is_file() {
            continue;
        }
        let resolved = candidate
            .canonicalize()
            .unwrap_or_else(|_| candidate.clone());
        if !resolved.starts_with(&base_canonical) {
            continue;
        }
        matches.push(resolved);
    }
    if matches.is_empty() {
        return Err(ServerError::Configuration(format!(
            "Include pattern '{pattern}' under base '{}' did not match any files",
            base.display()
        )));
    }
    matches.sort();
    Ok(matches)
}

fn collect_include_paths(spec: &Value, base_dir: &Path) -> Result<Vec<(PathBuf, IncludeOpts)>> {
    let default_opts = IncludeOpts {
        import_vars: true,
        inline_vars: Map::new(),
        var_prefix: None,
    };

    match spec {
        Value::String(pattern) => Ok(expand_include_pattern(base_dir, pattern)?
            .into_iter()
            .map(|p| (p, default_opts.clone()))
            .collect()),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(collect_include_paths(item, base_dir)?);
            }
            Ok(out)
        }
        Value::Object(map) => {
            let import_vars = map
                .get("import_vars")
                .map(|v| {
                    v.as_bool().ok_or_else(|| {
                        ServerError::Configuration("import_vars must be a boolean".into())
                    })
                })
                .transpose()?
                .unwrap_or(true);
            let inline_vars = match map.get("vars") {
                None => Map::new(),
                Some(Value::Object(vars)) => vars.clone(),
                Some(_) => {
                    return Err(ServerError::Configuration(
                        "vars must be a mapping/object".into(),
                    ))
                }
            };
            let var_prefix = match map.get("var_prefix") {
                None | Some(Value::Null) => None,
                Some(Value::String(p)) => Some(p.clone()),
                Some(_) => {
                    return Err(ServerError::Configuration(
                        "var_prefix must be a string".into(),
                    ))
                }
            };
            let opts = IncludeOpts {
                import_vars,
                inline_vars,
                var_prefix,
            };

            let location = map
                .get("local")
                .or_else(|| map.get("file"))
                .or_else(|| map.get("files"))
                .ok_or_else(|| {
                    ServerError::Configuration(format!(
                        "Unsupported include dict keys for location: {:?}",
                        map.keys().collect::<Vec<_>>()
                    ))
                })?;

            let mut paths = Vec::new();
            match location {
                Value::String(pattern) => {
                    paths.extend(expand_include_pattern(base_dir, pattern)?)
                }
                Value::Array(patterns) => {
                    for pattern in patterns {
                        let Value::String(pattern) = pattern else {
                            return Err(ServerError::Configuration(
                                "include path must be a string".into(),
                            ));
                        };
                        paths.extend(expand_include_pattern(base_dir, pattern)?);
                    }
                }
                _ => {
                    return Err(ServerError::Configuration(
                        "include path must be a string".into(),
                    ))
                }
            }
            Ok(paths.into_iter().map(|p| (p, opts.clone())).collect())
        }
        _ => Err(ServerError::Configuration(format!(
            "Unsupported include item type: {spec}"
        ))),
    }
}

/// Expand `$include` keys depth-first, accumulating variables discovered
/// in included files. Returns the processed node plus accumulated vars.
fn preprocess_includes(
    node: &Value,
    base_dir: &Path,
    seen: &mut HashSet<PathBuf>,
) -> Result<(Value, HashMap<String, Value>)> {
    match node {
        Value::Object(map) => {
            if let Some(include_spec) = map.get(INCLUDE_KEY) {
                let entries = collect_include_paths(include_spec, base_dir)?;
                let mut acc_vars: HashMap<String, Value> = HashMap::new();
                let mut combined = Value::Object(Map::new());

                for (path, opts) in entries {
                    if seen.contains(&path) {
                        return Err(ServerError::Configuration(format!(
                            "Detected include cycle at {}",
                            path.display()
                        )));
                    }
                    seen.insert(path.clone());
                    let result = (|| -> Result<(Value, HashMap<String, Value>)> {
                        let mut data = load_raw_file(&path)?;
                        let mut top_vars = HashMap::new();
                        if let Value::Object(obj) = &mut data {
                            top_vars = collect_variables(&Value::Object(obj.clone()));
                            obj.remove("variables");
                        }
                        let parent = path.parent().unwrap_or(base_dir).to_path_buf();
                        let (processed, nested_vars) =
                            preprocess_includes(&data, &parent, seen)?;
                        let mut all_vars = nested_vars;
                        all_vars.extend(top_vars);
                        Ok((processed, all_vars))
                    })();
                    seen.remove(&path);
                    let (processed, all_vars) = result?;

                    if !processed.is_object() {
                        return Err(ServerError::Configuration(format!(
                            "Included file must be a mapping/object: {}",
                            path.display()
                        )));
                    }

                    let prefixed = apply_var_prefix(all_vars, opts.var_prefix.as_deref());
                    if opts.import_vars {
                        // Later includes override earlier ones.
                        acc_vars.extend(prefixed);
                    }
                    let inline = apply_var_prefix(
                        opts.inline_vars.clone().into_iter().collect(),
                        opts.var_prefix.as_deref(),
                    );
                    acc_vars.extend(inline);

                    combined = deep_merge(&combined, &processed);
                }

                // Sibling keys of $include override the included payload.
                let rest: Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != INCLUDE_KEY)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if rest.is_empty() {
                    return Ok((combined, acc_vars));
                }
                let (rest_processed, rest_vars) =
                    preprocess_includes(&Value::Object(rest), base_dir, seen)?;
                acc_vars.extend(rest_vars);
                Ok((deep_merge(&combined, &rest_processed), acc_vars))
            } else {
                let mut out = Map::new();
                let mut acc_vars = HashMap::new();
                for (k, v) in map {
                    let (child, child_vars) = preprocess_includes(v, base_dir, seen)?;
                    out.insert(k.clone(), child);
                    acc_vars.extend(child_vars);
                }
                Ok((Value::Object(out), acc_vars))
            }
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            let mut acc_vars = HashMap::new();
            for item in items {
                let (child, child_vars) = preprocess_includes(item, base_dir, seen)?;
                out.push(child);
                acc_vars.extend(child_vars);
            }
            Ok((Value::Array(out), acc_vars))
        }
        other => Ok((other.clone(), HashMap::new())),
    }
}

#[allow(clippy::type_complexity)]
fn load_and_preprocess(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
) -> Result<(Value, HashMap<String, Value>, HashMap<String, Value>)> {
    let path = path
        .canonicalize()
        .map_err(|e| ServerError::Configuration(format!("{}: {e}", path.display())))?;
    let mut data = load_raw_file(&path)?;

    let mut root_vars = HashMap::new();
    if let Value::Object(obj) = &mut data {
        root_vars = collect_variables(&Value::Object(obj.clone()));
        obj.remove("variables");
    }

    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let (processed, included_vars) = preprocess_includes(&data, &base_dir, seen)?;
    Ok((processed, included_vars, root_vars))
}
