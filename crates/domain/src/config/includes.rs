//! `@include` directive resolution.
//!
//! A config object may carry `"@include": "path"` (or an array of paths).
//! Included files are parsed as JSON5, resolved recursively, and merged:
//! deep merge on objects, full replace on arrays and scalars. Keys on the
//! including object win over included ones. Cycles are detected with a
//! visited set of absolute paths and reported with the participants.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Error, Result};

const INCLUDE_KEY: &str = "@include";

/// Deep-merge `overlay` into `base`: object keys merge recursively, every
/// other value (arrays included) replaces wholesale.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("include file not found: {}: {e}", path.display()))
    })?;
    json5::from_str(&raw)
        .map_err(|e| Error::Config(format!("failed to parse include {}: {e}", path.display())))
}

fn resolve_value(
    value: Value,
    config_dir: &Path,
    visited: &HashSet<PathBuf>,
) -> Result<Value> {
    match value {
        Value::Object(mut map) => {
            let include = map.remove(INCLUDE_KEY);

            let mut merged = Value::Object(serde_json::Map::new());
            if let Some(include) = include {
                let paths: Vec<String> = match include {
                    Value::String(s) => vec![s],
                    Value::Array(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(s),
                            other => Err(Error::Config(format!(
                                "@include entries must be strings, got {other}"
                            ))),
                        })
                        .collect::<Result<_>>()?,
                    other => {
                        return Err(Error::Config(format!(
                            "@include must be a string or array, got {other}"
                        )))
                    }
                };

                for raw_path in paths {
                    let mut path = PathBuf::from(&raw_path);
                    if path.is_relative() {
                        path = config_dir.join(path);
                    }
                    let path = path.canonicalize().unwrap_or(path);

                    if visited.contains(&path) {
                        let mut cycle: Vec<String> =
                            visited.iter().map(|p| p.display().to_string()).collect();
                        cycle.sort();
                        cycle.push(path.display().to_string());
                        return Err(Error::Config(format!(
                            "circular include detected: {}",
                            cycle.join(" -> ")
                        )));
                    }

                    let mut child_visited = visited.clone();
                    child_visited.insert(path.clone());

                    let included = parse_file(&path)?;
                    let include_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                    let included = resolve_value(included, &include_dir, &child_visited)?;
                    deep_merge(&mut merged, included);
                }
            }

            // Keys on the including object override included content.
            for (key, val) in map {
                let resolved = resolve_value(val, config_dir, visited)?;
                match &mut merged {
                    Value::Object(merged_map) => match merged_map.get_mut(&key) {
                        Some(existing) => deep_merge(existing, resolved),
                        None => {
                            merged_map.insert(key, resolved);
                        }
                    },
                    _ => unreachable!("merged starts as an object"),
                }
            }

            Ok(merged)
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| resolve_value(item, config_dir, visited))
                .collect::<Result<_>>()?,
        )),
        other => Ok(other),
    }
}

/// Resolve all `@include` directives in a parsed config document.
///
/// `config_path` is the file the document was loaded from; relative include
/// paths resolve against its directory.
pub fn resolve_includes(value: Value, config_path: &Path) -> Result<Value> {
    let config_dir = config_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    if let Ok(root) = config_path.canonicalize() {
        visited.insert(root);
    }
    resolve_value(value, &config_dir, &visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn single_include_merges() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.json5", r#"{ gateway: { port: 19999 } }"#);
        let root = write(
            dir.path(),
            "config.json5",
            r#"{ "@include": "base.json5", agent: { model: "m" } }"#,
        );

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let resolved = resolve_includes(raw, &root).unwrap();
        assert_eq!(resolved["gateway"]["port"], 19999);
        assert_eq!(resolved["agent"]["model"], "m");
    }

    #[test]
    fn including_object_wins_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "base.json5",
            r#"{ gateway: { port: 1, bind: "lan" } }"#,
        );
        let root = write(
            dir.path(),
            "config.json5",
            r#"{ "@include": "base.json5", gateway: { port: 2 } }"#,
        );

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let resolved = resolve_includes(raw, &root).unwrap();
        // Deep merge: port overridden, bind preserved.
        assert_eq!(resolved["gateway"]["port"], 2);
        assert_eq!(resolved["gateway"]["bind"], "lan");
    }

    #[test]
    fn arrays_replace_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.json5", r#"{ tools: { allow: ["a", "b"] } }"#);
        let root = write(
            dir.path(),
            "config.json5",
            r#"{ "@include": "base.json5", tools: { allow: ["c"] } }"#,
        );

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let resolved = resolve_includes(raw, &root).unwrap();
        assert_eq!(resolved["tools"]["allow"], json!(["c"]));
    }

    #[test]
    fn multiple_includes_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json5", r#"{ x: 1, y: 1 }"#);
        write(dir.path(), "b.json5", r#"{ y: 2 }"#);
        let root = write(
            dir.path(),
            "config.json5",
            r#"{ "@include": ["a.json5", "b.json5"] }"#,
        );

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let resolved = resolve_includes(raw, &root).unwrap();
        assert_eq!(resolved["x"], 1);
        assert_eq!(resolved["y"], 2);
    }

    #[test]
    fn nested_includes_resolve() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "inner.json5", r#"{ deep: true }"#);
        write(
            dir.path(),
            "mid.json5",
            r#"{ "@include": "inner.json5", mid: true }"#,
        );
        let root = write(dir.path(), "config.json5", r#"{ "@include": "mid.json5" }"#);

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let resolved = resolve_includes(raw, &root).unwrap();
        assert_eq!(resolved["deep"], true);
        assert_eq!(resolved["mid"], true);
    }

    #[test]
    fn circular_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json5", r#"{ "@include": "b.json5" }"#);
        write(dir.path(), "b.json5", r#"{ "@include": "a.json5" }"#);
        let root = dir.path().join("a.json5");

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let err = resolve_includes(raw, &root).unwrap_err();
        assert!(err.to_string().contains("circular include"));
    }

    #[test]
    fn self_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "a.json5", r#"{ "@include": "a.json5" }"#);

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        assert!(resolve_includes(raw, &root).is_err());
    }

    #[test]
    fn missing_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "a.json5", r#"{ "@include": "nope.json5" }"#);

        let raw: Value = json5::from_str(&std::fs::read_to_string(&root).unwrap()).unwrap();
        let err = resolve_includes(raw, &root).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
