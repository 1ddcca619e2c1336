//! `${VAR}` environment substitution over a parsed config tree.
//!
//! Only uppercase names are recognized (`[A-Z_][A-Z0-9_]*`). `$${VAR}`
//! escapes to the literal `${VAR}`. A referenced variable that is unset or
//! empty is a fatal error naming the offending config path.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

fn env_var_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("static pattern"))
}

fn is_env_var_name(name: &str) -> bool {
    env_var_name_pattern().is_match(name)
}

fn substitute_string(value: &str, env: &HashMap<String, String>, path: &str) -> Result<String> {
    if !value.contains('$') {
        return Ok(value.to_owned());
    }

    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            // Copy the full UTF-8 character starting here.
            let ch = value[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        // Escaped: $${VAR} -> ${VAR}
        if value[i..].starts_with("$${") {
            if let Some(end) = value[i + 3..].find('}') {
                let name = &value[i + 3..i + 3 + end];
                if is_env_var_name(name) {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                    i += 3 + end + 1;
                    continue;
                }
            }
        }

        // Substitution: ${VAR} -> value
        if value[i..].starts_with("${") {
            if let Some(end) = value[i + 2..].find('}') {
                let name = &value[i + 2..i + 2 + end];
                if is_env_var_name(name) {
                    match env.get(name).filter(|v| !v.is_empty()) {
                        Some(v) => {
                            out.push_str(v);
                            i += 2 + end + 1;
                            continue;
                        }
                        None => {
                            return Err(Error::Config(format!(
                                "missing env var \"{name}\" referenced at config path: {path}"
                            )));
                        }
                    }
                }
            }
        }

        // Not a recognized pattern; leave the '$' untouched.
        out.push('$');
        i += 1;
    }

    Ok(out)
}

fn substitute_value(value: &Value, env: &HashMap<String, String>, path: &str) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(s, env, path)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                out.push(substitute_value(item, env, &format!("{path}[{index}]"))?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                out.insert(key.clone(), substitute_value(val, env, &child_path)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve `${VAR_NAME}` references in all string values of a config tree.
pub fn resolve_env_vars(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    substitute_value(value, env, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_simple_reference() {
        let value = json!({"apiKey": "${API_KEY}"});
        let out = resolve_env_vars(&value, &env(&[("API_KEY", "secret")])).unwrap();
        assert_eq!(out["apiKey"], "secret");
    }

    #[test]
    fn substitutes_inside_larger_string() {
        let value = json!({"url": "https://host/${REGION}/v1"});
        let out = resolve_env_vars(&value, &env(&[("REGION", "eu")])).unwrap();
        assert_eq!(out["url"], "https://host/eu/v1");
    }

    #[test]
    fn escape_yields_literal() {
        let value = json!({"tpl": "$${NOT_SUBSTITUTED}"});
        let out = resolve_env_vars(&value, &env(&[])).unwrap();
        assert_eq!(out["tpl"], "${NOT_SUBSTITUTED}");
    }

    #[test]
    fn missing_var_names_config_path() {
        let value = json!({"channels": {"telegram": {"botToken": "${MISSING_TOKEN}"}}});
        let err = resolve_env_vars(&value, &env(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("MISSING_TOKEN"));
        assert!(msg.contains("channels.telegram.botToken"));
    }

    #[test]
    fn empty_env_value_is_missing() {
        let value = json!({"key": "${EMPTY}"});
        assert!(resolve_env_vars(&value, &env(&[("EMPTY", "")])).is_err());
    }

    #[test]
    fn lowercase_names_are_not_substituted() {
        let value = json!({"key": "${not_a_var}"});
        let out = resolve_env_vars(&value, &env(&[])).unwrap();
        assert_eq!(out["key"], "${not_a_var}");
    }

    #[test]
    fn array_paths_are_indexed() {
        let value = json!({"list": ["ok", "${GONE}"]});
        let err = resolve_env_vars(&value, &env(&[])).unwrap_err();
        assert!(err.to_string().contains("list[1]"));
    }

    #[test]
    fn non_strings_pass_through() {
        let value = json!({"port": 18789, "flag": true, "none": null});
        let out = resolve_env_vars(&value, &env(&[])).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn lone_dollar_is_preserved() {
        let value = json!({"price": "$5 and ${CUR}5"});
        let out = resolve_env_vars(&value, &env(&[("CUR", "€")])).unwrap();
        assert_eq!(out["price"], "$5 and €5");
    }
}
