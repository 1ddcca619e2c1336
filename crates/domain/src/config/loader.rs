//! Config file loading: JSON5 parse → include resolution → env substitution
//! → typed deserialization.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

use super::{env::resolve_env_vars, includes::resolve_includes, Config};

/// Load and fully resolve a config file into a raw JSON tree.
pub fn load_config_value(path: &Path, env: &HashMap<String, String>) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
    let parsed: Value = json5::from_str(&raw)
        .map_err(|e| Error::Config(format!("cannot parse config {}: {e}", path.display())))?;
    let included = resolve_includes(parsed, path)?;
    resolve_env_vars(&included, env)
}

/// Load a typed [`Config`] from disk. Any failure is fatal.
pub fn load_config(path: &Path) -> Result<Config> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let value = load_config_value(path, &env)?;
    let config: Config = serde_json::from_value(value)
        .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;

    tracing::info!(
        path = %path.display(),
        gateway_port = config.gateway.port,
        channels = config.channels.len(),
        "config loaded"
    );

    Ok(config)
}
