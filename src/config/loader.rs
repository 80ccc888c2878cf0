//! Configuration loader
//!
//! String values may reference environment variables as `${VAR}` anywhere
//! in the value, or as `$VAR` when the variable is the whole value. Write
//! `$$` for a literal `$`, e.g. `password: "$$ecret"` yields `$ecret`.
//! Any other `$` is kept as is.

use super::Config;
use crate::error::{GatewayError, Result};
use serde_yaml::Value;
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Environment references in string values are expanded before the
/// document is mapped onto [`Config`], so plugin blobs see them too.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut document: Value = serde_yaml::from_str(yaml)?;
    resolve_env_vars_in_value(&mut document)?;

    let mut config: Config = serde_yaml::from_value(document)?;
    config.resolve_listeners();
    config.validate().map_err(GatewayError::Config)?;
    Ok(config)
}

/// Resolve environment variables in a string value
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - curly brace syntax, anywhere in the value
/// - `$VAR_NAME` - simple syntax (whole value must be the variable reference)
///
/// `$$` is an escaped `$`. A reference to an unset variable is an error.
fn resolve_env_var(value: &str) -> Result<String> {
    if let Some(var_name) = value.strip_prefix('$') {
        if is_var_name(var_name) {
            return lookup(var_name);
        }
    }

    let mut resolved = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('$') {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        if let Some(escaped) = after.strip_prefix('$') {
            resolved.push('$');
            rest = escaped;
        } else if let Some(reference) = after.strip_prefix('{') {
            let end = reference.find('}').ok_or_else(|| {
                GatewayError::Config(format!("unterminated variable reference in {:?}", value))
            })?;
            let var_name = &reference[..end];
            if !is_var_name(var_name) {
                return Err(GatewayError::Config(format!(
                    "invalid variable name {:?} in {:?}",
                    var_name, value
                )));
            }
            resolved.push_str(&lookup(var_name)?);
            rest = &reference[end + 1..];
        } else {
            resolved.push('$');
            rest = after;
        }
    }
    resolved.push_str(rest);
    Ok(resolved)
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lookup(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            Ok(env_value)
        }
        Err(_) => Err(GatewayError::Config(format!(
            "environment variable {} is not set",
            var_name
        ))),
    }
}

/// Resolve environment variables in every string scalar of the document
fn resolve_env_vars_in_value(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = resolve_env_var(s)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                resolve_env_vars_in_value(item)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                resolve_env_vars_in_value(item)?;
            }
        }
        Value::Tagged(tagged) => resolve_env_vars_in_value(&mut tagged.value)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
