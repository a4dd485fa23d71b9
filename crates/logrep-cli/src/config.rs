use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use logrep_config::{validate_config, InstanceConfig};

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to "".
pub fn resolve_env(s: &str) -> String {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        } else {
            break;
        }
    }

    result
}

/// Read, resolve and validate an instance config file.
pub fn load_config(path: &Path) -> Result<InstanceConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = InstanceConfig::parse(&resolve_env(&content))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    validate_config(&config).with_context(|| format!("Invalid config: {}", path.display()))?;

    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<InstanceConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(InstanceConfig::parse("")?)
    }
}
