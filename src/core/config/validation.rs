use serde_json::{Map, Value};

use crate::core::errors::ConfigError;

const BACKUP_POLICIES: [&str; 3] = ["timestamp_suffix", "overwrite", "refuse"];

pub fn validate_config(config: &Value) -> Result<(), ConfigError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(manifest) = expect_optional_object(root, "manifest")? {
        validate_url_field(manifest, "manifest.base_url", "base_url")?;
        validate_required_string_field(manifest, "manifest.platform", "platform")?;
        validate_required_string_field(manifest, "manifest.archive_name", "archive_name")?;
        validate_required_string_field(manifest, "manifest.user_agent", "user_agent")?;
        validate_u64_field(
            manifest,
            "manifest.request_timeout_secs",
            "request_timeout_secs",
            1,
            600,
        )?;
    }

    if let Some(download) = expect_optional_object(root, "download")? {
        validate_u64_field(
            download,
            "download.connect_timeout_secs",
            "connect_timeout_secs",
            1,
            600,
        )?;
        validate_u64_field(
            download,
            "download.idle_timeout_secs",
            "idle_timeout_secs",
            1,
            3_600,
        )?;
    }

    if let Some(install) = expect_optional_object(root, "install")? {
        if let Some(policy) = install.get("backup_policy") {
            let Some(text) = policy.as_str() else {
                return Err(config_type_error("install.backup_policy", "string"));
            };
            if !BACKUP_POLICIES.contains(&text) {
                return Err(ConfigError::Invalid(format!(
                    "Invalid config at 'install.backup_policy': expected one of {}",
                    BACKUP_POLICIES.join(", ")
                )));
            }
        }
        validate_string_array_field(install, "install.exclude", "exclude")?;
        validate_optional_string_field(install, "install.temp_root", "temp_root")?;
    }

    if let Some(core_info) = expect_optional_object(root, "core_info")? {
        validate_bool_field(core_info, "core_info.enabled", "enabled")?;
        validate_url_field(core_info, "core_info.url", "url")?;
    }

    if let Some(selection) = expect_optional_object(root, "last_selection")? {
        validate_optional_string_field(selection, "last_selection.version", "version")?;
        validate_optional_string_field(selection, "last_selection.target", "target")?;
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ConfigError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_type_error(key, "object")),
        None => Ok(None),
    }
}

fn validate_bool_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ConfigError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_bool().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "boolean"))
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), ConfigError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(ConfigError::Invalid(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_required_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ConfigError> {
    let value = section.get(key).ok_or_else(|| {
        ConfigError::Invalid(format!("Invalid config at '{}': value is required", path))
    })?;
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if text.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Invalid config at '{}': value cannot be empty",
            path
        )));
    }
    Ok(())
}

fn validate_url_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ConfigError> {
    validate_required_string_field(section, path, key)?;
    let text = section.get(key).and_then(|v| v.as_str()).unwrap_or_default();
    if text.starts_with("http://") || text.starts_with("https://") {
        return Ok(());
    }
    Err(ConfigError::Invalid(format!(
        "Invalid config at '{}': expected an http(s) URL",
        path
    )))
}

/// Missing and `null` are both accepted.
fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ConfigError> {
    match section.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(config_type_error(path, "string")),
    }
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ConfigError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    for (index, item) in items.iter().enumerate() {
        let Some(text) = item.as_str() else {
            return Err(config_type_error(&format!("{}[{}]", path, index), "string"));
        };
        if text.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Invalid config at '{}[{}]': value cannot be empty",
                path, index
            )));
        }
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> ConfigError {
    ConfigError::Invalid(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::validate_config;
    use crate::core::config::defaults::default_config;

    #[test]
    fn defaults_pass_validation() {
        validate_config(&default_config()).expect("defaults should validate");
    }

    #[test]
    fn rejects_unknown_backup_policy() {
        let config = json!({"install": {"backup_policy": "rename_old"}});
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("install.backup_policy"));
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let config = json!({"download": {"idle_timeout_secs": 0}});
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_non_http_manifest_url() {
        let mut config = default_config();
        config["manifest"]["base_url"] = json!("ftp://buildbot.libretro.com/stable/");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("http(s) URL"));
    }

    #[test]
    fn accepts_null_temp_root() {
        let config = json!({"install": {"temp_root": null, "exclude": ["configure"]}});
        validate_config(&config).expect("null temp_root is allowed");
    }
}
