use anyhow::{Context, Result};
use rms_agents::AgentsConfig;
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rms")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and validate the agent configuration from `custom_path`, or from
/// `~/.rms/config.toml`. A missing default file falls back to built-in
/// defaults; a missing custom file is an error.
pub fn load(custom_path: &Option<PathBuf>) -> Result<AgentsConfig> {
    let config = match custom_path {
        Some(path) => load_file(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                load_file(&path)?
            } else {
                warn!(
                    "No config at {}, using defaults. Run `rms init` to create one.",
                    path.display()
                );
                AgentsConfig::default()
            }
        }
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<AgentsConfig> {
    let content = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config at {}. Run `rms init` first.",
            path.display()
        )
    })?;

    // Expand environment variables before parsing
    let expanded = expand_env_vars(&content);

    toml::from_str(&expanded).with_context(|| format!("Failed to parse config at {}", path.display()))
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "RMS_INITIAL_STAGE", "RMS_FALLBACK_CATEGORY"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_core::Priority;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_bundled_default_matches_built_in_defaults() {
        let parsed: AgentsConfig =
            toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(parsed, AgentsConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let file = write_config(
            r#"
[workflow]
suppress_repeat_alerts = true

[[workflow.stages]]
stage = "review"
max_duration_ms = 3600000
warning_threshold = 0.5

[notifications]
capacity = 10
"#,
        );
        let config = load(&Some(file.path().to_path_buf())).unwrap();

        assert!(config.workflow.suppress_repeat_alerts);
        assert_eq!(config.workflow.initial_stage, "new");
        assert_eq!(config.workflow.stages.len(), 1);
        assert_eq!(config.workflow.sla_for("review").unwrap().warning_threshold, 0.5);
        assert_eq!(config.notifications.capacity, 10);
        assert_eq!(config.notifications.default_limit, 50);
        assert_eq!(config.classifier.rules.len(), 4);
    }

    #[test]
    fn test_fallback_classification_parses() {
        let file = write_config(
            r#"
[classifier.fallback]
category = "triage"
priority = "low"
"#,
        );
        let config = load(&Some(file.path().to_path_buf())).unwrap();
        let fallback = config.classifier.fallback.unwrap();
        assert_eq!(fallback.category, "triage");
        assert_eq!(fallback.priority, Priority::Low);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let file = write_config(
            r#"
[[workflow.stages]]
stage = "new"
max_duration_ms = 1000
warning_threshold = 1.5
"#,
        );
        let err = load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(format!("{:#}", err).contains("warning threshold"));
    }

    #[test]
    fn test_missing_custom_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load(&Some(missing)).unwrap_err();
        assert!(err.to_string().contains("rms init"));
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let file = write_config("[workflow\n");
        let err = load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_expand_env_vars_only_allowlisted() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("dir = \"${HOME}/rms\""), format!("dir = \"{}/rms\"", home));
        assert_eq!(expand_env_vars("x = \"${NOT_ALLOWED_VAR}\""), "x = \"${NOT_ALLOWED_VAR}\"");
        assert_eq!(expand_env_vars("x = \"${UNCLOSED\""), "x = \"${UNCLOSED\"");
    }
}
