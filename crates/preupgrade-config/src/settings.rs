use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use preupgrade_domain::OptionValue;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use crate::{ConfigurationError, OptionLayer};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/preupgrade/settings.yaml";
pub const SETTINGS_ENV: &str = "PREUPGRADE_SETTINGS";
pub const RUN_LOG_FILE: &str = "preupgrade.log";
pub const REPORT_JSON_FILE: &str = "preupgrade-report.json";
pub const REPORT_TEXT_FILE: &str = "preupgrade-report.txt";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub max_open_files: u64,
    pub max_file_size: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_open_files: 16384,
            max_file_size: None,
        }
    }
}

/// Controller settings file. Every field has a built-in default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSettings {
    pub answer_file: PathBuf,
    pub user_choices_file: PathBuf,
    pub log_dir: PathBuf,
    pub report_dir: PathBuf,
    pub audit_db: PathBuf,
    pub breadcrumbs: PathBuf,
    pub repository: PathBuf,
    pub actor_config_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub report_schema: String,
    pub supported_targets: Vec<String>,
    pub resource_limits: ResourceLimits,
    #[serde(deserialize_with = "deserialize_defaults")]
    pub defaults: OptionLayer,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            answer_file: PathBuf::from("/var/log/preupgrade/answerfile"),
            user_choices_file: PathBuf::from("/var/log/preupgrade/answerfile.userchoices"),
            log_dir: PathBuf::from("/var/log/preupgrade"),
            report_dir: PathBuf::from("/var/log/preupgrade"),
            audit_db: PathBuf::from("/var/lib/preupgrade/preupgrade.db"),
            breadcrumbs: PathBuf::from("/etc/migration-results"),
            repository: PathBuf::from("/etc/preupgrade/repository.yaml"),
            actor_config_dir: PathBuf::from("/etc/preupgrade/actor_conf.d"),
            resource_dir: PathBuf::from("/usr/share/preupgrade"),
            report_schema: "1.2.0".to_string(),
            supported_targets: Vec::new(),
            resource_limits: ResourceLimits::default(),
            defaults: OptionLayer::new(),
        }
    }
}

impl ControllerSettings {
    /// Load settings from `path`; a missing file yields the built-in defaults.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::Settings`] when the file exists but cannot be
    /// read or is not a valid settings document.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ConfigurationError::Settings(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        Self::from_yaml(&content).map_err(|err| match err {
            ConfigurationError::Settings(message) => {
                ConfigurationError::Settings(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// # Errors
    /// Returns [`ConfigurationError::Settings`] for malformed YAML or unknown keys.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|err| ConfigurationError::Settings(format!("invalid settings YAML: {err}")))
    }

    /// Pick the settings path: explicit argument, then `PREUPGRADE_SETTINGS`, then the default.
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>, env_value: Option<&str>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                env_value
                    .filter(|value| !value.trim().is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    #[must_use]
    pub fn log_files(&self) -> Vec<PathBuf> {
        vec![self.log_dir.join(RUN_LOG_FILE)]
    }
}

/// Persisted defaults are hand-written YAML, so unquoted scalars such as
/// `target: 9.4` are read as text rather than rejected.
fn deserialize_defaults<'de, D>(deserializer: D) -> Result<OptionLayer, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| {
            let value = option_value(&value).ok_or_else(|| {
                D::Error::custom(format!("default for option {name} must be a scalar or a list"))
            })?;
            Ok((name, value))
        })
        .collect()
}

fn option_value(value: &Value) -> Option<OptionValue> {
    match value {
        Value::Null => Some(OptionValue::Unset),
        Value::Bool(flag) => Some(OptionValue::Flag(*flag)),
        Value::Sequence(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Option<Vec<_>>>()
            .map(OptionValue::List),
        other => scalar_text(other).map(OptionValue::Text),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("preupgrade-settings-does-not-exist.yaml");
        let settings = ControllerSettings::load(&path);
        assert!(settings.is_ok());
        let settings = settings.unwrap_or_else(|_| unreachable!());
        assert_eq!(settings, ControllerSettings::default());
        assert_eq!(
            settings.log_files(),
            vec![PathBuf::from("/var/log/preupgrade/preupgrade.log")]
        );
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let settings = ControllerSettings::from_yaml(
            r#"
report_dir: /tmp/reports
report_schema: "1.1.0"
supported_targets: ["9.4", "9.6"]
resource_limits:
  max_open_files: 4096
defaults:
  no_rhsm: true
  enablerepo: [extras]
"#,
        );
        assert!(settings.is_ok());
        let settings = settings.unwrap_or_else(|_| unreachable!());
        assert_eq!(settings.report_schema, "1.1.0");
        assert_eq!(settings.resource_limits.max_open_files, 4096);
        assert_eq!(settings.resource_limits.max_file_size, None);
        assert_eq!(
            settings.defaults.get("no_rhsm"),
            Some(&OptionValue::Flag(true))
        );
        assert_eq!(settings.report_dir, PathBuf::from("/tmp/reports"));
        assert_eq!(
            settings.defaults.get("enablerepo"),
            Some(&OptionValue::List(vec!["extras".to_string()]))
        );
        assert_eq!(settings.log_dir, PathBuf::from("/var/log/preupgrade"));
    }

    #[test]
    fn unquoted_numeric_defaults_are_read_as_text() {
        let settings =
            ControllerSettings::from_yaml("defaults:\n  target: 9.4\n  enablerepo: [extras, 8]\n");
        let settings = settings.unwrap_or_else(|err| panic!("settings rejected: {err}"));
        assert_eq!(
            settings.defaults.get("target"),
            Some(&OptionValue::Text("9.4".to_string()))
        );
        assert_eq!(
            settings.defaults.get("enablerepo"),
            Some(&OptionValue::List(vec!["extras".to_string(), "8".to_string()]))
        );
    }

    #[test]
    fn nested_default_values_are_rejected() {
        let settings = ControllerSettings::from_yaml("defaults:\n  target:\n    major: 9\n");
        assert!(matches!(settings, Err(ConfigurationError::Settings(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let settings = ControllerSettings::from_yaml("report_dri: /tmp\n");
        assert!(matches!(settings, Err(ConfigurationError::Settings(_))));
    }

    #[test]
    fn settings_path_resolution_order() {
        let explicit = PathBuf::from("/tmp/a.yaml");
        assert_eq!(
            ControllerSettings::resolve_path(Some(&explicit), Some("/tmp/b.yaml")),
            explicit
        );
        assert_eq!(
            ControllerSettings::resolve_path(None, Some("/tmp/b.yaml")),
            PathBuf::from("/tmp/b.yaml")
        );
        assert_eq!(
            ControllerSettings::resolve_path(None, Some(" ")),
            PathBuf::from(DEFAULT_SETTINGS_PATH)
        );
    }
}
