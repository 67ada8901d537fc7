#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use preupgrade_domain::{Configuration, OptionValue, ENV_PREFIX, EXECUTION_ID_ENV};

mod settings;

pub use settings::{
    ControllerSettings, ResourceLimits, DEFAULT_SETTINGS_PATH, REPORT_JSON_FILE, REPORT_TEXT_FILE,
    RUN_LOG_FILE, SETTINGS_ENV,
};

pub const REPORT_SCHEMA_VERSIONS: [&str; 3] = ["1.0.0", "1.1.0", "1.2.0"];
pub const CHANNELS: [&str; 4] = ["ga", "e4s", "eus", "aus"];
pub const UNSUPPORTED_ENV: &str = "PREUPGRADE_UNSUPPORTED";
pub const DEVEL_ENV_PREFIX: &str = "PREUPGRADE_DEVEL_";

/// One layer of option values keyed by option name.
pub type OptionLayer = BTreeMap<String, OptionValue>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigurationError {
    #[error("unknown option {name} in {layer} options")]
    UnknownOption { layer: &'static str, name: String },
    #[error("option {name} expects a {expected} value, got {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid choice for {name}: {value} (choose from {})", .choices.join(", "))]
    InvalidChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },
    #[error("settings error: {0}")]
    Settings(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptionKind {
    Flag,
    Text,
    List,
}

impl OptionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Text => "text",
            Self::List => "list",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OptionDescriptor {
    pub name: String,
    pub kind: OptionKind,
    pub choices: Vec<String>,
    pub case_insensitive: bool,
    pub default: OptionValue,
}

impl OptionDescriptor {
    #[must_use]
    pub fn flag(name: &str) -> Self {
        Self::new(name, OptionKind::Flag, OptionValue::Flag(false))
    }

    #[must_use]
    pub fn text(name: &str) -> Self {
        Self::new(name, OptionKind::Text, OptionValue::Unset)
    }

    #[must_use]
    pub fn list(name: &str) -> Self {
        Self::new(name, OptionKind::List, OptionValue::List(Vec::new()))
    }

    fn new(name: &str, kind: OptionKind, default: OptionValue) -> Self {
        Self {
            name: name.to_string(),
            kind,
            choices: Vec::new(),
            case_insensitive: false,
            default,
        }
    }

    #[must_use]
    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|choice| (*choice).to_string()).collect();
        self
    }

    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: OptionValue) -> Self {
        self.default = default;
        self
    }

    fn normalize(&self, value: OptionValue) -> Result<OptionValue, ConfigurationError> {
        let value = match (self.kind, value) {
            (_, OptionValue::Unset) => OptionValue::Unset,
            (OptionKind::Flag, OptionValue::Flag(flag)) => OptionValue::Flag(flag),
            (OptionKind::Text, OptionValue::Text(text)) => OptionValue::Text(self.fold_case(&text)),
            (OptionKind::List, OptionValue::Text(text)) => {
                OptionValue::List(vec![self.fold_case(&text)])
            }
            (OptionKind::List, OptionValue::List(items)) => {
                OptionValue::List(items.iter().map(|item| self.fold_case(item)).collect())
            }
            (kind, other) => {
                return Err(ConfigurationError::TypeMismatch {
                    name: self.name.clone(),
                    expected: kind.as_str(),
                    found: other.kind_name(),
                })
            }
        };
        self.validate_choices(&value)?;
        Ok(value)
    }

    fn fold_case(&self, value: &str) -> String {
        if self.case_insensitive {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }

    fn validate_choices(&self, value: &OptionValue) -> Result<(), ConfigurationError> {
        if self.choices.is_empty() {
            return Ok(());
        }
        let candidates: Vec<&String> = match value {
            OptionValue::Text(text) => vec![text],
            OptionValue::List(items) => items.iter().collect(),
            OptionValue::Flag(_) | OptionValue::Unset => Vec::new(),
        };
        for candidate in candidates {
            if !self.choices.iter().any(|choice| choice == candidate) {
                return Err(ConfigurationError::InvalidChoice {
                    name: self.name.clone(),
                    value: candidate.clone(),
                    choices: self.choices.clone(),
                });
            }
        }
        Ok(())
    }
}

/// `when` being set turns `then` on, unless `then` was given explicitly.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ImpliedOption {
    pub when: String,
    pub then: String,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConfigSchema {
    descriptors: Vec<OptionDescriptor>,
    implied: Vec<ImpliedOption>,
}

impl ConfigSchema {
    #[must_use]
    pub fn new(descriptors: Vec<OptionDescriptor>) -> Self {
        Self {
            descriptors,
            implied: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_implied(mut self, when: &str, then: &str) -> Self {
        self.implied.push(ImpliedOption {
            when: when.to_string(),
            then: then.to_string(),
        });
        self
    }

    /// Option set of the `preupgrade` command.
    #[must_use]
    pub fn preupgrade(report_schema_default: &str) -> Self {
        let feature_names: Vec<&str> = EXPERIMENTAL_FEATURES
            .iter()
            .map(|feature| feature.name)
            .collect();
        Self::new(vec![
            OptionDescriptor::list("whitelist_experimental"),
            OptionDescriptor::list("enable_experimental_feature").with_choices(&feature_names),
            OptionDescriptor::flag("debug"),
            OptionDescriptor::flag("verbose"),
            OptionDescriptor::flag("no_rhsm"),
            OptionDescriptor::flag("no_insights_register"),
            OptionDescriptor::flag("no_rhsm_facts"),
            OptionDescriptor::list("enablerepo"),
            OptionDescriptor::text("channel")
                .with_choices(&CHANNELS)
                .case_insensitive(),
            OptionDescriptor::text("iso"),
            OptionDescriptor::text("target"),
            OptionDescriptor::text("report_schema")
                .with_choices(&REPORT_SCHEMA_VERSIONS)
                .with_default(OptionValue::Text(report_schema_default.to_string())),
            OptionDescriptor::flag("nogpgcheck"),
        ])
        .with_implied("no_rhsm", "no_rhsm_facts")
    }

    #[must_use]
    pub fn descriptors(&self) -> &[OptionDescriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&OptionDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.name == name)
    }
}

/// Build the frozen run configuration.
///
/// Every declared option takes the first present value among `cli`, `persisted`
/// and the schema default. Implied options are resolved once, after layering.
///
/// # Errors
/// Returns [`ConfigurationError`] for unknown option names, values of the wrong
/// kind, or values outside a declared choice set.
pub fn merge(
    cli: &OptionLayer,
    schema: &ConfigSchema,
    persisted: &OptionLayer,
    environment: BTreeMap<String, String>,
) -> Result<Configuration, ConfigurationError> {
    reject_unknown("command line", cli, schema)?;
    reject_unknown("persisted", persisted, schema)?;

    let mut options = BTreeMap::new();
    let mut explicit = BTreeSet::new();
    for descriptor in &schema.descriptors {
        let from_cli = present(cli, &descriptor.name);
        let from_persisted = present(persisted, &descriptor.name);
        if from_cli.is_some() || from_persisted.is_some() {
            explicit.insert(descriptor.name.as_str());
        }
        let value = from_cli
            .or(from_persisted)
            .cloned()
            .unwrap_or_else(|| descriptor.default.clone());
        options.insert(descriptor.name.clone(), descriptor.normalize(value)?);
    }

    for rule in &schema.implied {
        let triggered = matches!(options.get(&rule.when), Some(OptionValue::Flag(true)));
        if triggered && !explicit.contains(rule.then.as_str()) {
            options.insert(rule.then.clone(), OptionValue::Flag(true));
        }
    }

    Ok(Configuration::from_parts(options, environment))
}

fn present<'a>(layer: &'a OptionLayer, name: &str) -> Option<&'a OptionValue> {
    layer
        .get(name)
        .filter(|value| !matches!(value, OptionValue::Unset))
}

fn reject_unknown(
    layer: &'static str,
    values: &OptionLayer,
    schema: &ConfigSchema,
) -> Result<(), ConfigurationError> {
    match values.keys().find(|name| schema.descriptor(name).is_none()) {
        Some(name) => Err(ConfigurationError::UnknownOption {
            layer,
            name: name.clone(),
        }),
        None => Ok(()),
    }
}

/// Keep the `PREUPGRADE_*` variables that shape a run. The run id is excluded
/// so equal invocations produce equal configurations.
#[must_use]
pub fn capture_environment<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| name.starts_with(ENV_PREFIX) && name != EXECUTION_ID_ENV)
        .collect()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExperimentalFeature {
    pub name: &'static str,
    pub actors: &'static [&'static str],
}

pub const EXPERIMENTAL_FEATURES: &[ExperimentalFeature] = &[ExperimentalFeature {
    name: "livemode",
    actors: &[
        "live_image_generator",
        "live_mode_config_scanner",
        "live_mode_reporter",
        "prepare_live_image",
        "emit_livemode_requirements_tasks",
        "remove_live_image",
        "apply_live_mode_modifications",
    ],
}];

#[must_use]
pub fn experimental_feature(name: &str) -> Option<&'static ExperimentalFeature> {
    EXPERIMENTAL_FEATURES
        .iter()
        .find(|feature| feature.name == name)
}

/// Help text listing the available experimental features.
#[must_use]
pub fn available_features_help() -> String {
    EXPERIMENTAL_FEATURES
        .iter()
        .map(|feature| format!("{} ({})", feature.name, feature.actors.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Actor names enabled by `--whitelist-experimental` and
/// `--enable-experimental-feature`, deduplicated and sorted.
#[must_use]
pub fn experimental_whitelist(configuration: &Configuration) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = configuration
        .list("whitelist_experimental")
        .iter()
        .cloned()
        .collect();
    for feature_name in configuration.list("enable_experimental_feature") {
        if let Some(feature) = experimental_feature(feature_name) {
            names.extend(feature.actors.iter().map(|actor| (*actor).to_string()));
        }
    }
    names
}

/// Advisory warnings for runs outside the supported upgrade paths.
#[must_use]
pub fn unsupported_warnings(
    configuration: &Configuration,
    supported_targets: &[String],
) -> Vec<String> {
    let mut warnings = Vec::new();
    let environment = configuration.environment();
    if environment.get(UNSUPPORTED_ENV).map(String::as_str) == Some("1") {
        let devel: Vec<String> = environment
            .iter()
            .filter(|(name, _)| name.starts_with(DEVEL_ENV_PREFIX))
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        let experimental = experimental_whitelist(configuration);
        if !devel.is_empty() || !experimental.is_empty() {
            let mut message =
                "upgrade is running in unsupported mode; no support is provided".to_string();
            if !devel.is_empty() {
                message.push_str(&format!("; development variables: {}", devel.join(", ")));
            }
            if !experimental.is_empty() {
                let names: Vec<String> = experimental.into_iter().collect();
                message.push_str(&format!("; experimental actors: {}", names.join(", ")));
            }
            warnings.push(message);
        }
    }
    if let Some(target) = configuration.text("target") {
        if !supported_targets.is_empty() && !supported_targets.iter().any(|item| item == target) {
            warnings.push(format!(
                "target version {target} is not a supported upgrade path (supported: {})",
                supported_targets.join(", ")
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layer(values: &[(&str, OptionValue)]) -> OptionLayer {
        values
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    fn must(result: Result<Configuration, ConfigurationError>) -> Configuration {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn cli_wins_over_persisted_and_schema_defaults() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("target", OptionValue::Text("9.4".to_string()))]);
        let persisted = layer(&[
            ("target", OptionValue::Text("9.2".to_string())),
            ("report_schema", OptionValue::Text("1.1.0".to_string())),
        ]);
        let config = must(merge(&cli, &schema, &persisted, BTreeMap::new()));
        assert_eq!(config.text("target"), Some("9.4"));
        assert_eq!(config.text("report_schema"), Some("1.1.0"));
        assert!(!config.flag("debug"));
        assert!(config.list("enablerepo").is_empty());
        assert_eq!(config.get("iso"), Some(&OptionValue::Unset));
    }

    #[test]
    fn schema_default_applies_when_no_layer_sets_value() {
        let schema = ConfigSchema::preupgrade("1.0.0");
        let config = must(merge(
            &OptionLayer::new(),
            &schema,
            &OptionLayer::new(),
            BTreeMap::new(),
        ));
        assert_eq!(config.text("report_schema"), Some("1.0.0"));
    }

    #[test]
    fn channel_is_case_insensitive() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("channel", OptionValue::Text("EUS".to_string()))]);
        let config = must(merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new()));
        assert_eq!(config.text("channel"), Some("eus"));
    }

    #[test]
    fn enumerated_values_outside_choices_are_rejected() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        for (name, value) in [
            ("channel", OptionValue::Text("beta".to_string())),
            ("report_schema", OptionValue::Text("2.0.0".to_string())),
            ("report_schema", OptionValue::Text("1.2.0 ".to_string())),
            (
                "enable_experimental_feature",
                OptionValue::List(vec!["livemode".to_string(), "turbo".to_string()]),
            ),
        ] {
            let cli = layer(&[(name, value)]);
            let result = merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new());
            assert!(
                matches!(result, Err(ConfigurationError::InvalidChoice { .. })),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn choices_are_case_sensitive_by_default() {
        let schema = ConfigSchema::new(vec![OptionDescriptor::text("mode").with_choices(&["a"])]);
        let cli = layer(&[("mode", OptionValue::Text("A".to_string()))]);
        assert!(merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new()).is_err());
    }

    #[test]
    fn unknown_option_names_are_rejected() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let persisted = layer(&[("colour", OptionValue::Flag(true))]);
        let result = merge(&OptionLayer::new(), &schema, &persisted, BTreeMap::new());
        assert_eq!(
            result,
            Err(ConfigurationError::UnknownOption {
                layer: "persisted",
                name: "colour".to_string(),
            })
        );
    }

    #[test]
    fn wrong_value_kind_is_rejected() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("debug", OptionValue::Text("yes".to_string()))]);
        let result = merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new());
        assert!(matches!(
            result,
            Err(ConfigurationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn no_rhsm_implies_no_rhsm_facts() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("no_rhsm", OptionValue::Flag(true))]);
        let config = must(merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new()));
        assert!(config.flag("no_rhsm_facts"));
    }

    #[test]
    fn explicit_dependent_value_overrides_implication() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("no_rhsm", OptionValue::Flag(true))]);
        let persisted = layer(&[("no_rhsm_facts", OptionValue::Flag(false))]);
        let config = must(merge(&cli, &schema, &persisted, BTreeMap::new()));
        assert!(config.flag("no_rhsm"));
        assert!(!config.flag("no_rhsm_facts"));
    }

    #[test]
    fn environment_capture_keeps_prefixed_variables_only() {
        let captured = capture_environment(vec![
            ("PREUPGRADE_UNSUPPORTED".to_string(), "1".to_string()),
            ("PREUPGRADE_EXECUTION_ID".to_string(), "x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        assert_eq!(captured.len(), 1);
        assert_eq!(
            captured.get("PREUPGRADE_UNSUPPORTED").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn whitelist_includes_feature_actors() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[
            (
                "whitelist_experimental",
                OptionValue::List(vec!["zeta_check".to_string()]),
            ),
            (
                "enable_experimental_feature",
                OptionValue::List(vec!["livemode".to_string()]),
            ),
        ]);
        let config = must(merge(&cli, &schema, &OptionLayer::new(), BTreeMap::new()));
        let names = experimental_whitelist(&config);
        assert!(names.contains("zeta_check"));
        assert!(names.contains("live_mode_reporter"));
    }

    #[test]
    fn unsupported_mode_and_unknown_target_warn() {
        let schema = ConfigSchema::preupgrade("1.2.0");
        let cli = layer(&[("target", OptionValue::Text("7.9".to_string()))]);
        let mut environment = BTreeMap::new();
        environment.insert(UNSUPPORTED_ENV.to_string(), "1".to_string());
        environment.insert("PREUPGRADE_DEVEL_SKIP_CHECK".to_string(), "1".to_string());
        let config = must(merge(&cli, &schema, &OptionLayer::new(), environment));

        let warnings = unsupported_warnings(&config, &["9.4".to_string()]);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("PREUPGRADE_DEVEL_SKIP_CHECK=1"));
        assert!(warnings[1].contains("7.9"));

        let quiet = must(merge(
            &OptionLayer::new(),
            &schema,
            &OptionLayer::new(),
            BTreeMap::new(),
        ));
        assert!(unsupported_warnings(&quiet, &["9.4".to_string()]).is_empty());
    }

    fn flag_layer() -> impl Strategy<Value = OptionLayer> {
        (
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            prop::collection::vec("[a-z]{1,6}", 0..4),
            prop::option::of(prop::sample::select(vec!["GA", "eus", "E4s", "aus"])),
        )
            .prop_map(|(debug, no_rhsm, facts, repos, channel)| {
                let mut values = OptionLayer::new();
                if debug {
                    values.insert("debug".to_string(), OptionValue::Flag(true));
                }
                if no_rhsm {
                    values.insert("no_rhsm".to_string(), OptionValue::Flag(true));
                }
                if facts {
                    values.insert("no_rhsm_facts".to_string(), OptionValue::Flag(false));
                }
                if !repos.is_empty() {
                    values.insert("enablerepo".to_string(), OptionValue::List(repos));
                }
                if let Some(channel) = channel {
                    values.insert("channel".to_string(), OptionValue::Text(channel.to_string()));
                }
                values
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_merge_is_deterministic(cli in flag_layer(), persisted in flag_layer()) {
            let schema = ConfigSchema::preupgrade("1.2.0");
            let first = must(merge(&cli, &schema, &persisted, BTreeMap::new()));
            let second = must(merge(&cli, &schema, &persisted, BTreeMap::new()));
            prop_assert_eq!(first.hash().ok(), second.hash().ok());
            prop_assert_eq!(first, second);
        }
    }
}
