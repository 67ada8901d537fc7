#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Environment variable carrying the run identifier into spawned collaborators.
pub const EXECUTION_ID_ENV: &str = "PREUPGRADE_EXECUTION_ID";
/// Prefix of environment variables captured into the run configuration.
pub const ENV_PREFIX: &str = "PREUPGRADE_";
pub const PINNED_LOCALE: &str = "en_US.UTF-8";
pub const LOCALE_VARS: [&str; 3] = ["LANGUAGE", "LC_ALL", "LANG"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
        Ok(Self(ulid))
    }
}

/// User-facing failure of the `preupgrade` command as a whole.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CommandError {
    #[error("{0}")]
    Privilege(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Load(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
    Unset,
}

impl OptionValue {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Flag(_) => "flag",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Unset => "unset",
        }
    }
}

/// Frozen run configuration. Built once by the merger, read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Configuration {
    options: BTreeMap<String, OptionValue>,
    environment: BTreeMap<String, String>,
}

impl Configuration {
    #[must_use]
    pub fn from_parts(
        options: BTreeMap<String, OptionValue>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            options,
            environment,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.options.get(name), Some(OptionValue::Flag(true)))
    }

    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.options.get(name) {
            Some(OptionValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn list(&self, name: &str) -> &[String] {
        match self.options.get(name) {
            Some(OptionValue::List(values)) => values.as_slice(),
            _ => &[],
        }
    }

    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, OptionValue> {
        &self.options
    }

    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Canonical JSON form of the configuration.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Stable SHA-256 of the canonical JSON form.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn hash(&self) -> Result<String> {
        hash_json(&self.to_json()?)
    }
}

/// Durable audit record identifying one run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Execution {
    pub run_id: RunId,
    pub kind: String,
    pub configuration: Configuration,
    pub configuration_hash: String,
    pub created_at: DateTimeUtc,
}

impl Execution {
    /// # Errors
    /// Returns an error when the configuration cannot be hashed.
    pub fn new(run_id: RunId, kind: &str, configuration: Configuration) -> Result<Self> {
        ensure_non_empty("kind", kind)?;
        let configuration_hash = configuration.hash()?;
        Ok(Self {
            run_id,
            kind: kind.to_string(),
            configuration,
            configuration_hash,
            created_at: now_utc(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub error_count: usize,
    pub report_count: usize,
    pub finished_at: DateTimeUtc,
}

/// Explicit run-scoped context handed to every actor. Only exported to the
/// process environment when a child process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunContext {
    run_id: RunId,
    environment: BTreeMap<String, String>,
}

impl RunContext {
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert(EXECUTION_ID_ENV.to_string(), run_id.to_string());
        for name in LOCALE_VARS {
            environment.insert(name.to_string(), PINNED_LOCALE.to_string());
        }
        Self {
            run_id,
            environment,
        }
    }

    #[must_use]
    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.environment.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModelType(String);

impl ModelType {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A payload type with a fixed model name, exchanged between actors.
pub trait Model: Serialize + DeserializeOwned {
    const NAME: &'static str;

    #[must_use]
    fn model_type() -> ModelType {
        ModelType::new(Self::NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub model: ModelType,
    pub payload: Value,
    #[serde(default)]
    pub producer: String,
    #[serde(default)]
    pub phase: String,
}

impl Message {
    #[must_use]
    pub fn new(model: ModelType, payload: Value) -> Self {
        Self {
            model,
            payload,
            producer: String::new(),
            phase: String::new(),
        }
    }

    /// # Errors
    /// Returns an error if the model cannot be serialized.
    pub fn from_model<M: Model>(model: &M) -> Result<Self> {
        Ok(Self::new(M::model_type(), serde_json::to_value(model)?))
    }

    /// # Errors
    /// Returns an error when the message carries another model or the payload
    /// does not match `M`.
    pub fn decode<M: Model>(&self) -> Result<M> {
        if self.model.as_str() != M::NAME {
            return Err(anyhow!(
                "message model {} cannot be decoded as {}",
                self.model,
                M::NAME
            ));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum AnswerValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl std::fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Operator answers keyed by dialog scope, then component key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnswerSet {
    scopes: BTreeMap<String, BTreeMap<String, AnswerValue>>,
}

impl AnswerSet {
    #[must_use]
    pub fn get(&self, scope: &str, key: &str) -> Option<&AnswerValue> {
        self.scopes.get(scope).and_then(|answers| answers.get(key))
    }

    pub fn insert(&mut self, scope: &str, key: &str, value: AnswerValue) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    #[must_use]
    pub fn scope(&self, scope: &str) -> Option<&BTreeMap<String, AnswerValue>> {
        self.scopes.get(scope)
    }

    /// Overlay `other` on top of `self`; keys present in `other` win.
    pub fn overlay(&mut self, other: &AnswerSet) {
        for (scope, answers) in &other.scopes {
            for (key, value) in answers {
                self.insert(scope, key, value.clone());
            }
        }
    }

    pub fn scopes(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, AnswerValue>)> {
        self.scopes.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.values().all(BTreeMap::is_empty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DialogComponent {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub default: Option<AnswerValue>,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dialog {
    pub scope: String,
    pub title: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub components: Vec<DialogComponent>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportSeverity {
    Info,
    Low,
    Medium,
    High,
}

impl ReportSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Report content as authored by an actor.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Report {
    pub title: String,
    pub summary: String,
    pub severity: ReportSeverity,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Report {
    #[must_use]
    pub fn new(title: &str, summary: &str, severity: ReportSeverity) -> Self {
        Self {
            title: title.to_string(),
            summary: summary.to_string(),
            severity,
            groups: Vec::new(),
            key: None,
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|group| (*group).to_string()).collect();
        self
    }
}

/// A report recorded during a run, stamped with its origin.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportEntry {
    pub key: String,
    pub title: String,
    pub summary: String,
    pub severity: ReportSeverity,
    pub groups: Vec<String>,
    pub actor: String,
    pub phase: String,
    pub created_at: DateTimeUtc,
}

impl ReportEntry {
    #[must_use]
    pub fn from_report(report: Report, actor: &str, phase: &str) -> Self {
        let key = report
            .key
            .unwrap_or_else(|| hash_bytes(format!("{actor}:{}", report.title).as_bytes()));
        Self {
            key,
            title: report.title,
            summary: report.summary,
            severity: report.severity,
            groups: report.groups,
            actor: actor.to_string(),
            phase: phase.to_string(),
            created_at: now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

/// Lowest severity that marks a run as failed.
pub const FAILING_SEVERITY: ErrorSeverity = ErrorSeverity::Error;

impl ErrorSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_failing(self) -> bool {
        self >= FAILING_SEVERITY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub actor: String,
    pub phase: String,
    pub message: String,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub details: Option<Value>,
    pub created_at: DateTimeUtc,
}

/// Error signalled by an actor through the normal channel.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{message}")]
pub struct ActorError {
    pub message: String,
    pub severity: ErrorSeverity,
    pub details: Option<Value>,
}

impl ActorError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: ErrorSeverity::Error,
            details: None,
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn into_entry(self, actor: &str, phase: &str) -> ErrorEntry {
        ErrorEntry {
            actor: actor.to_string(),
            phase: phase.to_string(),
            message: self.message,
            severity: self.severity,
            details: self.details,
            created_at: now_utc(),
        }
    }
}

impl From<anyhow::Error> for ActorError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// True iff at least one entry meets the failing severity threshold.
#[must_use]
pub fn has_failing_error(errors: &[ErrorEntry]) -> bool {
    errors.iter().any(|entry| entry.severity.is_failing())
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// # Errors
/// Returns an error if the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// # Errors
/// Returns an error if the value is not RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct InstalledPackage {
        name: String,
    }

    impl Model for InstalledPackage {
        const NAME: &'static str = "InstalledPackage";
    }

    #[test]
    fn configuration_hash_is_stable_for_equal_values() {
        let mut options = BTreeMap::new();
        options.insert("debug".to_string(), OptionValue::Flag(true));
        options.insert(
            "enablerepo".to_string(),
            OptionValue::List(vec!["a".to_string()]),
        );
        let first = Configuration::from_parts(options.clone(), BTreeMap::new());
        let second = Configuration::from_parts(options, BTreeMap::new());
        let first_hash = first.hash().unwrap_or_else(|_| unreachable!());
        let second_hash = second.hash().unwrap_or_else(|_| unreachable!());
        assert_eq!(first_hash, second_hash);
        assert!(first.flag("debug"));
        assert_eq!(first.list("enablerepo"), ["a".to_string()]);
        assert!(first.text("target").is_none());
    }

    #[test]
    fn failure_threshold_ignores_warnings() {
        let warning = ActorError::new("minor")
            .with_severity(ErrorSeverity::Warning)
            .into_entry("a", "p");
        assert!(!has_failing_error(&[warning.clone(), warning.clone()]));

        let error = ActorError::new("broken").into_entry("a", "p");
        assert!(has_failing_error(&[warning, error]));
        assert!(ErrorSeverity::Fatal.is_failing());
    }

    #[test]
    fn user_answers_overlay_file_answers() {
        let mut base = AnswerSet::default();
        base.insert("remove_pam_pkcs11", "confirm", AnswerValue::Bool(false));
        base.insert("remove_pam_pkcs11", "reason", AnswerValue::Text("x".to_string()));
        let mut user = AnswerSet::default();
        user.insert("remove_pam_pkcs11", "confirm", AnswerValue::Bool(true));

        base.overlay(&user);
        assert_eq!(
            base.get("remove_pam_pkcs11", "confirm"),
            Some(&AnswerValue::Bool(true))
        );
        assert_eq!(
            base.get("remove_pam_pkcs11", "reason"),
            Some(&AnswerValue::Text("x".to_string()))
        );
    }

    #[test]
    fn message_decodes_only_its_own_model() {
        let message = Message::from_model(&InstalledPackage {
            name: "bash".to_string(),
        })
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(message.model.as_str(), "InstalledPackage");
        let decoded: InstalledPackage = message.decode().unwrap_or_else(|_| unreachable!());
        assert_eq!(decoded.name, "bash");

        let other = Message::new(ModelType::new("Other"), json!({"name": "bash"}));
        assert!(other.decode::<InstalledPackage>().is_err());
    }

    #[test]
    fn run_context_pins_locale_and_exports_run_id() {
        let run_id = RunId::new();
        let context = RunContext::new(run_id);
        assert_eq!(
            context.environment().get(EXECUTION_ID_ENV),
            Some(&run_id.to_string())
        );
        for name in LOCALE_VARS {
            assert_eq!(
                context.environment().get(name).map(String::as_str),
                Some(PINNED_LOCALE)
            );
        }
    }

    #[test]
    fn report_key_defaults_to_actor_and_title_hash() {
        let entry = ReportEntry::from_report(
            Report::new("Old kernel", "summary", ReportSeverity::High),
            "check_kernel",
            "ChecksPhase",
        );
        assert_eq!(entry.key, hash_bytes(b"check_kernel:Old kernel"));
        assert_eq!(entry.phase, "ChecksPhase");
    }
}
