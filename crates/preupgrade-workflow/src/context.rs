use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use preupgrade_domain::{
    ActorError, AnswerSet, AnswerValue, Configuration, Dialog, ErrorSeverity, Message, Model,
    ModelType, Report, ReportEntry, RunContext,
};
use serde_json::Value;

use crate::actor::ActorMetadata;
use crate::bus::{MessageBus, StagedOutput};

/// Capability surface handed to an actor while it runs.
pub trait ActorContext {
    fn run_context(&self) -> &RunContext;

    fn configuration(&self) -> &Configuration;

    /// Run-scoped configuration for the sections this actor declares.
    fn actor_config(&self) -> &Value;

    /// Messages of `model` visible at call time. Empty when the actor does not
    /// declare `model` as an input.
    fn consume<'a>(&'a self, model: &ModelType) -> Box<dyn Iterator<Item = &'a Message> + 'a>;

    #[allow(clippy::missing_errors_doc)]
    fn produce(&self, message: Message) -> Result<(), ActorError>;

    fn report(&self, report: Report);

    fn report_error(&self, message: &str, severity: ErrorSeverity, details: Option<Value>);

    /// Resolve a dialog without prompting: loaded answers first, then component defaults.
    fn get_answers(&self, dialog: &Dialog) -> BTreeMap<String, AnswerValue>;

    fn log(&self) -> &ActorLogger;

    fn get_actor_file_path(&self, name: &str) -> Option<PathBuf>;

    fn get_common_file_path(&self, name: &str) -> Option<PathBuf>;

    fn get_actor_tool_path(&self, name: &str) -> Option<PathBuf>;

    fn get_common_tool_path(&self, name: &str) -> Option<PathBuf>;

    fn actor_name(&self) -> &str;

    fn phase_name(&self) -> &str;
}

/// Typed helpers over [`ActorContext`].
pub trait ActorContextExt: ActorContext {
    /// # Errors
    /// Returns an error when a payload does not decode as `M`.
    fn consume_models<M: Model>(&self) -> Result<Vec<M>, ActorError> {
        self.consume(&M::model_type())
            .map(|message| message.decode::<M>().map_err(ActorError::from))
            .collect()
    }

    /// # Errors
    /// Returns an error when `M` cannot be serialized or is not a declared output.
    fn produce_model<M: Model>(&self, model: &M) -> Result<(), ActorError> {
        self.produce(Message::from_model(model)?)
    }
}

impl<T: ActorContext + ?Sized> ActorContextExt for T {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Logger scoped to one actor. Either forwards to `tracing` or captures lines.
#[derive(Debug)]
pub struct ActorLogger {
    actor: String,
    phase: String,
    captured: Option<Mutex<Vec<(LogLevel, String)>>>,
}

impl ActorLogger {
    #[must_use]
    pub fn new(actor: &str, phase: &str) -> Self {
        Self {
            actor: actor.to_string(),
            phase: phase.to_string(),
            captured: None,
        }
    }

    #[must_use]
    pub fn capturing(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            phase: String::new(),
            captured: Some(Mutex::new(Vec::new())),
        }
    }

    pub fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message);
    }

    /// Captured lines; always empty for a forwarding logger.
    #[must_use]
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.captured
            .as_ref()
            .and_then(|lines| lines.lock().ok().map(|lines| lines.clone()))
            .unwrap_or_default()
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if let Some(lines) = &self.captured {
            if let Ok(mut lines) = lines.lock() {
                lines.push((level, message.to_string()));
            }
            return;
        }
        let actor = self.actor.as_str();
        let phase = self.phase.as_str();
        match level {
            LogLevel::Debug => tracing::debug!(actor, phase, "{message}"),
            LogLevel::Info => tracing::info!(actor, phase, "{message}"),
            LogLevel::Warning => tracing::warn!(actor, phase, "{message}"),
            LogLevel::Error => tracing::error!(actor, phase, "{message}"),
        }
    }
}

/// Where actor-local and shared auxiliary files live.
///
/// Layout under the root: `actors/<actor>/{files,tools}/<name>` and
/// `common/{files,tools}/<name>`. Lookups return `None` for missing entries.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResourceLayout {
    root: Option<PathBuf>,
}

impl ResourceLayout {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: Some(root.to_path_buf()),
        }
    }

    #[must_use]
    pub fn actor_file(&self, actor: &str, name: &str) -> Option<PathBuf> {
        self.existing(&["actors", actor, "files", name])
    }

    #[must_use]
    pub fn common_file(&self, name: &str) -> Option<PathBuf> {
        self.existing(&["common", "files", name])
    }

    #[must_use]
    pub fn actor_tool(&self, actor: &str, name: &str) -> Option<PathBuf> {
        self.existing(&["actors", actor, "tools", name])
    }

    #[must_use]
    pub fn common_tool(&self, name: &str) -> Option<PathBuf> {
        self.existing(&["common", "tools", name])
    }

    fn existing(&self, parts: &[&str]) -> Option<PathBuf> {
        let mut path = self.root.clone()?;
        for part in parts {
            path.push(part);
        }
        path.exists().then_some(path)
    }
}

/// Fill each dialog component from `answers`, falling back to its default.
#[must_use]
pub fn resolve_dialog(dialog: &Dialog, answers: &AnswerSet) -> BTreeMap<String, AnswerValue> {
    dialog
        .components
        .iter()
        .filter_map(|component| {
            answers
                .get(&dialog.scope, &component.key)
                .cloned()
                .or_else(|| component.default.clone())
                .map(|value| (component.key.clone(), value))
        })
        .collect()
}

pub(crate) struct PhaseScope<'a> {
    pub run_context: &'a RunContext,
    pub configuration: &'a Configuration,
    pub actor_config: Value,
    pub metadata: &'a ActorMetadata,
    pub phase: &'a str,
}

/// Context the engine hands to an actor: reads the committed bus, stages writes.
pub(crate) struct PhaseActorContext<'a> {
    scope: PhaseScope<'a>,
    bus: &'a MessageBus,
    answers: &'a AnswerSet,
    resources: &'a ResourceLayout,
    logger: ActorLogger,
    staged: RefCell<StagedOutput>,
}

impl<'a> PhaseActorContext<'a> {
    pub(crate) fn new(
        scope: PhaseScope<'a>,
        bus: &'a MessageBus,
        answers: &'a AnswerSet,
        resources: &'a ResourceLayout,
    ) -> Self {
        let logger = ActorLogger::new(&scope.metadata.name, scope.phase);
        Self {
            scope,
            bus,
            answers,
            resources,
            logger,
            staged: RefCell::new(StagedOutput::default()),
        }
    }

    pub(crate) fn into_staged(self) -> StagedOutput {
        self.staged.into_inner()
    }
}

impl ActorContext for PhaseActorContext<'_> {
    fn run_context(&self) -> &RunContext {
        self.scope.run_context
    }

    fn configuration(&self) -> &Configuration {
        self.scope.configuration
    }

    fn actor_config(&self) -> &Value {
        &self.scope.actor_config
    }

    fn consume<'b>(&'b self, model: &ModelType) -> Box<dyn Iterator<Item = &'b Message> + 'b> {
        if !self.scope.metadata.declares_consumption(model) {
            self.logger.debug(&format!(
                "model {model} is not declared as consumed; returning no messages"
            ));
            return Box::new(std::iter::empty());
        }
        Box::new(self.bus.consume(model))
    }

    fn produce(&self, mut message: Message) -> Result<(), ActorError> {
        if !self.scope.metadata.declares_production(&message.model) {
            return Err(ActorError::new(format!(
                "actor {} does not declare production of model {}",
                self.scope.metadata.name, message.model
            )));
        }
        message.producer.clone_from(&self.scope.metadata.name);
        message.phase = self.scope.phase.to_string();
        self.staged.borrow_mut().messages.push(message);
        Ok(())
    }

    fn report(&self, report: Report) {
        let entry = ReportEntry::from_report(report, &self.scope.metadata.name, self.scope.phase);
        self.staged.borrow_mut().reports.push(entry);
    }

    fn report_error(&self, message: &str, severity: ErrorSeverity, details: Option<Value>) {
        let mut error = ActorError::new(message).with_severity(severity);
        error.details = details;
        let entry = error.into_entry(&self.scope.metadata.name, self.scope.phase);
        self.staged.borrow_mut().errors.push(entry);
    }

    fn get_answers(&self, dialog: &Dialog) -> BTreeMap<String, AnswerValue> {
        self.staged.borrow_mut().dialogs.push(dialog.clone());
        resolve_dialog(dialog, self.answers)
    }

    fn log(&self) -> &ActorLogger {
        &self.logger
    }

    fn get_actor_file_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.actor_file(&self.scope.metadata.name, name)
    }

    fn get_common_file_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.common_file(name)
    }

    fn get_actor_tool_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.actor_tool(&self.scope.metadata.name, name)
    }

    fn get_common_tool_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.common_tool(name)
    }

    fn actor_name(&self) -> &str {
        &self.scope.metadata.name
    }

    fn phase_name(&self) -> &str {
        self.scope.phase
    }
}
