use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use preupgrade_domain::{
    ActorError, AnswerSet, AnswerValue, Configuration, Dialog, ErrorEntry, ErrorSeverity, Message,
    ModelType, Report, ReportEntry, RunContext, RunId,
};
use serde_json::{json, Value};

use crate::context::{resolve_dialog, ActorContext, ActorLogger, LogLevel, ResourceLayout};

/// In-memory [`ActorContext`] for exercising a single actor.
///
/// Every produced message is accepted and recorded; `consume` serves the
/// configured messages regardless of the actor's declarations.
#[derive(Debug)]
pub struct MockActorContext {
    actor_name: String,
    phase_name: String,
    run_context: RunContext,
    configuration: Configuration,
    actor_config: Value,
    messages: Vec<Message>,
    answers: AnswerSet,
    resources: ResourceLayout,
    logger: ActorLogger,
    produced: RefCell<Vec<Message>>,
    reports: RefCell<Vec<ReportEntry>>,
    errors: RefCell<Vec<ErrorEntry>>,
    dialogs: RefCell<Vec<Dialog>>,
}

impl MockActorContext {
    #[must_use]
    pub fn new(actor_name: &str) -> Self {
        Self {
            actor_name: actor_name.to_string(),
            phase_name: "TestPhase".to_string(),
            run_context: RunContext::new(RunId::new()),
            configuration: Configuration::default(),
            actor_config: json!({}),
            messages: Vec::new(),
            answers: AnswerSet::default(),
            resources: ResourceLayout::default(),
            logger: ActorLogger::capturing(actor_name),
            produced: RefCell::new(Vec::new()),
            reports: RefCell::new(Vec::new()),
            errors: RefCell::new(Vec::new()),
            dialogs: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase_name = phase.to_string();
        self
    }

    #[must_use]
    pub fn with_run_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }

    #[must_use]
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    #[must_use]
    pub fn with_actor_config(mut self, actor_config: Value) -> Self {
        self.actor_config = actor_config;
        self
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    #[must_use]
    pub fn with_answers(mut self, answers: AnswerSet) -> Self {
        self.answers = answers;
        self
    }

    /// Resolve file and tool lookups against a fixture directory.
    #[must_use]
    pub fn with_fixtures(mut self, root: &Path) -> Self {
        self.resources = ResourceLayout::new(root);
        self
    }

    #[must_use]
    pub fn produced(&self) -> Vec<Message> {
        self.produced.borrow().clone()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<ReportEntry> {
        self.reports.borrow().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.errors.borrow().clone()
    }

    #[must_use]
    pub fn dialogs(&self) -> Vec<Dialog> {
        self.dialogs.borrow().clone()
    }

    #[must_use]
    pub fn log_lines(&self) -> Vec<(LogLevel, String)> {
        self.logger.lines()
    }
}

impl ActorContext for MockActorContext {
    fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn actor_config(&self) -> &Value {
        &self.actor_config
    }

    fn consume<'a>(&'a self, model: &ModelType) -> Box<dyn Iterator<Item = &'a Message> + 'a> {
        let model = model.clone();
        Box::new(
            self.messages
                .iter()
                .filter(move |message| message.model == model),
        )
    }

    fn produce(&self, mut message: Message) -> Result<(), ActorError> {
        message.producer.clone_from(&self.actor_name);
        message.phase.clone_from(&self.phase_name);
        self.produced.borrow_mut().push(message);
        Ok(())
    }

    fn report(&self, report: Report) {
        let entry = ReportEntry::from_report(report, &self.actor_name, &self.phase_name);
        self.reports.borrow_mut().push(entry);
    }

    fn report_error(&self, message: &str, severity: ErrorSeverity, details: Option<Value>) {
        let mut error = ActorError::new(message).with_severity(severity);
        error.details = details;
        let entry = error.into_entry(&self.actor_name, &self.phase_name);
        self.errors.borrow_mut().push(entry);
    }

    fn get_answers(&self, dialog: &Dialog) -> BTreeMap<String, AnswerValue> {
        self.dialogs.borrow_mut().push(dialog.clone());
        resolve_dialog(dialog, &self.answers)
    }

    fn log(&self) -> &ActorLogger {
        &self.logger
    }

    fn get_actor_file_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.actor_file(&self.actor_name, name)
    }

    fn get_common_file_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.common_file(name)
    }

    fn get_actor_tool_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.actor_tool(&self.actor_name, name)
    }

    fn get_common_tool_path(&self, name: &str) -> Option<PathBuf> {
        self.resources.common_tool(name)
    }

    fn actor_name(&self) -> &str {
        &self.actor_name
    }

    fn phase_name(&self) -> &str {
        &self.phase_name
    }
}
