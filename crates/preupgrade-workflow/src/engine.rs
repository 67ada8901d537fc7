use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use preupgrade_domain::{
    has_failing_error, now_utc, AnswerSet, Configuration, Dialog, ErrorEntry, ErrorSeverity,
    Message, ReportEntry, RunContext,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actor::Actor;
use crate::actor_config::actor_view;
use crate::bus::{MessageBus, StagedOutput};
use crate::context::{PhaseActorContext, PhaseScope, ResourceLayout};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Phase {
    pub name: String,
    pub actors: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WorkflowState {
    Pending,
    Running(String),
    Completed,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("workflow {workflow} has no phase named {phase}")]
    UnknownCheckpoint { workflow: String, phase: String },
    #[error("no such actor: {0}")]
    UnknownActor(String),
    #[error("interactive dialogs are not supported; runs must skip dialogs")]
    InteractiveDialogsUnsupported,
    #[error("workflow {0} has already been run")]
    AlreadyRun(String),
}

pub struct RunOptions<'a> {
    pub run_context: &'a RunContext,
    pub configuration: &'a Configuration,
    pub actor_config: &'a Value,
    pub until_phase: &'a str,
    pub skip_dialogs: bool,
}

/// A resolved workflow: ordered phases plus the actors they reference.
///
/// Phases run in declaration order and the run stops after the checkpoint
/// phase. Actor failures are collected, never propagated.
pub struct Workflow {
    name: String,
    phases: Vec<Phase>,
    actors: BTreeMap<String, Arc<dyn Actor>>,
    whitelist: BTreeSet<String>,
    resources: ResourceLayout,
    answers: AnswerSet,
    dialogs: Vec<Dialog>,
    bus: MessageBus,
    reports: Vec<ReportEntry>,
    errors: Vec<ErrorEntry>,
    state: WorkflowState,
    executed_phases: Vec<String>,
    skipped_actors: Vec<String>,
}

impl Workflow {
    #[must_use]
    pub fn new(name: &str, phases: Vec<Phase>, actors: BTreeMap<String, Arc<dyn Actor>>) -> Self {
        Self {
            name: name.to_string(),
            phases,
            actors,
            whitelist: BTreeSet::new(),
            resources: ResourceLayout::default(),
            answers: AnswerSet::default(),
            dialogs: Vec::new(),
            bus: MessageBus::new(),
            reports: Vec::new(),
            errors: Vec::new(),
            state: WorkflowState::Pending,
            executed_phases: Vec::new(),
            skipped_actors: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn set_resources(&mut self, resources: ResourceLayout) {
        self.resources = resources;
    }

    /// Enable an experimental actor for this run.
    ///
    /// # Errors
    /// Returns [`WorkflowError::UnknownActor`] when no actor has that name.
    pub fn whitelist_experimental(&mut self, name: &str) -> Result<(), WorkflowError> {
        if !self.actors.contains_key(name) {
            return Err(WorkflowError::UnknownActor(name.to_string()));
        }
        self.whitelist.insert(name.to_string());
        Ok(())
    }

    /// Enable the actors of an experimental feature. Names the repository does
    /// not provide are ignored.
    pub fn enable_feature_actors(&mut self, names: &[&str]) {
        for name in names {
            if self.actors.contains_key(*name) {
                self.whitelist.insert((*name).to_string());
            } else {
                tracing::debug!(actor = *name, "feature actor not present in repository");
            }
        }
    }

    #[must_use]
    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    pub fn load_answers(&mut self, answers: AnswerSet) {
        self.answers = answers;
    }

    #[must_use]
    pub fn answers(&self) -> &AnswerSet {
        &self.answers
    }

    /// Dialogs actors asked about during the run, first occurrence per scope.
    #[must_use]
    pub fn dialogs(&self) -> &[Dialog] {
        &self.dialogs
    }

    /// Execute phases up to and including `options.until_phase`.
    ///
    /// # Errors
    /// Returns a [`WorkflowError`] for structural problems only: dialogs not
    /// skipped, an unknown checkpoint, or a second run of the same workflow.
    pub fn run(&mut self, options: &RunOptions<'_>) -> Result<(), WorkflowError> {
        if !options.skip_dialogs {
            return Err(WorkflowError::InteractiveDialogsUnsupported);
        }
        if self.state != WorkflowState::Pending {
            return Err(WorkflowError::AlreadyRun(self.name.clone()));
        }
        if !self
            .phases
            .iter()
            .any(|phase| phase.name == options.until_phase)
        {
            return Err(WorkflowError::UnknownCheckpoint {
                workflow: self.name.clone(),
                phase: options.until_phase.to_string(),
            });
        }

        let phases = self.phases.clone();
        for phase in &phases {
            self.state = WorkflowState::Running(phase.name.clone());
            tracing::info!(workflow = %self.name, phase = %phase.name, "starting phase");
            for actor_name in &phase.actors {
                let Some(actor) = self.actors.get(actor_name).cloned() else {
                    self.errors.push(missing_actor_entry(actor_name, &phase.name));
                    continue;
                };
                if actor.metadata().experimental && !self.whitelist.contains(actor_name) {
                    tracing::info!(actor = %actor_name, "skipping experimental actor");
                    self.skipped_actors.push(actor_name.clone());
                    continue;
                }
                self.run_actor(actor.as_ref(), &phase.name, options);
            }
            self.executed_phases.push(phase.name.clone());
            if phase.name == options.until_phase {
                tracing::info!(phase = %phase.name, "checkpoint phase reached");
                break;
            }
        }
        self.state = WorkflowState::Completed;
        Ok(())
    }

    fn run_actor(&mut self, actor: &dyn Actor, phase: &str, options: &RunOptions<'_>) {
        let metadata = actor.metadata();
        tracing::debug!(actor = %metadata.name, phase, "executing actor");
        let scope = PhaseScope {
            run_context: options.run_context,
            configuration: options.configuration,
            actor_config: actor_view(metadata, options.actor_config),
            metadata,
            phase,
        };
        let ctx = PhaseActorContext::new(scope, &self.bus, &self.answers, &self.resources);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| actor.process(&ctx)));
        let staged = ctx.into_staged();
        self.commit(staged);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(actor = %metadata.name, phase, error = %err, "actor reported an error");
                self.errors.push(err.into_entry(&metadata.name, phase));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(actor = %metadata.name, phase, "actor crashed: {message}");
                self.errors.push(ErrorEntry {
                    actor: metadata.name.clone(),
                    phase: phase.to_string(),
                    message: format!("actor {} crashed: {message}", metadata.name),
                    severity: ErrorSeverity::Fatal,
                    details: Some(json!({ "panic": message })),
                    created_at: now_utc(),
                });
            }
        }
    }

    fn commit(&mut self, staged: StagedOutput) {
        self.bus.commit(staged.messages);
        self.reports.extend(staged.reports);
        self.errors.extend(staged.errors);
        for dialog in staged.dialogs {
            if !self.dialogs.iter().any(|seen| seen.scope == dialog.scope) {
                self.dialogs.push(dialog);
            }
        }
    }

    /// True iff at least one collected error meets the failing severity.
    #[must_use]
    pub fn failure(&self) -> bool {
        has_failing_error(&self.errors)
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    #[must_use]
    pub fn reports(&self) -> &[ReportEntry] {
        &self.reports
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.bus.messages()
    }

    #[must_use]
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    #[must_use]
    pub fn executed_phases(&self) -> &[String] {
        &self.executed_phases
    }

    #[must_use]
    pub fn skipped_actors(&self) -> &[String] {
        &self.skipped_actors
    }
}

fn missing_actor_entry(actor: &str, phase: &str) -> ErrorEntry {
    ErrorEntry {
        actor: actor.to_string(),
        phase: phase.to_string(),
        message: format!("actor {actor} is not available"),
        severity: ErrorSeverity::Fatal,
        details: None,
        created_at: now_utc(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
