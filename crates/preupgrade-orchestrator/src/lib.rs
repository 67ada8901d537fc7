#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use preupgrade_audit_core::ExecutionStore;
use preupgrade_config::{
    capture_environment, experimental_feature, merge, unsupported_warnings, ConfigSchema,
    ControllerSettings, OptionLayer, RUN_LOG_FILE,
};
use preupgrade_domain::{
    format_rfc3339, now_utc, CommandError, Configuration, DateTimeUtc, Execution, ExecutionResult,
    RunContext, RunId, RunStatus,
};
use preupgrade_workflow::{
    load_actor_config_overrides, merge_actor_config, AnswerFileStore, RepositoryLoader,
    ResourceLayout, RunOptions, Workflow,
};

mod breadcrumbs;
mod host;
mod logging;
mod report;
mod summary;

pub use breadcrumbs::{Breadcrumb, BreadcrumbWriter, JsonBreadcrumbs};
pub use host::{HostGuard, ProcessHostGuard, ROOT_REQUIRED_MESSAGE};
pub use logging::{FileLogSink, LogSink, RunLogger, Verbosity, ARCHIVE_DIR, LOG_FILTER_ENV};
pub use report::{
    collect_entries, render_json, render_text, FileReportRenderer, ReportRenderer, ERROR_GROUP,
    FAILURE_GROUP, INHIBITOR_GROUP,
};
pub use summary::RunSummary;

pub const EXECUTION_KIND: &str = "preupgrade";
pub const WORKFLOW_NAME: &str = "IPUWorkflow";
pub const CHECKPOINT_PHASE: &str = "ReportsPhase";

/// Inputs of one `preupgrade` invocation.
#[derive(Debug, Clone, Default)]
pub struct PreupgradeRequest {
    /// Options given on the command line; absent options are simply missing.
    pub cli: OptionLayer,
    pub settings: ControllerSettings,
    /// Raw process environment; only `PREUPGRADE_*` variables are kept.
    pub environment: BTreeMap<String, String>,
    /// Invocation argv, recorded in breadcrumbs.
    pub executed: Vec<String>,
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub failed: bool,
    pub report_files: Vec<PathBuf>,
    pub summary: RunSummary,
}

impl RunOutcome {
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(self.failed)
    }
}

/// Drives one preupgrade run against its collaborators.
pub struct Preupgrade<'a> {
    host: &'a dyn HostGuard,
    loader: &'a dyn RepositoryLoader,
    store: &'a dyn ExecutionStore,
    log_sink: &'a dyn LogSink,
    answer_store: &'a dyn AnswerFileStore,
    renderer: &'a dyn ReportRenderer,
    breadcrumbs: &'a dyn BreadcrumbWriter,
}

impl<'a> Preupgrade<'a> {
    #[must_use]
    pub fn new(
        host: &'a dyn HostGuard,
        loader: &'a dyn RepositoryLoader,
        store: &'a dyn ExecutionStore,
        log_sink: &'a dyn LogSink,
        answer_store: &'a dyn AnswerFileStore,
        renderer: &'a dyn ReportRenderer,
        breadcrumbs: &'a dyn BreadcrumbWriter,
    ) -> Self {
        Self {
            host,
            loader,
            store,
            log_sink,
            answer_store,
            renderer,
            breadcrumbs,
        }
    }

    /// Run the workflow up to and including the reports phase.
    ///
    /// Actor failures only set [`RunOutcome::failed`]; an `Err` means the run
    /// was aborted before reports were produced. Store failures after the
    /// execution record show up as summary warnings.
    ///
    /// # Errors
    /// Returns [`CommandError`] when the caller lacks privilege, the
    /// configuration is invalid, the execution record cannot be stored, the
    /// actor repository cannot be loaded, or run artifacts cannot be written.
    pub fn run(&self, request: &PreupgradeRequest) -> Result<RunOutcome, CommandError> {
        self.host.require_full_privilege()?;

        let run_id = request.run_id.unwrap_or_default();
        let configuration = configure(request)?;
        let execution = Execution::new(run_id, EXECUTION_KIND, configuration.clone())
            .map_err(|err| persistence(&err))?;
        self.store.disable_sync().map_err(|err| persistence(&err))?;
        self.store
            .record_execution(&execution)
            .map_err(|err| persistence(&err))?;
        let run_start = execution.created_at;

        let archived = self
            .log_sink
            .archive_previous_logs()
            .map_err(|err| CommandError::Io(format!("failed to archive logs: {err:#}")))?;
        let logger = self
            .log_sink
            .attach(RUN_LOG_FILE, Verbosity::from_configuration(&configuration))
            .map_err(|err| CommandError::Io(format!("failed to open run log: {err:#}")))?;

        logger.scope(|| {
            tracing::info!(run_id = %run_id, archived = archived.len(), "preupgrade run started");
            let result = self.execute(run_id, &configuration, request);
            if let Err(err) = &result {
                tracing::error!(run_id = %run_id, "{err}");
            }
            self.leave_breadcrumb(request, run_id, run_start, result.as_ref().ok());
            result
        })
    }

    #[allow(clippy::too_many_lines)]
    fn execute(
        &self,
        run_id: RunId,
        configuration: &Configuration,
        request: &PreupgradeRequest,
    ) -> Result<RunOutcome, CommandError> {
        let settings = &request.settings;
        let run_context = RunContext::new(run_id);

        let repository = self
            .loader
            .load()
            .map_err(|err| CommandError::Load(format!("failed to load actors: {err}")))?;
        let mut workflow = repository
            .resolve_workflow(WORKFLOW_NAME)
            .map_err(|err| CommandError::Load(format!("failed to load workflow: {err}")))?;
        workflow.set_resources(ResourceLayout::new(&settings.resource_dir));

        if let Err(err) = self.host.apply_resource_limits(&settings.resource_limits) {
            tracing::warn!("could not apply resource limits: {err:#}");
        }

        let mut warnings = Vec::new();
        let overrides = load_actor_config_overrides(&settings.actor_config_dir)
            .map_err(|err| CommandError::Configuration(format!("{err:#}")))?;
        let actor_config = merge_actor_config(&repository, &overrides);
        if let Err(err) = self.store.store_actor_config(run_id, &actor_config) {
            warnings.push(store_warning("actor configuration", &err));
        }

        for warning in unsupported_warnings(configuration, &settings.supported_targets) {
            tracing::warn!("{warning}");
            warnings.push(warning);
        }

        whitelist_experimental(&mut workflow, configuration)?;

        let answers = self
            .answer_store
            .load(&settings.answer_file, &settings.user_choices_file)
            .map_err(|err| CommandError::Io(format!("failed to load answers: {err:#}")))?;
        workflow.load_answers(answers);

        tracing::info!(until_phase = CHECKPOINT_PHASE, "executing workflow");
        workflow
            .run(&RunOptions {
                run_context: &run_context,
                configuration,
                actor_config: &actor_config,
                until_phase: CHECKPOINT_PHASE,
                skip_dialogs: true,
            })
            .map_err(|err| CommandError::Load(err.to_string()))?;

        tracing::info!(path = %settings.answer_file.display(), "saving answers");
        self.answer_store
            .save(
                &settings.answer_file,
                &settings.user_choices_file,
                workflow.answers(),
                workflow.dialogs(),
            )
            .map_err(|err| CommandError::Io(format!("failed to save answers: {err:#}")))?;

        warnings.extend(self.persist_outcome(run_id, &workflow));
        let schema = configuration
            .text("report_schema")
            .unwrap_or(&settings.report_schema);
        let report_files = self
            .renderer
            .render(run_id, schema, workflow.reports(), workflow.errors())
            .map_err(|err| CommandError::Io(format!("failed to generate reports: {err:#}")))?;

        let failed = workflow.failure();
        let result = ExecutionResult {
            run_id,
            status: if failed {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            },
            error_count: workflow.errors().len(),
            report_count: workflow.reports().len(),
            finished_at: now_utc(),
        };
        if let Err(err) = self.store.record_result(&result) {
            warnings.push(store_warning("run result", &err));
        }

        for error in workflow.errors() {
            tracing::error!(actor = %error.actor, phase = %error.phase, "{}", error.message);
        }
        let summary = RunSummary {
            run_id,
            failed,
            errors: workflow.errors().to_vec(),
            warnings,
            report_files: report_files.clone(),
            log_files: settings.log_files(),
            answer_file: settings.answer_file.clone(),
        };
        tracing::info!(run_id = %run_id, failed, "preupgrade run finished");
        Ok(RunOutcome {
            run_id,
            failed,
            report_files,
            summary,
        })
    }

    /// Stores what the workflow produced; failures are returned as warnings.
    fn persist_outcome(&self, run_id: RunId, workflow: &Workflow) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Err(err) = self.store.append_messages(run_id, workflow.messages()) {
            warnings.push(store_warning("messages", &err));
        }
        if let Err(err) = self.store.append_report_entries(run_id, workflow.reports()) {
            warnings.push(store_warning("report entries", &err));
        }
        if let Err(err) = self.store.append_error_entries(run_id, workflow.errors()) {
            warnings.push(store_warning("error entries", &err));
        }
        warnings
    }

    fn leave_breadcrumb(
        &self,
        request: &PreupgradeRequest,
        run_id: RunId,
        run_start: DateTimeUtc,
        outcome: Option<&RunOutcome>,
    ) {
        let breadcrumb = Breadcrumb {
            activity: EXECUTION_KIND.to_string(),
            run_id: run_id.to_string(),
            executed: request.executed.join(" "),
            success: outcome.is_some_and(|outcome| !outcome.failed),
            run_start: format_rfc3339(run_start).unwrap_or_default(),
            run_end: format_rfc3339(now_utc()).unwrap_or_default(),
            report_files: outcome
                .map(|outcome| {
                    outcome
                        .report_files
                        .iter()
                        .map(|path| path.display().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            answerfile: outcome.map(|_| request.settings.answer_file.display().to_string()),
        };
        if let Err(err) = self.breadcrumbs.write(&breadcrumb) {
            tracing::warn!("failed to write breadcrumbs: {err:#}");
        }
    }
}

fn configure(request: &PreupgradeRequest) -> Result<Configuration, CommandError> {
    let schema = ConfigSchema::preupgrade(&request.settings.report_schema);
    let environment = capture_environment(request.environment.clone());
    merge(&request.cli, &schema, &request.settings.defaults, environment)
        .map_err(|err| CommandError::Configuration(err.to_string()))
}

fn whitelist_experimental(
    workflow: &mut Workflow,
    configuration: &Configuration,
) -> Result<(), CommandError> {
    for name in configuration.list("whitelist_experimental") {
        workflow
            .whitelist_experimental(name)
            .map_err(|err| CommandError::Configuration(err.to_string()))?;
    }
    for name in configuration.list("enable_experimental_feature") {
        if let Some(feature) = experimental_feature(name) {
            workflow.enable_feature_actors(feature.actors);
        }
    }
    if !workflow.whitelist().is_empty() {
        tracing::info!(
            actors = ?workflow.whitelist(),
            "experimental actors enabled"
        );
    }
    Ok(())
}

fn persistence(err: &anyhow::Error) -> CommandError {
    CommandError::Persistence(format!("{err:#}"))
}

fn store_warning(what: &str, err: &anyhow::Error) -> String {
    let warning = format!("failed to store {what}: {err:#}");
    tracing::error!("{warning}");
    warning
}
