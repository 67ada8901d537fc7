use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use preupgrade_domain::{ensure_non_empty, hash_bytes, hash_json, Dialog, ModelType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actor::{Actor, ActorConfigField, ActorMetadata};
use crate::command_actor::CommandActor;
use crate::engine::{Phase, Workflow};

const NORMALIZATION_VERSION: u32 = 1;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LoadError {
    #[error("failed to read repository {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid repository: {0}")]
    Invalid(String),
    #[error("no workflow named {0}")]
    WorkflowNotFound(String),
    #[error("workflow {workflow} phase {phase} references unknown actor {actor}")]
    UnknownActor {
        workflow: String,
        phase: String,
        actor: String,
    },
}

/// Discovers the available actors and workflows.
pub trait RepositoryLoader {
    #[allow(clippy::missing_errors_doc)]
    fn load(&self) -> Result<ActorRepository, LoadError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorDocument {
    pub name: String,
    #[serde(default)]
    pub consumes: Vec<ModelType>,
    #[serde(default)]
    pub produces: Vec<ModelType>,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default)]
    pub config: Vec<ActorConfigField>,
    #[serde(default)]
    pub dialogs: Vec<Dialog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowDocument {
    pub name: String,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryDocument {
    pub repository_name: String,
    #[serde(default)]
    pub normalization_version: u32,
    #[serde(default)]
    pub actors: Vec<ActorDocument>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRepositoryEnvelope {
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub document: RepositoryDocument,
    pub normalized_json: Value,
}

/// Normalize repository YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_repository_yaml(yaml: &str) -> Result<NormalizedRepositoryEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut document: RepositoryDocument = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid repository YAML structure: {err}"))?;

    validate_repository(&document)?;
    normalize_repository(&mut document);
    validate_repository(&document)?;

    let normalized_json = serde_json::to_value(&document)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(NormalizedRepositoryEnvelope {
        source_yaml_hash,
        normalized_hash,
        document,
        normalized_json,
    })
}

fn validate_repository(document: &RepositoryDocument) -> Result<()> {
    ensure_non_empty("repository_name", &document.repository_name)?;

    let mut actor_names = BTreeSet::new();
    for actor in &document.actors {
        ensure_non_empty("actor name", &actor.name)?;
        if !actor_names.insert(actor.name.as_str()) {
            return Err(anyhow!("duplicate actor: {}", actor.name));
        }
        for model in actor.consumes.iter().chain(&actor.produces) {
            ensure_non_empty("model name", model.as_str())?;
        }
        if actor.command.first().is_some_and(|program| program.trim().is_empty()) {
            return Err(anyhow!("actor {} has an empty command", actor.name));
        }
    }

    let mut workflow_names = BTreeSet::new();
    for workflow in &document.workflows {
        ensure_non_empty("workflow name", &workflow.name)?;
        if !workflow_names.insert(workflow.name.as_str()) {
            return Err(anyhow!("duplicate workflow: {}", workflow.name));
        }
        if workflow.phases.is_empty() {
            return Err(anyhow!("workflow {} has no phases", workflow.name));
        }
        let mut phase_names = BTreeSet::new();
        for phase in &workflow.phases {
            ensure_non_empty("phase name", &phase.name)?;
            if !phase_names.insert(phase.name.as_str()) {
                return Err(anyhow!(
                    "workflow {} has duplicate phase {}",
                    workflow.name,
                    phase.name
                ));
            }
            for actor in &phase.actors {
                if !actor_names.contains(actor.as_str()) {
                    return Err(anyhow!(
                        "workflow {} phase {} references unknown actor {}",
                        workflow.name,
                        phase.name,
                        actor
                    ));
                }
            }
        }
    }
    Ok(())
}

fn normalize_repository(document: &mut RepositoryDocument) {
    document.normalization_version = NORMALIZATION_VERSION;
    document.repository_name = document.repository_name.trim().to_string();

    document.actors.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
    for actor in &mut document.actors {
        actor.consumes.sort();
        actor.consumes.dedup();
        actor.produces.sort();
        actor.produces.dedup();
        actor
            .config
            .sort_by(|lhs, rhs| (&lhs.section, &lhs.name).cmp(&(&rhs.section, &rhs.name)));
    }
    document.workflows.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
}

/// Loaded actors and workflow definitions.
#[derive(Default)]
pub struct ActorRepository {
    name: String,
    actors: BTreeMap<String, Arc<dyn Actor>>,
    workflows: BTreeMap<String, Vec<Phase>>,
    normalized_hash: Option<String>,
}

impl ActorRepository {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn normalized_hash(&self) -> Option<&str> {
        self.normalized_hash.as_deref()
    }

    pub fn add_actor(&mut self, actor: Arc<dyn Actor>) {
        self.actors.insert(actor.metadata().name.clone(), actor);
    }

    pub fn add_workflow(&mut self, name: &str, phases: Vec<Phase>) {
        self.workflows.insert(name.to_string(), phases);
    }

    #[must_use]
    pub fn lookup_actor(&self, name: &str) -> Option<&Arc<dyn Actor>> {
        self.actors.get(name)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Arc<dyn Actor>> {
        self.actors.values()
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &String> {
        self.workflows.keys()
    }

    /// Build a runnable [`Workflow`] by name.
    ///
    /// # Errors
    /// Returns [`LoadError`] when the workflow is unknown or one of its phases
    /// names an actor the repository does not provide.
    pub fn resolve_workflow(&self, name: &str) -> Result<Workflow, LoadError> {
        let phases = self
            .workflows
            .get(name)
            .ok_or_else(|| LoadError::WorkflowNotFound(name.to_string()))?;
        for phase in phases {
            for actor in &phase.actors {
                if !self.actors.contains_key(actor) {
                    return Err(LoadError::UnknownActor {
                        workflow: name.to_string(),
                        phase: phase.name.clone(),
                        actor: actor.clone(),
                    });
                }
            }
        }
        Ok(Workflow::new(name, phases.clone(), self.actors.clone()))
    }
}

/// Loads a repository from a YAML document on disk.
///
/// Actors with a `command` run as child processes; actors without one must be
/// registered as built-ins.
pub struct YamlRepositoryLoader {
    path: PathBuf,
    builtins: BTreeMap<String, Arc<dyn Actor>>,
}

impl YamlRepositoryLoader {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            builtins: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_builtin(mut self, actor: Arc<dyn Actor>) -> Self {
        self.builtins.insert(actor.metadata().name.clone(), actor);
        self
    }

    /// # Errors
    /// Returns [`LoadError::Invalid`] for malformed documents or actors without
    /// an implementation.
    pub fn load_str(&self, yaml: &str) -> Result<ActorRepository, LoadError> {
        let envelope =
            normalize_repository_yaml(yaml).map_err(|err| LoadError::Invalid(format!("{err:#}")))?;
        let document = envelope.document;

        let mut repository = ActorRepository::new(&document.repository_name);
        repository.normalized_hash = Some(envelope.normalized_hash);
        for actor in document.actors {
            if actor.command.is_empty() {
                let builtin = self.builtins.get(&actor.name).ok_or_else(|| {
                    LoadError::Invalid(format!(
                        "actor {} has no command and no built-in implementation",
                        actor.name
                    ))
                })?;
                repository.add_actor(Arc::clone(builtin));
                continue;
            }
            let metadata = ActorMetadata {
                name: actor.name,
                consumes: actor.consumes,
                produces: actor.produces,
                experimental: actor.experimental,
                config_schema: actor.config,
                dialogs: actor.dialogs,
            };
            repository.add_actor(Arc::new(CommandActor::new(metadata, actor.command)));
        }
        for workflow in document.workflows {
            repository.add_workflow(&workflow.name, workflow.phases);
        }
        tracing::debug!(
            repository = %repository.name(),
            hash = repository.normalized_hash().unwrap_or_default(),
            "repository loaded"
        );
        Ok(repository)
    }
}

impl RepositoryLoader for YamlRepositoryLoader {
    fn load(&self) -> Result<ActorRepository, LoadError> {
        let content = fs::read_to_string(&self.path).map_err(|err| LoadError::Read {
            path: self.path.display().to_string(),
            message: err.to_string(),
        })?;
        self.load_str(&content)
    }
}
