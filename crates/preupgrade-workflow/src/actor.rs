use std::fmt;

use preupgrade_domain::{ActorError, Dialog, ModelType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ActorContext;

/// One configurable value an actor declares, with its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorConfigField {
    pub section: String,
    pub name: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActorMetadata {
    pub name: String,
    #[serde(default)]
    pub consumes: Vec<ModelType>,
    #[serde(default)]
    pub produces: Vec<ModelType>,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub config_schema: Vec<ActorConfigField>,
    #[serde(default)]
    pub dialogs: Vec<Dialog>,
}

impl ActorMetadata {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn consumes(mut self, models: &[&str]) -> Self {
        self.consumes.extend(models.iter().map(|model| ModelType::new(model)));
        self
    }

    #[must_use]
    pub fn produces(mut self, models: &[&str]) -> Self {
        self.produces.extend(models.iter().map(|model| ModelType::new(model)));
        self
    }

    #[must_use]
    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    #[must_use]
    pub fn with_config(mut self, section: &str, name: &str, default: Value) -> Self {
        self.config_schema.push(ActorConfigField {
            section: section.to_string(),
            name: name.to_string(),
            default,
            description: String::new(),
        });
        self
    }

    #[must_use]
    pub fn with_dialog(mut self, dialog: Dialog) -> Self {
        self.dialogs.push(dialog);
        self
    }

    #[must_use]
    pub fn declares_consumption(&self, model: &ModelType) -> bool {
        self.consumes.contains(model)
    }

    #[must_use]
    pub fn declares_production(&self, model: &ModelType) -> bool {
        self.produces.contains(model)
    }
}

/// An independently authored unit of work executed once per run within a phase.
pub trait Actor: Send + Sync {
    fn metadata(&self) -> &ActorMetadata;

    #[allow(clippy::missing_errors_doc)]
    fn process(&self, ctx: &dyn ActorContext) -> Result<(), ActorError>;
}

type ProcessFn = dyn Fn(&dyn ActorContext) -> Result<(), ActorError> + Send + Sync;

/// Actor backed by a closure; used for built-in actors and in tests.
pub struct FnActor {
    metadata: ActorMetadata,
    process: Box<ProcessFn>,
}

impl FnActor {
    pub fn new<F>(metadata: ActorMetadata, process: F) -> Self
    where
        F: Fn(&dyn ActorContext) -> Result<(), ActorError> + Send + Sync + 'static,
    {
        Self {
            metadata,
            process: Box::new(process),
        }
    }
}

impl fmt::Debug for FnActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnActor")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Actor for FnActor {
    fn metadata(&self) -> &ActorMetadata {
        &self.metadata
    }

    fn process(&self, ctx: &dyn ActorContext) -> Result<(), ActorError> {
        (self.process)(ctx)
    }
}
