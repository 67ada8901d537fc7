#![forbid(unsafe_code)]

mod actor;
mod actor_config;
mod answers;
mod bus;
mod command_actor;
mod context;
mod engine;
mod repository;
pub mod testing;

pub use actor::{Actor, ActorConfigField, ActorMetadata, FnActor};
pub use actor_config::{actor_view, load_actor_config_overrides, merge_actor_config};
pub use answers::{AnswerFileStore, YamlAnswerFile};
pub use bus::{MessageBus, StagedOutput};
pub use command_actor::{CommandActor, ACTOR_NAME_ENV, PHASE_NAME_ENV};
pub use context::{
    resolve_dialog, ActorContext, ActorContextExt, ActorLogger, LogLevel, ResourceLayout,
};
pub use engine::{Phase, RunOptions, Workflow, WorkflowError, WorkflowState};
pub use repository::{
    normalize_repository_yaml, ActorDocument, ActorRepository, LoadError,
    NormalizedRepositoryEnvelope, RepositoryDocument, RepositoryLoader, WorkflowDocument,
    YamlRepositoryLoader,
};
