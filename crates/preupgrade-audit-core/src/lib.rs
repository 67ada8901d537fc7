#![forbid(unsafe_code)]

use anyhow::Result;
use preupgrade_domain::{ErrorEntry, Execution, ExecutionResult, Message, ReportEntry, RunId};

/// Durable, append-only record of runs and what they produced.
pub trait ExecutionStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Trade durability for speed for the rest of this connection.
    #[allow(clippy::missing_errors_doc)]
    fn disable_sync(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn record_execution(&self, execution: &Execution) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_execution(&self, run_id: RunId) -> Result<Option<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_executions(&self) -> Result<Vec<Execution>>;

    #[allow(clippy::missing_errors_doc)]
    fn store_actor_config(&self, run_id: RunId, config: &serde_json::Value) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_actor_config(&self, run_id: RunId) -> Result<Option<serde_json::Value>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_messages(&self, run_id: RunId, messages: &[Message]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_messages(&self, run_id: RunId) -> Result<Vec<Message>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_report_entries(&self, run_id: RunId, entries: &[ReportEntry]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_report_entries(&self, run_id: RunId) -> Result<Vec<ReportEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_error_entries(&self, run_id: RunId, entries: &[ErrorEntry]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_error_entries(&self, run_id: RunId) -> Result<Vec<ErrorEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn record_result(&self, result: &ExecutionResult) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_result(&self, run_id: RunId) -> Result<Option<ExecutionResult>>;
}
