#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use preupgrade_audit_core::ExecutionStore;
use preupgrade_domain::{
    format_rfc3339, hash_json, now_utc, parse_rfc3339, Configuration, ErrorEntry, ErrorSeverity,
    Execution, ExecutionResult, Message, ModelType, ReportEntry, ReportSeverity, RunId, RunStatus,
};
use rusqlite::{params, Connection, OptionalExtension};

const AUDIT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
  run_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  configuration_json TEXT NOT NULL,
  configuration_hash TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actor_configs (
  run_id TEXT PRIMARY KEY,
  config_json TEXT NOT NULL,
  config_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES executions(run_id)
);

CREATE TABLE IF NOT EXISTS messages (
  message_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  model TEXT NOT NULL,
  producer TEXT NOT NULL,
  phase TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES executions(run_id)
);

CREATE TABLE IF NOT EXISTS report_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  entry_key TEXT NOT NULL,
  title TEXT NOT NULL,
  summary TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('info','low','medium','high')),
  groups_json TEXT NOT NULL,
  actor TEXT NOT NULL,
  phase TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES executions(run_id)
);

CREATE TABLE IF NOT EXISTS error_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  actor TEXT NOT NULL,
  phase TEXT NOT NULL,
  message TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('warning','error','fatal')),
  details_json TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES executions(run_id)
);

CREATE TABLE IF NOT EXISTS execution_results (
  run_id TEXT PRIMARY KEY,
  status TEXT NOT NULL CHECK (status IN ('succeeded','failed')),
  error_count INTEGER NOT NULL,
  report_count INTEGER NOT NULL,
  finished_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES executions(run_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_run_seq ON messages(run_id, message_seq);
CREATE INDEX IF NOT EXISTS idx_report_entries_run ON report_entries(run_id, id);
CREATE INDEX IF NOT EXISTS idx_error_entries_run ON error_entries(run_id, id);

CREATE TRIGGER IF NOT EXISTS trg_executions_no_update
BEFORE UPDATE ON executions
BEGIN
  SELECT RAISE(FAIL, 'executions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_executions_no_delete
BEFORE DELETE ON executions
BEGIN
  SELECT RAISE(FAIL, 'executions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_actor_configs_no_update
BEFORE UPDATE ON actor_configs
BEGIN
  SELECT RAISE(FAIL, 'actor_configs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_actor_configs_no_delete
BEFORE DELETE ON actor_configs
BEGIN
  SELECT RAISE(FAIL, 'actor_configs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_messages_no_update
BEFORE UPDATE ON messages
BEGIN
  SELECT RAISE(FAIL, 'messages is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_messages_no_delete
BEFORE DELETE ON messages
BEGIN
  SELECT RAISE(FAIL, 'messages is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_report_entries_no_update
BEFORE UPDATE ON report_entries
BEGIN
  SELECT RAISE(FAIL, 'report_entries is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_report_entries_no_delete
BEFORE DELETE ON report_entries
BEGIN
  SELECT RAISE(FAIL, 'report_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_error_entries_no_update
BEFORE UPDATE ON error_entries
BEGIN
  SELECT RAISE(FAIL, 'error_entries is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_error_entries_no_delete
BEFORE DELETE ON error_entries
BEGIN
  SELECT RAISE(FAIL, 'error_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_execution_results_no_update
BEFORE UPDATE ON execution_results
BEGIN
  SELECT RAISE(FAIL, 'execution_results is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_execution_results_no_delete
BEFORE DELETE ON execution_results
BEGIN
  SELECT RAISE(FAIL, 'execution_results is append-only');
END;
";

pub struct SqliteExecutionStore {
    conn: Connection,
}

impl SqliteExecutionStore {
    /// Open or create a `SQLite` audit database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply audit schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![AUDIT_SCHEMA_VERSION, now],
            )
            .context("failed to record audit migration")?;

        Ok(())
    }

    fn disable_sync(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA synchronous = OFF;")
            .context("failed to disable sqlite sync")?;
        Ok(())
    }

    fn record_execution(&self, execution: &Execution) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO executions(
                    run_id, kind, configuration_json, configuration_hash, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution.run_id.to_string(),
                    execution.kind,
                    serde_json::to_string(&execution.configuration)?,
                    execution.configuration_hash,
                    format_rfc3339(execution.created_at)?,
                ],
            )
            .context("failed to insert execution")?;
        Ok(())
    }

    fn get_execution(&self, run_id: RunId) -> Result<Option<Execution>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, kind, configuration_json, configuration_hash, created_at
             FROM executions
             WHERE run_id = ?1",
        )?;
        stmt.query_row(params![run_id.to_string()], read_execution_row)
            .optional()?
            .map(execution_from_row)
            .transpose()
    }

    fn list_executions(&self) -> Result<Vec<Execution>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, kind, configuration_json, configuration_hash, created_at
             FROM executions
             ORDER BY created_at ASC, run_id ASC",
        )?;
        let rows = stmt.query_map([], read_execution_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(execution_from_row(row?)?);
        }
        Ok(out)
    }

    fn store_actor_config(&self, run_id: RunId, config: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO actor_configs(run_id, config_json, config_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id.to_string(),
                    serde_json::to_string(config)?,
                    hash_json(config)?,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to store actor configuration")?;
        Ok(())
    }

    fn get_actor_config(&self, run_id: RunId) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM actor_configs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| serde_json::from_str(&value).context("invalid config_json"))
            .transpose()
    }

    fn append_messages(&self, run_id: RunId, messages: &[Message]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for message in messages {
            tx.execute(
                "INSERT INTO messages(run_id, model, producer, phase, payload_json, payload_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    message.model.as_str(),
                    message.producer,
                    message.phase,
                    serde_json::to_string(&message.payload)?,
                    hash_json(&message.payload)?,
                ],
            )
            .context("failed to append message")?;
        }
        tx.commit().context("failed to commit messages")?;
        Ok(())
    }

    fn list_messages(&self, run_id: RunId) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT model, producer, phase, payload_json
             FROM messages
             WHERE run_id = ?1
             ORDER BY message_seq ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let model: String = row.get(0)?;
            let payload_json: String = row.get(3)?;
            out.push(Message {
                model: ModelType::new(&model),
                payload: serde_json::from_str(&payload_json).context("invalid payload_json")?,
                producer: row.get(1)?,
                phase: row.get(2)?,
            });
        }
        Ok(out)
    }

    fn append_report_entries(&self, run_id: RunId, entries: &[ReportEntry]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO report_entries(
                    run_id, entry_key, title, summary, severity, groups_json, actor, phase, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id.to_string(),
                    entry.key,
                    entry.title,
                    entry.summary,
                    entry.severity.as_str(),
                    serde_json::to_string(&entry.groups)?,
                    entry.actor,
                    entry.phase,
                    format_rfc3339(entry.created_at)?,
                ],
            )
            .context("failed to append report entry")?;
        }
        tx.commit().context("failed to commit report entries")?;
        Ok(())
    }

    fn list_report_entries(&self, run_id: RunId) -> Result<Vec<ReportEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_key, title, summary, severity, groups_json, actor, phase, created_at
             FROM report_entries
             WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let severity: String = row.get(3)?;
            let groups_json: String = row.get(4)?;
            let created_at: String = row.get(7)?;
            out.push(ReportEntry {
                key: row.get(0)?,
                title: row.get(1)?,
                summary: row.get(2)?,
                severity: ReportSeverity::parse(&severity)
                    .ok_or_else(|| anyhow!("invalid report severity: {severity}"))?,
                groups: serde_json::from_str(&groups_json).context("invalid groups_json")?,
                actor: row.get(5)?,
                phase: row.get(6)?,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(out)
    }

    fn append_error_entries(&self, run_id: RunId, entries: &[ErrorEntry]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO error_entries(
                    run_id, actor, phase, message, severity, details_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    entry.actor,
                    entry.phase,
                    entry.message,
                    entry.severity.as_str(),
                    entry
                        .details
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    format_rfc3339(entry.created_at)?,
                ],
            )
            .context("failed to append error entry")?;
        }
        tx.commit().context("failed to commit error entries")?;
        Ok(())
    }

    fn list_error_entries(&self, run_id: RunId) -> Result<Vec<ErrorEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT actor, phase, message, severity, details_json, created_at
             FROM error_entries
             WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let severity: String = row.get(3)?;
            let details_json: Option<String> = row.get(4)?;
            let created_at: String = row.get(5)?;
            out.push(ErrorEntry {
                actor: row.get(0)?,
                phase: row.get(1)?,
                message: row.get(2)?,
                severity: ErrorSeverity::parse(&severity)
                    .ok_or_else(|| anyhow!("invalid error severity: {severity}"))?,
                details: details_json
                    .map(|value| serde_json::from_str(&value).context("invalid details_json"))
                    .transpose()?,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(out)
    }

    fn record_result(&self, result: &ExecutionResult) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO execution_results(
                    run_id, status, error_count, report_count, finished_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    result.run_id.to_string(),
                    result.status.as_str(),
                    i64::try_from(result.error_count)
                        .map_err(|_| anyhow!("error_count too large for sqlite"))?,
                    i64::try_from(result.report_count)
                        .map_err(|_| anyhow!("report_count too large for sqlite"))?,
                    format_rfc3339(result.finished_at)?,
                ],
            )
            .context("failed to record execution result")?;
        Ok(())
    }

    fn get_result(&self, run_id: RunId) -> Result<Option<ExecutionResult>> {
        let raw = self
            .conn
            .query_row(
                "SELECT run_id, status, error_count, report_count, finished_at
                 FROM execution_results
                 WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(
            |(run_id_raw, status, error_count, report_count, finished_at)| {
                Ok(ExecutionResult {
                    run_id: RunId::from_str(&run_id_raw)?,
                    status: RunStatus::parse(&status)
                        .ok_or_else(|| anyhow!("invalid run status: {status}"))?,
                    error_count: usize::try_from(error_count)
                        .map_err(|_| anyhow!("invalid error_count: {error_count}"))?,
                    report_count: usize::try_from(report_count)
                        .map_err(|_| anyhow!("invalid report_count: {report_count}"))?,
                    finished_at: parse_rfc3339(&finished_at)?,
                })
            },
        )
        .transpose()
    }
}

type ExecutionRow = (String, String, String, String, String);

fn read_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn execution_from_row(
    (run_id_raw, kind, configuration_json, configuration_hash, created_at): ExecutionRow,
) -> Result<Execution> {
    let configuration: Configuration =
        serde_json::from_str(&configuration_json).context("invalid configuration_json")?;
    Ok(Execution {
        run_id: RunId::from_str(&run_id_raw)?,
        kind,
        configuration,
        configuration_hash,
        created_at: parse_rfc3339(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::SqliteExecutionStore;
    use preupgrade_audit_core::ExecutionStore;
    use preupgrade_domain::{
        now_utc, ActorError, Configuration, ErrorSeverity, Execution, ExecutionResult, Message,
        ModelType, OptionValue, Report, ReportEntry, ReportSeverity, RunId, RunStatus,
    };
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "preupgrade-audit-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn fixture_store(name: &str) -> SqliteExecutionStore {
        let store = SqliteExecutionStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_execution(run_id: RunId) -> Execution {
        let mut options = BTreeMap::new();
        options.insert("debug".to_string(), OptionValue::Flag(true));
        options.insert("target".to_string(), OptionValue::Text("9.4".to_string()));
        options.insert("iso".to_string(), OptionValue::Unset);
        let configuration = Configuration::from_parts(options, BTreeMap::new());
        Execution::new(run_id, "preupgrade", configuration).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store("migrate");
        assert!(store.migrate().is_ok());
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(count, 1);
    }

    #[test]
    fn execution_round_trips_and_is_append_only() {
        let store = fixture_store("execution");
        let run_id = RunId::new();
        let execution = fixture_execution(run_id);
        assert!(store.record_execution(&execution).is_ok());
        assert!(store.record_execution(&execution).is_err());

        let loaded = store.get_execution(run_id);
        assert!(loaded.is_ok());
        let loaded = loaded.unwrap_or_else(|_| unreachable!());
        assert!(loaded.is_some());
        let loaded = loaded.unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.kind, "preupgrade");
        assert_eq!(loaded.configuration, execution.configuration);
        assert_eq!(loaded.configuration_hash, execution.configuration_hash);
        assert_eq!(
            store.list_executions().map(|rows| rows.len()).ok(),
            Some(1)
        );

        let mutated = store.conn.execute(
            "UPDATE executions SET kind = 'upgrade' WHERE run_id = ?1",
            [run_id.to_string()],
        );
        assert!(mutated.is_err());
        let deleted = store
            .conn
            .execute("DELETE FROM executions WHERE run_id = ?1", [run_id.to_string()]);
        assert!(deleted.is_err());
    }

    #[test]
    fn entries_messages_and_results_persist_in_order() {
        let store = fixture_store("entries");
        let run_id = RunId::new();
        assert!(store.record_execution(&fixture_execution(run_id)).is_ok());
        assert!(store
            .store_actor_config(run_id, &json!({"rhui": {"enabled": true}}))
            .is_ok());

        let mut first = Message::new(ModelType::new("InstalledKernel"), json!({"version": "5.14"}));
        first.producer = "scan_kernel".to_string();
        first.phase = "FactsPhase".to_string();
        let second = Message::new(ModelType::new("RpmPackage"), json!({"name": "bash"}));
        assert!(store.append_messages(run_id, &[first.clone(), second]).is_ok());

        let report = ReportEntry::from_report(
            Report::new("Old kernel", "Upgrade it", ReportSeverity::High).with_groups(&["inhibitor"]),
            "check_kernel",
            "ChecksPhase",
        );
        assert!(store.append_report_entries(run_id, &[report.clone()]).is_ok());

        let error = ActorError::new("rpm database unreadable")
            .with_severity(ErrorSeverity::Fatal)
            .with_details(json!({"path": "/var/lib/rpm"}))
            .into_entry("scan_rpms", "FactsPhase");
        assert!(store.append_error_entries(run_id, &[error.clone()]).is_ok());

        assert!(store
            .record_result(&ExecutionResult {
                run_id,
                status: RunStatus::Failed,
                error_count: 1,
                report_count: 1,
                finished_at: now_utc(),
            })
            .is_ok());

        let messages = store.list_messages(run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], first);

        let reports = store
            .list_report_entries(run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, report.key);
        assert_eq!(reports[0].groups, vec!["inhibitor".to_string()]);

        let errors = store
            .list_error_entries(run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(errors[0].severity, ErrorSeverity::Fatal);
        assert_eq!(errors[0].details, error.details);

        let config = store.get_actor_config(run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(config, Some(json!({"rhui": {"enabled": true}})));

        let result = store.get_result(run_id).unwrap_or_else(|_| unreachable!());
        assert_eq!(result.map(|result| result.status), Some(RunStatus::Failed));

        let mutated = store
            .conn
            .execute("UPDATE messages SET producer = 'x'", []);
        assert!(mutated.is_err());
    }

    #[test]
    fn entries_require_a_recorded_execution() {
        let store = fixture_store("orphan");
        let orphan = Message::new(ModelType::new("X"), json!({}));
        assert!(store.append_messages(RunId::new(), &[orphan]).is_err());
    }

    #[test]
    fn disable_sync_applies() {
        let store = fixture_store("sync");
        assert!(store.disable_sync().is_ok());
        let sync: i64 = store
            .conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(sync, 0);
    }
}
