use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use preupgrade_config::{REPORT_JSON_FILE, REPORT_SCHEMA_VERSIONS, REPORT_TEXT_FILE};
use preupgrade_domain::{
    format_rfc3339, hash_bytes, ErrorEntry, ReportEntry, ReportSeverity, RunId,
};
use serde_json::{json, Map, Value};

pub const INHIBITOR_GROUP: &str = "inhibitor";
pub const FAILURE_GROUP: &str = "failure";
pub const ERROR_GROUP: &str = "error";

const FLAG_GROUPS: [&str; 2] = [INHIBITOR_GROUP, FAILURE_GROUP];
const TEXT_SEPARATOR: &str = "----------------------------------------";

/// Turns the report and error entries of a run into report files.
pub trait ReportRenderer {
    /// Returns the paths of the written report files.
    #[allow(clippy::missing_errors_doc)]
    fn render(
        &self,
        run_id: RunId,
        schema: &str,
        reports: &[ReportEntry],
        errors: &[ErrorEntry],
    ) -> Result<Vec<PathBuf>>;
}

/// Writes `preupgrade-report.json` and `preupgrade-report.txt` into a directory.
#[derive(Debug, Clone)]
pub struct FileReportRenderer {
    report_dir: PathBuf,
}

impl FileReportRenderer {
    #[must_use]
    pub fn new(report_dir: &Path) -> Self {
        Self {
            report_dir: report_dir.to_path_buf(),
        }
    }
}

impl ReportRenderer for FileReportRenderer {
    fn render(
        &self,
        run_id: RunId,
        schema: &str,
        reports: &[ReportEntry],
        errors: &[ErrorEntry],
    ) -> Result<Vec<PathBuf>> {
        let entries = collect_entries(reports.to_vec(), errors);
        let document = render_json(run_id, schema, &entries)?;

        fs::create_dir_all(&self.report_dir)
            .with_context(|| format!("failed to create {}", self.report_dir.display()))?;
        let json_path = self.report_dir.join(REPORT_JSON_FILE);
        let text_path = self.report_dir.join(REPORT_TEXT_FILE);
        fs::write(&json_path, serde_json::to_string_pretty(&document)?)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        fs::write(&text_path, render_text(&entries))
            .with_context(|| format!("failed to write {}", text_path.display()))?;
        tracing::info!(
            report = %json_path.display(),
            entries = entries.len(),
            schema,
            "report files written"
        );
        Ok(vec![json_path, text_path])
    }
}

/// Report entries plus one entry per actor error, inhibitors first, then by
/// descending severity. Ties keep recording order.
#[must_use]
pub fn collect_entries(reports: Vec<ReportEntry>, errors: &[ErrorEntry]) -> Vec<ReportEntry> {
    let mut entries = reports;
    entries.extend(errors.iter().map(error_entry));
    entries.sort_by_key(|entry| (!is_blocking(entry), std::cmp::Reverse(entry.severity)));
    entries
}

fn error_entry(error: &ErrorEntry) -> ReportEntry {
    let mut groups = vec![ERROR_GROUP.to_string()];
    if error.severity.is_failing() {
        groups.push(FAILURE_GROUP.to_string());
    }
    let summary = match &error.details {
        Some(details) => format!("{}\n\nDetails: {details}", error.message),
        None => error.message.clone(),
    };
    ReportEntry {
        key: hash_bytes(format!("error:{}:{}", error.actor, error.message).as_bytes()),
        title: error.message.clone(),
        summary,
        severity: ReportSeverity::High,
        groups,
        actor: error.actor.clone(),
        phase: error.phase.clone(),
        created_at: error.created_at,
    }
}

fn is_blocking(entry: &ReportEntry) -> bool {
    entry
        .groups
        .iter()
        .any(|group| FLAG_GROUPS.contains(&group.as_str()))
}

/// Build the JSON report document for a schema version.
///
/// Versions before 1.2.0 split groups into `tags` and `flags`; `key` exists
/// from 1.1.0 on.
///
/// # Errors
/// Returns an error for unknown schema versions or unformattable timestamps.
pub fn render_json(run_id: RunId, schema: &str, entries: &[ReportEntry]) -> Result<Value> {
    if !REPORT_SCHEMA_VERSIONS.contains(&schema) {
        return Err(anyhow!("unsupported report schema version {schema}"));
    }
    let with_key = schema != "1.0.0";
    let with_groups = schema == "1.2.0";

    let mut rendered = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut object = Map::new();
        object.insert(
            "id".to_string(),
            json!(hash_bytes(format!("{run_id}:{}", entry.key).as_bytes())),
        );
        object.insert("title".to_string(), json!(entry.title));
        object.insert("summary".to_string(), json!(entry.summary));
        object.insert("severity".to_string(), json!(entry.severity.as_str()));
        object.insert("actor".to_string(), json!(entry.actor));
        object.insert("phase".to_string(), json!(entry.phase));
        object.insert(
            "timeStamp".to_string(),
            json!(format_rfc3339(entry.created_at)?),
        );
        if with_key {
            object.insert("key".to_string(), json!(entry.key));
        }
        if with_groups {
            object.insert("groups".to_string(), json!(entry.groups));
        } else {
            let (flags, tags): (Vec<&String>, Vec<&String>) = entry
                .groups
                .iter()
                .partition(|group| FLAG_GROUPS.contains(&group.as_str()));
            object.insert("flags".to_string(), json!(flags));
            object.insert("tags".to_string(), json!(tags));
        }
        rendered.push(Value::Object(object));
    }

    Ok(json!({
        "run_id": run_id.to_string(),
        "schema_version": schema,
        "entries": rendered,
    }))
}

#[must_use]
pub fn render_text(entries: &[ReportEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let blocking: Vec<&str> = entry
            .groups
            .iter()
            .map(String::as_str)
            .filter(|group| FLAG_GROUPS.contains(group))
            .collect();
        if blocking.is_empty() {
            let _ = writeln!(out, "Risk Factor: {}", entry.severity.as_str());
        } else {
            let _ = writeln!(
                out,
                "Risk Factor: {} ({})",
                entry.severity.as_str(),
                blocking.join(", ")
            );
        }
        let _ = writeln!(out, "Title: {}", entry.title);
        let _ = writeln!(out, "Summary: {}", entry.summary);
        let _ = writeln!(out, "Key: {}", entry.key);
        let _ = writeln!(out, "{TEXT_SEPARATOR}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use preupgrade_domain::{ErrorSeverity, Report};

    fn entries() -> Vec<ReportEntry> {
        let reports = vec![
            ReportEntry::from_report(
                Report::new("Old kernel", "kernel is old", ReportSeverity::Low),
                "kernel_check",
                "ChecksPhase",
            ),
            ReportEntry::from_report(
                Report::new("Unsupported driver", "driver xyz", ReportSeverity::High)
                    .with_groups(&["inhibitor", "drivers"]),
                "driver_check",
                "ChecksPhase",
            ),
        ];
        let error = preupgrade_domain::ActorError::new("scan crashed")
            .with_severity(ErrorSeverity::Error)
            .into_entry("pkg_scan", "FactsPhase");
        collect_entries(reports, &[error])
    }

    #[test]
    fn blocking_entries_sort_first() {
        let entries = entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].title, "Unsupported driver");
        assert_eq!(entries[1].title, "scan crashed");
        assert_eq!(entries[1].groups, vec!["error", "failure"]);
        assert_eq!(entries[2].title, "Old kernel");
    }

    #[test]
    fn schema_versions_shape_entries() {
        let run_id = RunId::new();
        let entries = entries();

        let v120 = render_json(run_id, "1.2.0", &entries).unwrap_or_else(|_| unreachable!());
        assert_eq!(v120["entries"][0]["groups"], json!(["inhibitor", "drivers"]));
        assert!(v120["entries"][0].get("flags").is_none());
        assert!(v120["entries"][0].get("key").is_some());

        let v110 = render_json(run_id, "1.1.0", &entries).unwrap_or_else(|_| unreachable!());
        assert_eq!(v110["entries"][0]["flags"], json!(["inhibitor"]));
        assert_eq!(v110["entries"][0]["tags"], json!(["drivers"]));
        assert!(v110["entries"][0].get("key").is_some());

        let v100 = render_json(run_id, "1.0.0", &entries).unwrap_or_else(|_| unreachable!());
        assert!(v100["entries"][0].get("key").is_none());
        assert!(v100["entries"][0].get("groups").is_none());

        assert!(render_json(run_id, "2.0.0", &entries).is_err());
    }

    #[test]
    fn renderer_writes_both_report_files() {
        let dir = std::env::temp_dir().join(format!("preupgrade-report-{}", RunId::new()));
        let report = ReportEntry::from_report(
            Report::new("Old kernel", "kernel is old", ReportSeverity::Low),
            "kernel_check",
            "ChecksPhase",
        );
        let written = FileReportRenderer::new(&dir)
            .render(RunId::new(), "1.2.0", &[report], &[])
            .unwrap_or_else(|err| panic!("render failed: {err:#}"));

        assert_eq!(written, vec![dir.join(REPORT_JSON_FILE), dir.join(REPORT_TEXT_FILE)]);
        let text = fs::read_to_string(&written[1]).unwrap_or_default();
        assert!(text.contains("Title: Old kernel"));
        assert!(FileReportRenderer::new(&dir)
            .render(RunId::new(), "0.9.0", &[], &[])
            .is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn text_report_marks_blocking_entries() {
        let text = render_text(&entries());
        assert!(text.starts_with("Risk Factor: high (inhibitor)\nTitle: Unsupported driver\n"));
        assert!(text.contains("Risk Factor: high (failure)\nTitle: scan crashed"));
        assert!(text.contains("Risk Factor: low\nTitle: Old kernel"));
        assert_eq!(text.matches(TEXT_SEPARATOR).count(), 3);
    }
}
