use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record of one controller activity left on the host for later tooling.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Breadcrumb {
    pub activity: String,
    pub run_id: String,
    pub executed: String,
    pub success: bool,
    pub run_start: String,
    pub run_end: String,
    pub report_files: Vec<String>,
    pub answerfile: Option<String>,
}

pub trait BreadcrumbWriter {
    #[allow(clippy::missing_errors_doc)]
    fn write(&self, breadcrumb: &Breadcrumb) -> Result<()>;
}

/// Appends breadcrumbs to the `activities` list of a JSON document.
#[derive(Debug, Clone)]
pub struct JsonBreadcrumbs {
    path: PathBuf,
}

impl JsonBreadcrumbs {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn read_activities(&self) -> Result<Vec<Value>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let document: Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        match document.get("activities") {
            Some(Value::Array(activities)) => Ok(activities.clone()),
            None => Ok(Vec::new()),
            Some(_) => Err(anyhow!(
                "{}: activities must be a list",
                self.path.display()
            )),
        }
    }
}

impl BreadcrumbWriter for JsonBreadcrumbs {
    fn write(&self, breadcrumb: &Breadcrumb) -> Result<()> {
        let mut activities = self.read_activities()?;
        activities.push(serde_json::to_value(breadcrumb)?);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let document = serde_json::json!({ "activities": activities });
        let content = serde_json::to_string_pretty(&document)?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crumb(run_id: &str, success: bool) -> Breadcrumb {
        Breadcrumb {
            activity: "preupgrade".to_string(),
            run_id: run_id.to_string(),
            executed: "preupgrade --target 9.4".to_string(),
            success,
            run_start: "2026-01-01T00:00:00Z".to_string(),
            run_end: "2026-01-01T00:01:00Z".to_string(),
            report_files: vec!["/var/log/preupgrade/preupgrade-report.json".to_string()],
            answerfile: Some("/var/log/preupgrade/answerfile".to_string()),
        }
    }

    #[test]
    fn activities_accumulate_across_runs() {
        let path = std::env::temp_dir().join(format!(
            "preupgrade-breadcrumbs-{}/migration-results",
            ulid::Ulid::new()
        ));
        let writer = JsonBreadcrumbs::new(&path);
        assert!(writer.write(&crumb("first", false)).is_ok());
        assert!(writer.write(&crumb("second", true)).is_ok());

        let activities = writer.read_activities().unwrap_or_default();
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0]["run_id"], "first");
        assert_eq!(activities[1]["success"], true);
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn malformed_document_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "preupgrade-breadcrumbs-bad-{}.json",
            ulid::Ulid::new()
        ));
        assert!(fs::write(&path, r#"{"activities": 3}"#).is_ok());
        assert!(JsonBreadcrumbs::new(&path).write(&crumb("x", true)).is_err());
        let _ = fs::remove_file(&path);
    }
}
