use std::fmt::Write as _;
use std::path::PathBuf;

use preupgrade_domain::{ErrorEntry, RunId};

/// What the operator sees when a run finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub failed: bool,
    pub errors: Vec<ErrorEntry>,
    pub warnings: Vec<String>,
    pub report_files: Vec<PathBuf>,
    pub log_files: Vec<PathBuf>,
    pub answer_file: PathBuf,
}

impl RunSummary {
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            let _ = writeln!(out, "{}", banner("ERRORS"));
            for error in &self.errors {
                let _ = writeln!(
                    out,
                    "{} [{}] {}: {}",
                    error.created_at.date(),
                    error.severity.as_str(),
                    error.actor,
                    error.message
                );
            }
            let _ = writeln!(out, "{}", banner("END OF ERRORS"));
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "WARNING: {warning}");
        }

        let _ = writeln!(out, "Run {} finished.", self.run_id);
        write_paths(&mut out, "Debug output written to", &self.log_files);
        write_paths(&mut out, "Report written to", &self.report_files);
        let _ = writeln!(
            out,
            "Answerfile has been generated at {}",
            self.answer_file.display()
        );
        if self.failed {
            let _ = writeln!(
                out,
                "The run failed. See the report and the errors above for details."
            );
        } else {
            let _ = writeln!(out, "The run completed without blocking errors.");
        }
        out
    }
}

fn banner(title: &str) -> String {
    let width = 60usize.saturating_sub(title.len() + 2) / 2;
    let fill = "=".repeat(width);
    format!("{fill} {title} {fill}")
}

fn write_paths(out: &mut String, label: &str, paths: &[PathBuf]) {
    for path in paths {
        let _ = writeln!(out, "  - {label} {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preupgrade_domain::{ActorError, ErrorSeverity};

    fn summary(failed: bool, errors: Vec<ErrorEntry>) -> RunSummary {
        RunSummary {
            run_id: RunId::new(),
            failed,
            errors,
            warnings: vec!["target version 7.0 is not a supported upgrade path".to_string()],
            report_files: vec![PathBuf::from("/var/log/preupgrade/preupgrade-report.txt")],
            log_files: vec![PathBuf::from("/var/log/preupgrade/preupgrade.log")],
            answer_file: PathBuf::from("/var/log/preupgrade/answerfile"),
        }
    }

    #[test]
    fn failed_run_lists_errors_and_verdict() {
        let error = ActorError::new("disk check failed")
            .with_severity(ErrorSeverity::Fatal)
            .into_entry("disk_check", "ChecksPhase");
        let text = summary(true, vec![error]).render();
        assert!(text.contains("ERRORS"));
        assert!(text.contains("[fatal] disk_check: disk check failed"));
        assert!(text.contains("WARNING: target version 7.0"));
        assert!(text.contains("Report written to /var/log/preupgrade/preupgrade-report.txt"));
        assert!(text.contains("Answerfile has been generated at /var/log/preupgrade/answerfile"));
        assert!(text.contains("The run failed."));
    }

    #[test]
    fn clean_run_has_no_error_block() {
        let text = summary(false, Vec::new()).render();
        assert!(!text.contains("ERRORS"));
        assert!(text.contains("without blocking errors"));
    }
}
