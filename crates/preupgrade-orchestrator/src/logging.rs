use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use preupgrade_domain::{format_rfc3339, now_utc, Configuration};
use tracing::Dispatch;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

pub const LOG_FILTER_ENV: &str = "PREUPGRADE_LOG";
pub const ARCHIVE_DIR: &str = "archive";

/// Console verbosity selected by `--debug` / `--verbose`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verbosity {
    Quiet,
    Verbose,
    Debug,
}

impl Verbosity {
    #[must_use]
    pub fn from_configuration(configuration: &Configuration) -> Self {
        if configuration.flag("debug") {
            Self::Debug
        } else if configuration.flag("verbose") {
            Self::Verbose
        } else {
            Self::Quiet
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Verbose => "info",
            Self::Debug => "debug",
        }
    }
}

/// Sink for the run log.
pub trait LogSink {
    /// Move logs left by earlier runs out of the way.
    #[allow(clippy::missing_errors_doc)]
    fn archive_previous_logs(&self) -> Result<Vec<PathBuf>>;

    #[allow(clippy::missing_errors_doc)]
    fn attach(&self, file_name: &str, verbosity: Verbosity) -> Result<RunLogger>;
}

/// Run-scoped tracing dispatch. Installed only for the duration of a run,
/// never as the global default.
#[derive(Clone)]
pub struct RunLogger {
    dispatch: Dispatch,
    path: Option<PathBuf>,
}

impl RunLogger {
    #[must_use]
    pub fn new(dispatch: Dispatch, path: Option<PathBuf>) -> Self {
        Self { dispatch, path }
    }

    /// Logger that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Dispatch::none(), None)
    }

    #[must_use]
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl std::fmt::Debug for RunLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLogger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Writes the run log under a log directory and mirrors it to stderr.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    log_dir: PathBuf,
    console: bool,
}

impl FileLogSink {
    #[must_use]
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            console: true,
        }
    }

    /// Drop the stderr layer; the log file is still written.
    #[must_use]
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    fn console_filter(verbosity: Verbosity) -> EnvFilter {
        EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(verbosity.as_str()))
    }
}

impl LogSink for FileLogSink {
    fn archive_previous_logs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.log_dir.display()))
            }
        };

        let mut logs = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to list {}", self.log_dir.display()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
                logs.push(path);
            }
        }
        logs.sort();
        if logs.is_empty() {
            return Ok(Vec::new());
        }

        let archive_dir = self.log_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("failed to create {}", archive_dir.display()))?;
        let stamp = format_rfc3339(now_utc())?.replace(':', "");
        let mut archived = Vec::with_capacity(logs.len());
        for log in logs {
            let stem = log
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let target = archive_dir.join(format!("{stem}-{stamp}.log"));
            fs::rename(&log, &target).with_context(|| {
                format!("failed to archive {} to {}", log.display(), target.display())
            })?;
            archived.push(target);
        }
        Ok(archived)
    }

    fn attach(&self, file_name: &str, verbosity: Verbosity) -> Result<RunLogger> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let path = self.log_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
            .with_filter(LevelFilter::DEBUG);
        let console_layer = self.console.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(Self::console_filter(verbosity))
        });
        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);
        Ok(RunLogger::new(Dispatch::new(subscriber), Some(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preupgrade_domain::OptionValue;
    use std::collections::BTreeMap;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("preupgrade-logging-{name}-{}", ulid::Ulid::new()))
    }

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn verbosity_follows_debug_then_verbose() {
        let mut options = BTreeMap::new();
        options.insert("verbose".to_string(), OptionValue::Flag(true));
        let verbose = Configuration::from_parts(options.clone(), BTreeMap::new());
        assert_eq!(Verbosity::from_configuration(&verbose), Verbosity::Verbose);

        options.insert("debug".to_string(), OptionValue::Flag(true));
        let debug = Configuration::from_parts(options, BTreeMap::new());
        assert_eq!(Verbosity::from_configuration(&debug), Verbosity::Debug);
        assert_eq!(
            Verbosity::from_configuration(&Configuration::default()),
            Verbosity::Quiet
        );
    }

    #[test]
    fn previous_logs_move_to_archive() {
        let dir = temp_dir("archive");
        assert!(fs::create_dir_all(&dir).is_ok());
        assert!(fs::write(dir.join("preupgrade.log"), "old run\n").is_ok());
        assert!(fs::write(dir.join("answerfile"), "kept").is_ok());

        let sink = FileLogSink::new(&dir).without_console();
        let archived = must(sink.archive_previous_logs());
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with(dir.join(ARCHIVE_DIR)));
        assert_eq!(fs::read_to_string(&archived[0]).ok().as_deref(), Some("old run\n"));
        assert!(!dir.join("preupgrade.log").exists());
        assert!(dir.join("answerfile").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_log_dir_has_nothing_to_archive() {
        let sink = FileLogSink::new(&temp_dir("missing")).without_console();
        assert!(must(sink.archive_previous_logs()).is_empty());
    }

    #[test]
    fn attached_logger_writes_debug_events_to_file() {
        let dir = temp_dir("attach");
        let sink = FileLogSink::new(&dir).without_console();
        let logger = must(sink.attach("preupgrade.log", Verbosity::Quiet));
        logger.scope(|| {
            tracing::debug!(actor = "scanner", "actor started");
            tracing::trace!("not recorded");
        });

        let path = logger.path().map(Path::to_path_buf).unwrap_or_default();
        let content = fs::read_to_string(&path).unwrap_or_default();
        assert!(content.contains("actor started"));
        assert!(content.contains("scanner"));
        assert!(!content.contains("not recorded"));
        let _ = fs::remove_dir_all(&dir);
    }
}
