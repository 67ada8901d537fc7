use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use preupgrade_audit_core::ExecutionStore;
use preupgrade_audit_sqlite::SqliteExecutionStore;
use preupgrade_config::{
    available_features_help, ControllerSettings, OptionLayer, CHANNELS, REPORT_SCHEMA_VERSIONS,
    SETTINGS_ENV,
};
use preupgrade_domain::{CommandError, OptionValue};
use preupgrade_orchestrator::{
    FileLogSink, FileReportRenderer, HostGuard, JsonBreadcrumbs, Preupgrade, PreupgradeRequest,
    ProcessHostGuard,
};
use preupgrade_workflow::{YamlAnswerFile, YamlRepositoryLoader};

const FATAL_EXIT_CODE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "preupgrade")]
#[command(about = "Generate preupgrade report")]
struct Cli {
    /// Enables experimental actors
    #[arg(long, value_name = "ActorName")]
    whitelist_experimental: Vec<String>,
    #[arg(long, value_name = "Feature", help = experimental_feature_help())]
    enable_experimental_feature: Vec<String>,
    /// Enable debug mode
    #[arg(long)]
    debug: bool,
    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
    /// Use only custom repositories and skip actions with Red Hat Subscription Manager
    #[arg(long)]
    no_rhsm: bool,
    /// Do not register into Red Hat Insights
    #[arg(long)]
    no_insights_register: bool,
    /// Do not store migration information using Red Hat Subscription Manager. Implied by --no-rhsm.
    #[arg(long)]
    no_rhsm_facts: bool,
    /// Enable specified repository. Can be used multiple times.
    #[arg(long, value_name = "repoid")]
    enablerepo: Vec<String>,
    #[arg(long, help = format!("Set preferred channel for the upgrade target [{}]", CHANNELS.join(", ")))]
    channel: Option<String>,
    /// Use provided target installation image to perform the upgrade
    #[arg(long)]
    iso: Option<String>,
    /// Specify version to upgrade to
    #[arg(long)]
    target: Option<String>,
    #[arg(long, help = format!("Specify report schema version [{}]", REPORT_SCHEMA_VERSIONS.join(", ")))]
    report_schema: Option<String>,
    /// Disable RPM GPG checks
    #[arg(long)]
    nogpgcheck: bool,
    /// Controller settings file
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,
}

impl Cli {
    /// Options the operator actually gave; absent ones fall through to lower layers.
    fn option_layer(&self) -> OptionLayer {
        let mut layer = OptionLayer::new();
        let lists = [
            ("whitelist_experimental", &self.whitelist_experimental),
            ("enable_experimental_feature", &self.enable_experimental_feature),
            ("enablerepo", &self.enablerepo),
        ];
        for (name, values) in lists {
            if !values.is_empty() {
                layer.insert(name.to_string(), OptionValue::List(values.clone()));
            }
        }
        let flags = [
            ("debug", self.debug),
            ("verbose", self.verbose),
            ("no_rhsm", self.no_rhsm),
            ("no_insights_register", self.no_insights_register),
            ("no_rhsm_facts", self.no_rhsm_facts),
            ("nogpgcheck", self.nogpgcheck),
        ];
        for (name, set) in flags {
            if set {
                layer.insert(name.to_string(), OptionValue::Flag(true));
            }
        }
        let texts = [
            ("channel", &self.channel),
            ("iso", &self.iso),
            ("target", &self.target),
            ("report_schema", &self.report_schema),
        ];
        for (name, value) in texts {
            if let Some(value) = value {
                layer.insert(name.to_string(), OptionValue::Text(value.clone()));
            }
        }
        layer
    }
}

fn experimental_feature_help() -> String {
    format!(
        "Enable experimental feature. Available experimental features: {}",
        available_features_help()
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("==> ERROR: {err}");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

fn run(cli: &Cli) -> Result<u8, CommandError> {
    let host = ProcessHostGuard;
    // Nothing may touch the host before the privilege check.
    host.require_full_privilege()?;

    let settings_path = ControllerSettings::resolve_path(
        cli.settings.as_deref(),
        std::env::var(SETTINGS_ENV).ok().as_deref(),
    );
    let settings = ControllerSettings::load(&settings_path)
        .map_err(|err| CommandError::Configuration(err.to_string()))?;

    let store = SqliteExecutionStore::open(&settings.audit_db)
        .and_then(|store| store.migrate().map(|()| store))
        .map_err(|err| CommandError::Persistence(format!("{err:#}")))?;

    let loader = YamlRepositoryLoader::new(&settings.repository);
    let log_sink = FileLogSink::new(&settings.log_dir);
    let renderer = FileReportRenderer::new(&settings.report_dir);
    let breadcrumbs = JsonBreadcrumbs::new(&settings.breadcrumbs);
    let orchestrator = Preupgrade::new(
        &host,
        &loader,
        &store,
        &log_sink,
        &YamlAnswerFile,
        &renderer,
        &breadcrumbs,
    );

    let request = PreupgradeRequest {
        cli: cli.option_layer(),
        settings,
        environment: std::env::vars().collect(),
        executed: std::env::args().collect(),
        run_id: None,
    };
    let outcome = orchestrator.run(&request)?;
    print!("{}", outcome.summary.render());
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_options_are_left_out_of_the_layer() {
        let cli = Cli::parse_from(["preupgrade", "--no-rhsm", "--enablerepo", "a", "--enablerepo", "b"]);
        let layer = cli.option_layer();
        assert_eq!(layer.get("no_rhsm"), Some(&OptionValue::Flag(true)));
        assert_eq!(
            layer.get("enablerepo"),
            Some(&OptionValue::List(vec!["a".to_string(), "b".to_string()]))
        );
        assert!(layer.get("no_rhsm_facts").is_none());
        assert!(layer.get("report_schema").is_none());
        assert_eq!(layer.len(), 2);
    }

    #[test]
    fn text_options_keep_operator_spelling() {
        let cli = Cli::parse_from([
            "preupgrade",
            "--channel",
            "EUS",
            "--target",
            "9.4",
            "--report-schema",
            "1.1.0",
            "--whitelist-experimental",
            "kernel_preview",
        ]);
        let layer = cli.option_layer();
        assert_eq!(layer.get("channel"), Some(&OptionValue::Text("EUS".to_string())));
        assert_eq!(layer.get("target"), Some(&OptionValue::Text("9.4".to_string())));
        assert_eq!(
            layer.get("whitelist_experimental"),
            Some(&OptionValue::List(vec!["kernel_preview".to_string()]))
        );
    }
}
