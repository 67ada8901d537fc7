use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use preupgrade_domain::{ActorError, ErrorSeverity, Message, ModelType, Report};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::actor::{Actor, ActorMetadata};
use crate::context::ActorContext;

pub const ACTOR_NAME_ENV: &str = "PREUPGRADE_ACTOR";
pub const PHASE_NAME_ENV: &str = "PREUPGRADE_PHASE";

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CommandOutput {
    Produce {
        model: ModelType,
        #[serde(default)]
        payload: Value,
    },
    Report(Report),
    Error {
        message: String,
        #[serde(default)]
        severity: Option<ErrorSeverity>,
        #[serde(default)]
        details: Option<Value>,
    },
}

/// Actor implemented by an external program.
///
/// Consumed messages are written to stdin as JSON lines. Each stdout line that
/// parses as `{"produce": ..}`, `{"report": ..}` or `{"error": ..}` becomes the
/// matching context call; other lines are logged. The run context environment
/// is exported to the child only.
#[derive(Debug, Clone)]
pub struct CommandActor {
    metadata: ActorMetadata,
    argv: Vec<String>,
}

impl CommandActor {
    #[must_use]
    pub fn new(metadata: ActorMetadata, argv: Vec<String>) -> Self {
        Self { metadata, argv }
    }

    fn stdin_payload(&self, ctx: &dyn ActorContext) -> Result<Vec<u8>, ActorError> {
        let mut payload = Vec::new();
        for model in &self.metadata.consumes {
            for message in ctx.consume(model) {
                serde_json::to_writer(&mut payload, message)
                    .map_err(|err| ActorError::new(format!("failed to encode message: {err}")))?;
                payload.push(b'\n');
            }
        }
        Ok(payload)
    }

    fn apply_line(ctx: &dyn ActorContext, line: &str) -> Result<(), ActorError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let Ok(output) = serde_json::from_str::<CommandOutput>(trimmed) else {
            ctx.log().info(trimmed);
            return Ok(());
        };
        match output {
            CommandOutput::Produce { model, payload } => ctx.produce(Message::new(model, payload)),
            CommandOutput::Report(report) => {
                ctx.report(report);
                Ok(())
            }
            CommandOutput::Error {
                message,
                severity,
                details,
            } => {
                ctx.report_error(&message, severity.unwrap_or(ErrorSeverity::Error), details);
                Ok(())
            }
        }
    }
}

impl Actor for CommandActor {
    fn metadata(&self) -> &ActorMetadata {
        &self.metadata
    }

    fn process(&self, ctx: &dyn ActorContext) -> Result<(), ActorError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ActorError::new(format!(
                "actor {} has no command",
                self.metadata.name
            )));
        };
        let payload = self.stdin_payload(ctx)?;

        let mut child = Command::new(program)
            .args(args)
            .envs(ctx.run_context().environment())
            .env(ACTOR_NAME_ENV, ctx.actor_name())
            .env(PHASE_NAME_ENV, ctx.phase_name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ActorError::new(format!("failed to spawn {program}: {err}")))?;

        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                // The child may exit without reading its input.
                let _ = stdin.write_all(&payload);
            })
        });
        let output = child
            .wait_with_output()
            .map_err(|err| ActorError::new(format!("failed to wait for {program}: {err}")))?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            ctx.log().debug(line);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            Self::apply_line(ctx, line)?;
        }

        if output.status.success() {
            return Ok(());
        }
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        Err(ActorError::new(format!(
            "actor {} command exited with {}",
            self.metadata.name, output.status
        ))
        .with_details(json!({ "stderr": tail, "exit_code": output.status.code() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockActorContext;
    use preupgrade_domain::{RunContext, RunId, EXECUTION_ID_ENV};

    fn sh(name: &str, script: &str) -> CommandActor {
        CommandActor::new(
            ActorMetadata::new(name)
                .consumes(&["Input"])
                .produces(&["Echo", "Env"]),
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn stdout_lines_become_context_calls() {
        let actor = sh(
            "echoer",
            r#"while read -r line; do echo "{\"produce\": {\"model\": \"Echo\", \"payload\": $line}}"; done
echo '{"report": {"title": "Done", "summary": "ok", "severity": "info"}}'
echo '{"error": {"message": "minor", "severity": "warning"}}'
echo 'plain text'"#,
        );
        let ctx = MockActorContext::new("echoer").with_messages(vec![
            Message::new(ModelType::new("Input"), json!({"n": 1})),
            Message::new(ModelType::new("Input"), json!({"n": 2})),
        ]);

        let result = actor.process(&ctx);
        assert!(result.is_ok(), "{result:?}");
        let produced = ctx.produced();
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].model, ModelType::new("Echo"));
        assert_eq!(produced[1].payload["payload"], json!({"n": 2}));
        assert_eq!(ctx.reports().len(), 1);
        assert_eq!(ctx.errors()[0].severity, ErrorSeverity::Warning);
        assert!(ctx
            .log_lines()
            .iter()
            .any(|(_, line)| line == "plain text"));
    }

    #[test]
    fn run_environment_is_exported_to_child_only() {
        let run_id = RunId::new();
        let actor = sh(
            "env_reporter",
            r#"echo "{\"produce\": {\"model\": \"Env\", \"payload\": {\"id\": \"$PREUPGRADE_EXECUTION_ID\", \"lang\": \"$LANG\", \"actor\": \"$PREUPGRADE_ACTOR\"}}}""#,
        );
        let ctx = MockActorContext::new("env_reporter").with_run_context(RunContext::new(run_id));

        assert!(actor.process(&ctx).is_ok());
        let produced = ctx.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload["id"], json!(run_id.to_string()));
        assert_eq!(produced[0].payload["lang"], json!("en_US.UTF-8"));
        assert_eq!(produced[0].payload["actor"], json!("env_reporter"));
        assert_ne!(
            std::env::var(EXECUTION_ID_ENV).ok(),
            Some(run_id.to_string())
        );
    }

    #[test]
    fn non_zero_exit_is_an_actor_error() {
        let actor = sh("failing", "echo 'disk check failed' >&2; exit 3");
        let ctx = MockActorContext::new("failing");
        match actor.process(&ctx) {
            Ok(()) => panic!("expected failure"),
            Err(err) => {
                assert_eq!(err.severity, ErrorSeverity::Error);
                assert_eq!(
                    err.details.as_ref().map(|details| details["exit_code"].clone()),
                    Some(json!(3))
                );
                assert!(err.message.contains("failing"));
            }
        }
    }
}
