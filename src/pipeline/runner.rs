//! Step runners
//!
//! The executor owns ordering, timeouts, cancellation and persistence. A
//! runner only turns one prepared step into an output string. Dropping the
//! returned future must stop the work; the command runner relies on
//! `kill_on_drop` for that.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::StepError;

/// Largest stderr excerpt kept in a failure message
const STDERR_LIMIT: usize = 4096;

/// A step with variables already substituted
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: String,
    pub session: String,
    pub step_id: String,
    pub command: Option<String>,
    pub prompt: Option<String>,
    pub agent: Option<String>,
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, request: StepRequest) -> Result<String, StepError>;
}

/// Runs `command` through `sh -c` and captures stdout
///
/// Prompt steps need an agent adapter and are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandStepRunner;

impl CommandStepRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for CommandStepRunner {
    async fn run(&self, request: StepRequest) -> Result<String, StepError> {
        let Some(script) = request.command.as_deref() else {
            return Err(StepError::Unsupported(format!(
                "step '{}' needs an agent runner{}",
                request.step_id,
                request
                    .agent
                    .as_deref()
                    .map(|a| format!(" ({})", a))
                    .unwrap_or_default()
            )));
        };

        debug!(run_id = %request.run_id, step_id = %request.step_id, "running step command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("STREAMHUB_RUN_ID", &request.run_id)
            .env("STREAMHUB_SESSION", &request.session)
            .env("STREAMHUB_STEP_ID", &request.step_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(stdout.trim_end_matches(&['\n', '\r'][..]).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let mut cut = stderr.len().min(STDERR_LIMIT);
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            Err(StepError::CommandFailed {
                code: output.status.code(),
                stderr: stderr[..cut].to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: Option<&str>) -> StepRequest {
        StepRequest {
            run_id: "r1".to_string(),
            session: "s1".to_string(),
            step_id: "step".to_string(),
            command: command.map(str::to_string),
            prompt: None,
            agent: None,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_env() {
        let out = CommandStepRunner::new()
            .run(request(Some("echo \"$STREAMHUB_SESSION:$STREAMHUB_RUN_ID\"")))
            .await
            .unwrap();
        assert_eq!(out, "s1:r1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let err = CommandStepRunner::new()
            .run(request(Some("echo oops >&2; exit 3")))
            .await
            .unwrap_err();
        match err {
            StepError::CommandFailed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_prompt_step_unsupported() {
        let mut req = request(None);
        req.prompt = Some("summarize".to_string());
        req.agent = Some("reviewer".to_string());
        let err = CommandStepRunner::new().run(req).await.unwrap_err();
        assert!(matches!(err, StepError::Unsupported(_)));
    }
}
