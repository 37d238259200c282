use crate::agent::{Agent, AgentRequest, AgentResponse};
use crate::errors::AgentError;
use crate::stream::StreamAccumulator;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Runs an external agent process per invocation.
///
/// The prompt goes to stdin; stdout is read as stream-json. Cost and duration
/// come from the final `result` event.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    log_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(command: &str, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir,
            log_dir: None,
        }
    }

    /// Keep each prompt and output under `dir`.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    fn log_file(&self, request: &AgentRequest, suffix: &str) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| {
            dir.join(format!(
                "phase-{}-cycle-{}-{}-{}",
                request.phase_id, request.cycle, request.role, suffix
            ))
        })
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let prompt = request.to_prompt();
        if let Some(path) = self.log_file(&request, "prompt.md") {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&path, &prompt)?;
        }

        let start = Instant::now();
        tracing::debug!(
            phase = %request.phase_id,
            role = %request.role,
            command = %self.command_line(),
            "spawning agent"
        );

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn {
                command: self.command.clone(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut acc = StreamAccumulator::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                acc.push_line(&line);
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if let Some(path) = self.log_file(&request, "output.log") {
            std::fs::write(&path, acc.transcript())?;
        }

        let Some(result) = acc.result().cloned() else {
            if !status.success() {
                return Err(AgentError::Exit {
                    code: status.code(),
                    stderr: stderr.trim().to_string(),
                });
            }
            return Err(AgentError::NoResult);
        };
        if result.is_error {
            return Err(AgentError::Reported(acc.output()));
        }

        let duration_ms = if result.duration_ms > 0 {
            result.duration_ms
        } else {
            start.elapsed().as_millis() as u64
        };
        let mut response = AgentResponse::from_output(acc.transcript(), result.cost_usd, duration_ms);
        response.output = acc.output();

        tracing::debug!(
            phase = %request.phase_id,
            role = %request.role,
            cost_usd = response.cost_usd,
            duration_ms,
            tool_uses = acc.tool_uses(),
            "agent finished"
        );
        Ok(response)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::AgentRole;
    use tempfile::tempdir;

    fn request(role: AgentRole) -> AgentRequest {
        AgentRequest {
            phase_id: "auth".into(),
            title: "Auth".into(),
            role,
            cycle: 1,
            body: "do it".into(),
            feedback: None,
            guidance: Vec::new(),
            diff: None,
        }
    }

    fn shell(script: &str, dir: PathBuf) -> CommandAgent {
        CommandAgent::new("sh", vec!["-c".into(), script.into()], dir)
    }

    #[tokio::test]
    async fn test_reads_cost_and_verdict_from_stream() {
        let dir = tempdir().unwrap();
        let script = r#"cat > /dev/null
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"<issue>typo</issue>"}]}}'
echo '{"type":"result","subtype":"success","result":"<verdict>revise</verdict>","total_cost_usd":0.25,"duration_ms":42}'"#;
        let agent = shell(script, dir.path().to_path_buf()).with_log_dir(dir.path().to_path_buf());

        let response = agent.invoke(request(AgentRole::Reviewer)).await.unwrap();
        assert!((response.cost_usd - 0.25).abs() < 1e-9);
        assert_eq!(response.duration_ms, 42);
        assert_eq!(response.approved, Some(false));
        assert_eq!(response.issue_count, Some(1));
        assert_eq!(response.output, "<verdict>revise</verdict>");
        assert!(dir.path().join("phase-auth-cycle-1-reviewer-prompt.md").exists());
    }

    #[tokio::test]
    async fn test_failed_process_without_result() {
        let dir = tempdir().unwrap();
        let agent = shell("cat > /dev/null; echo boom >&2; exit 3", dir.path().to_path_buf());
        let err = agent.invoke(request(AgentRole::Coder)).await.unwrap_err();
        assert_eq!(
            err,
            AgentError::Exit {
                code: Some(3),
                stderr: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_reported_error() {
        let dir = tempdir().unwrap();
        let script = r#"cat > /dev/null
echo '{"type":"result","subtype":"error","result":"rate limited","is_error":true}'"#;
        let err = shell(script, dir.path().to_path_buf())
            .invoke(request(AgentRole::Coder))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Reported("rate limited".into()));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let dir = tempdir().unwrap();
        let agent = CommandAgent::new("definitely-not-a-real-agent", vec![], dir.path().into());
        let err = agent.invoke(request(AgentRole::Coder)).await.unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }
}
