use std::future::Future;
use std::process::Stdio;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;

/// What a task gets to see besides its own payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_uuid: Uuid,
    pub job_name: String,
    /// Data shared by every task of the job
    pub data_provider: Bytes,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task is not a valid UTF-8 command")]
    InvalidCommand,

    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("{0}")]
    Failed(String),
}

/// Runs one task payload and produces its result payload.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        context: &TaskContext,
        task: Bytes,
    ) -> impl Future<Output = Result<Bytes, TaskError>> + Send;
}

/// Executes each task as a shell command and returns its standard output.
///
/// The job's data provider, when not empty, is piped to the command's stdin.
/// With a sandbox image configured the command runs in a throwaway Docker
/// container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: SandboxConfig,
}

impl ShellExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Executor running commands directly on the host shell.
    pub fn host() -> Self {
        Self::new(SandboxConfig {
            image: None,
            ..SandboxConfig::default()
        })
    }

    fn command(&self, script: &str, with_stdin: bool) -> Command {
        let Some(image) = self.config.image.as_ref() else {
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            return command;
        };

        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if with_stdin {
            args.push("-i".to_string());
        }
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());
        args.push(image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(script.to_string());

        let mut command = Command::new("docker");
        command.args(&args);
        command
    }
}

impl TaskExecutor for ShellExecutor {
    async fn execute(&self, context: &TaskContext, task: Bytes) -> Result<Bytes, TaskError> {
        let script = std::str::from_utf8(&task).map_err(|_| TaskError::InvalidCommand)?;
        let with_stdin = !context.data_provider.is_empty();
        tracing::debug!(
            job_id = %context.job_uuid,
            command = script,
            sandboxed = self.config.image.is_some(),
            "Executing task"
        );

        let mut child = self
            .command(script, with_stdin)
            .stdin(if with_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // a command that ignores stdin may exit before reading it
            if let Err(e) = stdin.write_all(&context.data_provider).await {
                tracing::debug!(job_id = %context.job_uuid, error = %e, "Task did not read its input");
            }
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(
                job_id = %context.job_uuid,
                exit_code = ?output.status.code(),
                "Task failed"
            );
            return Err(TaskError::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }
        Ok(Bytes::from(output.stdout))
    }
}
