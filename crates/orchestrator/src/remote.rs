//! Remote command execution on provider hosts. Provisioning shells out to
//! the system `ssh` binary; the trait seam exists so tests can run against
//! a recorded fake instead of a live host.

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("remote command exited with {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
}

#[derive(Clone, Debug)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, host: &str, command: &str) -> Result<RemoteOutput, RemoteError>;
}

/// Executes over the system `ssh` client with batch-mode flags, relying on
/// the ambient key agent or identity file for credentials.
pub struct OpenSsh {
    user: String,
    connect_timeout_secs: u64,
}

impl OpenSsh {
    pub fn new(user: String) -> Self {
        Self {
            user,
            connect_timeout_secs: 10,
        }
    }
}

#[async_trait]
impl RemoteExec for OpenSsh {
    async fn run(&self, host: &str, command: &str) -> Result<RemoteOutput, RemoteError> {
        let output = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(if host.contains('@') {
                host.to_string()
            } else {
                format!("{}@{}", self.user, host)
            })
            .arg(command)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(RemoteOutput { stdout, stderr })
    }
}
