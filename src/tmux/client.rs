use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{Keys, ScreenAccessor, TmuxError, TmuxSession};

/// Default upper bound for a single tmux invocation
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Hard limit per command so a wedged server cannot stall a caller
    command_timeout: Duration,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.tmux_path = path.into();
        self
    }

    /// Check if tmux server is running
    pub async fn is_server_running(&self) -> bool {
        let mut cmd = Command::new(&self.tmux_path);
        cmd.arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        matches!(
            tokio::time::timeout(self.command_timeout, cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<Output, TmuxError> {
        let mut cmd = Command::new(&self.tmux_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                debug!(op, "tmux command timed out");
                Err(TmuxError::Timeout {
                    op,
                    secs: self.command_timeout.as_secs(),
                })
            }
        }
    }

    /// Turns a failed invocation into NotFound when tmux says the target is gone
    fn failure(op: &'static str, session: &str, output: &Output) -> TmuxError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("can't find session")
            || stderr.contains("session not found")
            || stderr.contains("no server running")
        {
            TmuxError::NotFound(session.to_string())
        } else {
            TmuxError::Command { op, stderr }
        }
    }

    fn parse_session_line(line: &str) -> Option<TmuxSession> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            return None;
        }

        Some(TmuxSession {
            id: parts[0].to_string(),
            name: parts[1].to_string(),
            created_at: parts[2].parse().unwrap_or(0),
            attached_clients: parts[3].parse().unwrap_or(0),
        })
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix
fn exact_target(session: &str) -> String {
    format!("={}", session)
}

#[async_trait]
impl ScreenAccessor for TmuxClient {
    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError> {
        // Format: session_id|session_name|session_created|session_attached
        let output = self
            .run(
                "list-sessions",
                &[
                    "list-sessions",
                    "-F",
                    "#{session_id}|#{session_name}|#{session_created}|#{session_attached}",
                ],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(TmuxError::Command {
                op: "list-sessions",
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(Self::parse_session_line).collect())
    }

    async fn exists(&self, session: &str) -> Result<bool, TmuxError> {
        let target = exact_target(session);
        let output = self
            .run("has-session", &["has-session", "-t", &target])
            .await?;
        Ok(output.status.success())
    }

    async fn capture(&self, session: &str) -> Result<String, TmuxError> {
        let target = exact_target(session);
        let output = self
            .run("capture-pane", &["capture-pane", "-p", "-t", &target])
            .await?;

        if !output.status.success() {
            return Err(Self::failure("capture-pane", session, &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn send_keys(&self, session: &str, keys: &Keys) -> Result<(), TmuxError> {
        let target = exact_target(session);
        let output = match keys {
            Keys::Literal(text) => {
                self.run("send-keys", &["send-keys", "-t", &target, "-l", text])
                    .await?
            }
            Keys::Named(key) => {
                self.run("send-keys", &["send-keys", "-t", &target, key.tmux_name()])
                    .await?
            }
        };

        if !output.status.success() {
            return Err(Self::failure("send-keys", session, &output));
        }
        Ok(())
    }

    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError> {
        let target = exact_target(session);
        let output = self
            .run(
                "display-message",
                &["display-message", "-p", "-t", &target, "#{session_created}"],
            )
            .await?;

        if !output.status.success() {
            return Err(Self::failure("display-message", session, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().parse().ok())
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_line() {
        let session = TmuxClient::parse_session_line("$3|claude_api-2|1718000000|1").unwrap();
        assert_eq!(session.id, "$3");
        assert_eq!(session.name, "claude_api-2");
        assert_eq!(session.created_at, 1718000000);
        assert_eq!(session.attached_clients, 1);
    }

    #[test]
    fn test_parse_session_line_rejects_short_lines() {
        assert!(TmuxClient::parse_session_line("$3|claude").is_none());
    }

    #[test]
    fn test_parse_session_line_tolerates_bad_numbers() {
        let session = TmuxClient::parse_session_line("$1|work|soon|?").unwrap();
        assert_eq!(session.created_at, 0);
        assert_eq!(session.attached_clients, 0);
    }

    #[test]
    fn test_exact_target() {
        assert_eq!(exact_target("claude_demo-8"), "=claude_demo-8");
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let client = TmuxClient::new().with_binary("/nonexistent/tmux-binary");
        let err = client.capture("anything").await.unwrap_err();
        assert!(matches!(err, TmuxError::Io(_)));
        assert!(!client.is_server_running().await);
    }
}
