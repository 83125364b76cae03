//! This module wraps the proxy's two external operations, validation and live reload, and
//! chains them into a commit that never reloads an unvalidated configuration.
use async_trait::async_trait;
use log::{debug, info};
use snafu::{ensure, OptionExt, ResultExt};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_BINARY: &str = "nginx";

/// Which of the proxy's operations a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Reload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Validate => write!(f, "validate"),
            Phase::Reload => write!(f, "reload"),
        }
    }
}

/// The operations the gateway needs from the proxy process.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Checks the configuration on disk without applying it.
    async fn validate(&self) -> Result<()>;

    /// Makes the running proxy pick up the configuration on disk.
    async fn reload(&self) -> Result<()>;

    /// Validates, then reloads only if validation passed.  Returns the first failure.
    async fn commit(&self) -> Result<()> {
        self.validate().await?;
        self.reload().await
    }
}

/// Drives an nginx binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxController {
    binary: PathBuf,
    validate_args: Vec<String>,
    reload_args: Vec<String>,
    timeout: Option<Duration>,
}

impl Default for NginxController {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl NginxController {
    /// Uses `<binary> -t` to validate and `<binary> -s reload` to reload, with no timeout.
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
            validate_args: vec!["-t".to_string()],
            reload_args: vec!["-s".to_string(), "reload".to_string()],
            timeout: None,
        }
    }

    pub fn with_validate_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validate_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reload_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reload_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Bounds each command; a command still running at the deadline is killed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.binary.to_string_lossy().into_owned())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self, phase: Phase, args: &[String]) -> Result<()> {
        let command = self.command_line(args);
        debug!("Running '{}'", command);

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave the process behind.
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .ok()
                .context(error::TimeoutSnafu {
                    phase,
                    command: &command,
                    timeout,
                })?,
            None => cmd.output().await,
        }
        .context(error::SpawnSnafu {
            phase,
            command: &command,
        })?;

        let diagnostics = diagnostics(&output.stdout, &output.stderr);
        let code = output
            .status
            .code()
            .unwrap_or_else(|| output.status.signal().unwrap_or(1));
        match phase {
            Phase::Validate => ensure!(
                output.status.success(),
                error::ValidationSnafu { code, diagnostics }
            ),
            Phase::Reload => ensure!(
                output.status.success(),
                error::ReloadSnafu { code, diagnostics }
            ),
        }

        info!("'{}' succeeded", command);
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for NginxController {
    async fn validate(&self) -> Result<()> {
        self.run(Phase::Validate, &self.validate_args).await
    }

    async fn reload(&self) -> Result<()> {
        self.run(Phase::Reload, &self.reload_args).await
    }
}

/// Joins whatever the command printed, stderr first since that's where nginx reports problems.
fn diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    [stderr, stdout]
        .iter()
        .map(|stream| String::from_utf8_lossy(stream).trim().to_string())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

mod error {
    use super::Phase;
    use snafu::Snafu;
    use std::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to run {} command '{}': {}", phase, command, source))]
        Spawn {
            phase: Phase,
            command: String,
            source: std::io::Error,
        },

        #[snafu(display(
            "{} command '{}' did not finish within {:?}",
            phase,
            command,
            timeout
        ))]
        Timeout {
            phase: Phase,
            command: String,
            timeout: Duration,
        },

        #[snafu(display("Invalid NGINX configuration (exit {}): {}", code, diagnostics))]
        Validation { code: i32, diagnostics: String },

        #[snafu(display("Error reloading NGINX (exit {}): {}", code, diagnostics))]
        Reload { code: i32, diagnostics: String },
    }

    impl Error {
        /// The operation that failed.
        pub fn phase(&self) -> Phase {
            match self {
                Error::Spawn { phase, .. } | Error::Timeout { phase, .. } => *phase,
                Error::Validation { .. } => Phase::Validate,
                Error::Reload { .. } => Phase::Reload,
            }
        }
    }
}

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_diagnostics_prefers_stderr() {
        assert_eq!(diagnostics(b"ok\n", b"bad\n"), "bad\nok");
        assert_eq!(diagnostics(b"", b"  bad  "), "bad");
        assert_eq!(diagnostics(b"", b""), "");
    }

    #[test]
    fn test_default_commands() {
        let controller = NginxController::default();
        assert_eq!(controller.command_line(&controller.validate_args), "nginx -t");
        assert_eq!(
            controller.command_line(&controller.reload_args),
            "nginx -s reload"
        );
    }

    #[tokio::test]
    async fn test_commit_runs_both_phases() {
        let controller = NginxController::new("sh")
            .with_validate_args(shell("exit 0"))
            .with_reload_args(shell("exit 0"));
        controller.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_failure_carries_diagnostics() {
        let controller = NginxController::new("sh")
            .with_validate_args(shell("echo 'unknown directive \"bogus\"' >&2; exit 1"))
            .with_reload_args(shell("exit 0"));
        let err = controller.commit().await.unwrap_err();
        assert_eq!(err.phase(), Phase::Validate);
        match err {
            Error::Validation { code, diagnostics } => {
                assert_eq!(code, 1);
                assert_eq!(diagnostics, "unknown directive \"bogus\"");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_reload_failure() {
        let controller = NginxController::new("sh")
            .with_validate_args(shell("exit 0"))
            .with_reload_args(shell("echo 'bind() failed' >&2; exit 2"));
        let err = controller.commit().await.unwrap_err();
        assert!(matches!(err, Error::Reload { code: 2, .. }));
        assert!(err.to_string().starts_with("Error reloading NGINX"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let controller = NginxController::new("/nonexistent/nginx");
        let err = controller.validate().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { phase: Phase::Validate, .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let controller = NginxController::new("sh")
            .with_validate_args(shell("sleep 5"))
            .with_timeout(Some(Duration::from_millis(100)));
        let err = controller.validate().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Validate, .. }));
    }
}
