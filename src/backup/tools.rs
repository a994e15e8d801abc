//! External dump/restore tool invocation
//!
//! Commands are described as data ([`ToolCommand`]) and executed by a [`ToolRunner`].
//! [`ProcessRunner`] spawns real processes; tests substitute a recording runner.

use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QuarryError, Result};

/// Environment variables whose values are secrets
const SECRET_ENV: &[&str] = &["PGPASSWORD", "MYSQL_PWD"];

/// One external tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment, added to the inherited one
    pub env: Vec<(String, String)>,
    /// Redirect stdout into this file
    pub stdout: Option<PathBuf>,
    /// Feed stdin from this file
    pub stdin: Option<PathBuf>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    #[must_use]
    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Value of an environment override, if set
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Shell-like rendering with secret values masked
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            if SECRET_ENV.contains(&key.as_str()) {
                write!(f, "{key}=******** ")?;
            } else {
                write!(f, "{key}={value} ")?;
            }
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        if let Some(path) = &self.stdin {
            write!(f, " < {}", path.display())?;
        }
        if let Some(path) = &self.stdout {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

/// Executes tool commands
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion; non-zero exit is [`QuarryError::ExternalTool`] with stderr,
    /// cancellation kills the process and yields [`QuarryError::Cancelled`]
    async fn run(&self, command: &ToolCommand, cancel: &CancellationToken) -> Result<()>;
}

/// Runs commands as child processes with an augmented `PATH`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand, cancel: &CancellationToken) -> Result<()> {
        let program = command.program.clone();
        let io_error = |what: &str, path: &Path, e: std::io::Error| {
            QuarryError::external_tool(program.clone(), format!("cannot {what} {}: {e}", path.display()))
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env("PATH", augmented_path())
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &command.stdout {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| io_error("create", path, e))?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::null());
            }
        }
        match &command.stdin {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| io_error("open", path, e))?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        debug!(command = %command, "running external tool");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                QuarryError::external_tool(
                    command.program.clone(),
                    format!("'{}' was not found on PATH; install the client tools", command.program),
                )
            } else {
                QuarryError::external_tool(command.program.clone(), format!("failed to start: {e}"))
            }
        })?;

        // Drain stderr concurrently so a chatty tool cannot block on a full pipe
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    QuarryError::external_tool(command.program.clone(), format!("failed to wait: {e}"))
                })?;
                let stderr = stderr_task.await.unwrap_or_default();
                if status.success() {
                    Ok(())
                } else {
                    let detail = stderr.trim();
                    let detail = if detail.is_empty() { status.to_string() } else { detail.to_string() };
                    Err(QuarryError::external_tool(command.program.clone(), detail))
                }
            }
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                Err(QuarryError::cancelled(format!("{} was cancelled", command.program)))
            }
        }
    }
}

/// Package-manager and vendor directories where database client tools usually live
fn extra_tool_dirs() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = [
        "/opt/homebrew/bin",
        "/opt/homebrew/opt/libpq/bin",
        "/opt/homebrew/opt/mysql-client/bin",
        "/usr/local/bin",
        "/usr/local/opt/libpq/bin",
        "/usr/local/opt/mysql-client/bin",
        "/usr/local/mysql/bin",
        "/Applications/Postgres.app/Contents/Versions/latest/bin",
        "/snap/bin",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    // Versioned PostgreSQL installs, newest first
    for root in ["/usr/lib/postgresql", "C:\\Program Files\\PostgreSQL"] {
        if let Ok(entries) = std::fs::read_dir(root) {
            let mut versions: Vec<PathBuf> = entries.flatten().map(|e| e.path().join("bin")).collect();
            versions.sort();
            candidates.extend(versions.into_iter().rev());
        }
    }

    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local").join("bin"));
    }
    candidates
}

/// Inherited `PATH` with tool directories prepended (existing ones only, no duplicates)
#[must_use]
pub fn augmented_path() -> OsString {
    let inherited: Vec<PathBuf> =
        std::env::var_os("PATH").map(|p| std::env::split_paths(&p).collect()).unwrap_or_default();

    let mut combined: Vec<PathBuf> = Vec::new();
    for dir in extra_tool_dirs().into_iter().filter(|d| d.is_dir()).chain(inherited) {
        if !combined.contains(&dir) {
            combined.push(dir);
        }
    }

    std::env::join_paths(combined).unwrap_or_else(|_| std::env::var_os("PATH").unwrap_or_default())
}
