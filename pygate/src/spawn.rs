//! Spawning the external script process.
//!
//! The supervisor launches the script through a [`ScriptSpawner`] so tests
//! and externally-managed deployments can substitute their own strategy.
//! The listening endpoint is handed to the child via `PYGATE_CONNECT`.

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::channel::Endpoint;

/// Environment variable telling the child where the host is listening,
/// e.g. `tcp:127.0.0.1:25333` or `unix:/tmp/pygate-1234/bridge.sock`.
pub const CONNECT_ENV: &str = "PYGATE_CONNECT";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Extension point for different script launch strategies.
///
/// Returning `None` means the process is managed outside the session and
/// the supervisor only waits for it to connect.
pub trait ScriptSpawner: Send + Sync {
    fn spawn(&self, endpoint: &Endpoint) -> Result<Option<Child>, SpawnError>;
}

/// The script process is started by something else (an operator, a test
/// harness); the session just listens for it.
pub struct ExternalProcess;

impl ScriptSpawner for ExternalProcess {
    fn spawn(&self, _endpoint: &Endpoint) -> Result<Option<Child>, SpawnError> {
        Ok(None)
    }
}

/// Launch command for the script process.
#[derive(Debug, Clone)]
pub struct ScriptCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ScriptCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Spawner that runs a configured command, typically the Python interpreter
/// with the bridge script.
pub struct CommandSpawner {
    command: ScriptCommand,
}

impl CommandSpawner {
    pub fn new(command: ScriptCommand) -> Self {
        Self { command }
    }
}

impl ScriptSpawner for CommandSpawner {
    fn spawn(&self, endpoint: &Endpoint) -> Result<Option<Child>, SpawnError> {
        tracing::info!(program = %self.command.program, %endpoint, "Spawning script process");
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .env(CONNECT_ENV, endpoint.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Some(child))
    }
}
