//! Running external commands (`git`, `systemctl`, install scripts)

use async_trait::async_trait;
use duct::Expression;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What to run: a program with arguments, or a script for `bash -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    Exec { program: String, args: Vec<String> },
    Shell(String),
}

/// Where the child's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Buffered, stderr interleaved into stdout, returned to the caller.
    Captured,
    /// Passed through to this process's own streams.
    Inherited,
}

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Program,
    pub dir: PathBuf,
    pub output: OutputMode,
}

impl CommandSpec {
    pub fn exec<I, S>(program: &str, args: I, dir: &Path) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Exec {
                program: program.to_string(),
                args: args.into_iter().map(Into::into).collect(),
            },
            dir: dir.to_path_buf(),
            output: OutputMode::Captured,
        }
    }

    pub fn shell(script: &str, dir: &Path) -> Self {
        Self {
            program: Program::Shell(script.to_string()),
            dir: dir.to_path_buf(),
            output: OutputMode::Captured,
        }
    }

    pub fn inherit_output(mut self) -> Self {
        self.output = OutputMode::Inherited;
        self
    }

    fn expression(&self) -> Expression {
        let expression = match &self.program {
            Program::Exec { program, args } => duct::cmd(program.as_str(), args),
            // The install script comes from the operator's own config file.
            Program::Shell(script) => duct::cmd("bash", ["-c", script.as_str()]),
        };
        expression.dir(&self.dir).unchecked()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Program::Exec { program, args } => {
                write!(f, "{}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Program::Shell(script) => write!(f, "{}", script),
        }
    }
}

/// Failure of a single command invocation.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command could not be started at all.
    #[error("`{command}` could not start: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The command ran and exited unsuccessfully. `output` is the trimmed
    /// combined output, empty when the output was inherited.
    #[error("`{command}` exited with code {code}: {output}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: String,
    },
}

/// Runs commands exactly once, no retries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and return its trimmed combined output.
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError>;
}

/// Runs commands as real child processes on the blocking thread pool.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    fn run_blocking(spec: &CommandSpec) -> Result<String, CommandError> {
        let command = spec.to_string();
        let spawn_error = |source| CommandError::Spawn {
            command: command.clone(),
            source,
        };

        let output = match spec.output {
            OutputMode::Captured => spec
                .expression()
                .stderr_to_stdout()
                .stdout_capture()
                .run()
                .map_err(spawn_error)?,
            OutputMode::Inherited => spec.expression().run().map_err(spawn_error)?,
        };

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        text.lines().for_each(|line| debug!("{line}"));

        if output.status.success() {
            Ok(text)
        } else {
            Err(CommandError::NonZeroExit {
                command,
                code: output.status.code().unwrap_or(-1),
                output: text,
            })
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        debug!("Running (cwd = '{}'): {}", spec.dir.display(), spec);
        let owned = spec.clone();
        tokio::task::spawn_blocking(move || Self::run_blocking(&owned))
            .await
            .map_err(|e| CommandError::Spawn {
                command: spec.to_string(),
                source: std::io::Error::other(e),
            })?
    }
}
