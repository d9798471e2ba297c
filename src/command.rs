//! Host command execution used for device assembly, formatting, and mounts.

use std::ffi::OsString;
use std::process::Command;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while executing host commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the process exits with a non-zero status.
    #[error("`{command}` exited with status {status}: {stderr}")]
    Failed {
        /// Shell-escaped command line.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        debug!(command = %render_command(program, args), "running host command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Renders a shell-escaped command line for logs and error messages.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        let text = arg.to_string_lossy();
        rendered.push_str(escape(text).as_ref());
    }
    rendered
}

/// Converts string arguments into the owned form expected by runners.
#[must_use]
pub fn os_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter().map(Into::into).collect()
}

/// Runs a command and converts a non-zero exit into [`CommandError::Failed`].
pub(crate) fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
) -> Result<CommandOutput, CommandError> {
    let output = runner.run(program, args)?;
    if output.is_success() {
        return Ok(output);
    }
    Err(failure(program, args, &output))
}

pub(crate) fn failure(program: &str, args: &[OsString], output: &CommandOutput) -> CommandError {
    CommandError::Failed {
        command: render_command(program, args),
        status: output.status_text(),
        stderr: output.stderr.trim().to_owned(),
    }
}
