//! Bounded invocation of external programs.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs `command` to completion, capturing stdout and stderr.
///
/// The child is killed when the deadline passes or when the returned future is
/// dropped, so an abandoned flow never leaves a renderer or recognizer running.
pub async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, ProcessError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(ProcessError::Wait { program, source }),
        Err(_) => {
            tracing::warn!(%program, ?timeout, "external process timed out, killing it");
            Err(ProcessError::TimedOut { program, timeout })
        }
    }
}

/// Trimmed stderr, for error messages.
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}
