//! Foreground delegation to a configured backend command.
//!
//! `coder2api exec <name> [args...]` runs the backend's program with the
//! caller's arguments instead of the configured ones, in the backend's working
//! directory and environment, with stdio inherited. On unix the current
//! process image is replaced; elsewhere the child is awaited and its exit code
//! returned.

use crate::config::BackendConfig;
use crate::error::SupervisorError;
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Build the command for `backend` with `extra` appended to its program
pub fn build_command(
    backend: &BackendConfig,
    root: &Path,
    extra: &[String],
) -> Result<Command, SupervisorError> {
    let program = backend
        .program()
        .map_err(|reason| SupervisorError::InvalidCommand {
            name: backend.name.clone(),
            reason,
        })?;
    let (exe, leading) = program
        .split_first()
        .ok_or_else(|| SupervisorError::InvalidCommand {
            name: backend.name.clone(),
            reason: "empty command".to_string(),
        })?;

    let mut cmd = Command::new(exe);
    cmd.args(leading).args(extra);

    if let Some(dir) = backend.resolved_working_dir(root) {
        if !dir.is_dir() {
            return Err(SupervisorError::MissingWorkingDir {
                name: backend.name.clone(),
                path: dir,
            });
        }
        cmd.current_dir(dir);
    }

    for (key, value) in &backend.env {
        cmd.env(key, value);
    }

    Ok(cmd)
}

/// Hand the terminal over to the backend command.
///
/// On unix this only returns if the exec itself failed.
pub fn delegate(backend: &BackendConfig, root: &Path, extra: &[String]) -> Result<i32, SupervisorError> {
    let mut cmd = build_command(backend, root, extra)?;
    let program = cmd.get_program().to_string_lossy().into_owned();
    info!(name = %backend.name, program, args = ?extra, "Delegating to backend command");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let source = cmd.exec();
        Err(SupervisorError::Spawn {
            name: backend.name.clone(),
            command: program,
            source,
        })
    }

    #[cfg(not(unix))]
    {
        let status = cmd.status().map_err(|source| SupervisorError::Spawn {
            name: backend.name.clone(),
            command: program,
            source,
        })?;
        Ok(status.code().unwrap_or(1))
    }
}
