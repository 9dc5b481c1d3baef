//! A single supervised child process.
//!
//! Each backend runs in its own process group (unix) so that termination
//! reaches any workers it forks. Standard output and error go to per-service
//! log files that are truncated when the process is spawned.

use crate::config::BackendConfig;
use crate::error::SupervisorError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, not yet observed running
    Starting,
    /// Observed alive at least once
    Running,
    /// Ended on its own (crash or clean exit). `None` when ended by a signal.
    Exited(Option<i32>),
    /// Ended after an explicit terminate or kill
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Killed)
    }
}

/// Where a child's stdout/stderr go
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// `<dir>/<name>.out.log` and `<dir>/<name>.err.log`, truncated on spawn
    LogFiles(PathBuf),
    /// Inherit the supervisor's stdio
    Inherit,
}

/// Everything needed to launch one process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Build the launch spec for a configured backend
    pub fn from_backend(backend: &BackendConfig, root: &Path) -> Result<Self, SupervisorError> {
        let argv = backend
            .argv()
            .map_err(|reason| SupervisorError::InvalidCommand {
                name: backend.name.clone(),
                reason,
            })?;

        let mut env: Vec<(String, String)> = backend
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Ok(Self {
            name: backend.name.clone(),
            argv,
            working_dir: backend.resolved_working_dir(root),
            env,
        })
    }

    /// Program and arguments as a single display string
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Paths of the two log files for a service
pub fn log_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.out.log", name)),
        dir.join(format!("{}.err.log", name)),
    )
}

fn create_log(path: PathBuf) -> Result<File, SupervisorError> {
    File::create(&path).map_err(|source| SupervisorError::LogFile { path, source })
}

/// Handle to one running child
pub struct BackendProcess {
    name: String,
    pid: Option<u32>,
    child: Child,
    state: ProcessState,
    /// Set once terminate or kill was requested
    terminate_requested: bool,
}

impl BackendProcess {
    /// Spawn the process described by `spec`.
    ///
    /// Fails without side effects on the process table when the working
    /// directory is missing or the executable cannot be started.
    pub fn spawn(spec: &LaunchSpec, output: &OutputMode) -> Result<Self, SupervisorError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SupervisorError::InvalidCommand {
                name: spec.name.clone(),
                reason: "empty command".to_string(),
            })?;

        if let Some(ref dir) = spec.working_dir {
            if !dir.is_dir() {
                return Err(SupervisorError::MissingWorkingDir {
                    name: spec.name.clone(),
                    path: dir.clone(),
                });
            }
        }

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        match output {
            OutputMode::LogFiles(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| SupervisorError::LogFile {
                    path: dir.clone(),
                    source,
                })?;
                let (out_path, err_path) = log_paths(dir, &spec.name);
                cmd.stdout(Stdio::from(create_log(out_path)?));
                cmd.stderr(Stdio::from(create_log(err_path)?));
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }

        // Own process group so signals reach the whole tree
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            command: program.clone(),
            source,
        })?;

        let pid = child.id();
        info!(name = %spec.name, pid, command = %spec.command_line(), "Process spawned");

        Ok(Self {
            name: spec.name.clone(),
            pid,
            child,
            state: ProcessState::Starting,
            terminate_requested: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessState {
        self.state = if self.terminate_requested {
            ProcessState::Killed
        } else {
            ProcessState::Exited(status.code())
        };
        self.state
    }

    /// Non-blocking poll of the OS process.
    ///
    /// Returns the terminal state if this call observed the exit.
    pub fn refresh(&mut self) -> Option<ProcessState> {
        if self.state.is_terminal() {
            return None;
        }

        match self.child.try_wait() {
            Ok(None) => {
                if self.state == ProcessState::Starting {
                    self.state = ProcessState::Running;
                }
                None
            }
            Ok(Some(status)) => Some(self.record_exit(status)),
            Err(e) => {
                warn!(name = %self.name, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    /// Non-blocking liveness check
    pub fn is_alive(&mut self) -> bool {
        self.refresh();
        !self.state.is_terminal()
    }

    /// Request graceful termination (SIGTERM to the process group). Does not wait.
    pub fn terminate(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.terminate_requested = true;

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                debug!(name = %self.name, pid, "Sending SIGTERM");
                send_signal(pid, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    /// Force the process down (SIGKILL to the process group). Does not wait.
    pub fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.terminate_requested = true;

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                debug!(name = %self.name, pid, "Sending SIGKILL");
                send_signal(pid, libc::SIGKILL);
            }
        }

        let _ = self.child.start_kill();
    }

    /// Wait for the process to end and record its terminal state
    pub async fn wait(&mut self) -> std::io::Result<ProcessState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }
}

/// Signal the process group led by `pid`, falling back to the pid itself
#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}
