//! Process supervisor.
//!
//! Owns every backend child for the lifetime of a `serve` run. Startup spawns
//! in declared order and aborts the whole run on the first failure. Shutdown
//! is a single idempotent operation: the first caller wins an atomic flag and
//! takes the process list; later callers return immediately.

use crate::config::{BackendConfig, Config};
use crate::error::SupervisorError;
use crate::process::{BackendProcess, LaunchSpec, OutputMode, ProcessState};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound for waiting on a process after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Snapshot of one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
}

impl ProcessStatus {
    fn of(process: &BackendProcess) -> Self {
        Self {
            name: process.name().to_string(),
            pid: process.pid(),
            state: process.state(),
        }
    }
}

pub struct Supervisor {
    processes: Mutex<Vec<BackendProcess>>,
    state: Mutex<SupervisorState>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    grace_period: Duration,
    log_dir: PathBuf,
    root: PathBuf,
    reap_interval: Duration,
}

impl Supervisor {
    pub fn new(log_dir: PathBuf, root: PathBuf, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self::with_paths(log_dir, root, grace_period))
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            reap_interval: config.server.reap_interval().max(Duration::from_millis(1)),
            ..Self::with_paths(
                config.log_dir(),
                config.project_root(),
                config.server.shutdown_grace_period(),
            )
        })
    }

    fn with_paths(log_dir: PathBuf, root: PathBuf, grace_period: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            processes: Mutex::new(Vec::new()),
            state: Mutex::new(SupervisorState::Idle),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            grace_period,
            log_dir,
            root,
            reap_interval: Duration::from_secs(1),
        }
    }

    /// Receiver that flips to `true` when shutdown begins
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Spawn every backend in order.
    ///
    /// On the first failure the children already started are shut down and
    /// the error is returned.
    pub async fn start_all(&self, backends: &[BackendConfig]) -> Result<(), SupervisorError> {
        {
            let mut state = self.state.lock();
            if *state != SupervisorState::Idle {
                return Err(SupervisorError::AlreadyStarted);
            }
            *state = SupervisorState::Running;
        }

        let output = OutputMode::LogFiles(self.log_dir.clone());

        for backend in backends {
            let result = LaunchSpec::from_backend(backend, &self.root).and_then(|spec| {
                let mut processes = self.processes.lock();
                if self.is_shutting_down() {
                    return Ok(false);
                }
                processes.push(BackendProcess::spawn(&spec, &output)?);
                Ok(true)
            });

            match result {
                Ok(true) => {
                    info!(name = %backend.name, port = backend.port, prefix = %backend.prefix, "Backend started");
                }
                Ok(false) => {
                    info!("Shutdown requested during startup, not starting remaining backends");
                    return Ok(());
                }
                Err(e) => {
                    error!(name = %backend.name, error = %e, "Failed to start backend, aborting");
                    self.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!(count = backends.len(), log_dir = %self.log_dir.display(), "All backends started");
        Ok(())
    }

    /// Poll every child without blocking. Returns the children whose exit was
    /// observed by this call.
    pub fn reap_exited(&self) -> Vec<ProcessStatus> {
        let mut processes = self.processes.lock();
        let mut exited = Vec::new();

        for process in processes.iter_mut() {
            if let Some(state) = process.refresh() {
                match state {
                    ProcessState::Exited(code) => {
                        warn!(name = process.name(), pid = process.pid(), code, "Backend exited unexpectedly");
                    }
                    _ => {
                        debug!(name = process.name(), pid = process.pid(), ?state, "Backend stopped");
                    }
                }
                exited.push(ProcessStatus::of(process));
            }
        }

        exited
    }

    /// Name, pid and last observed state of every child
    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.processes.lock().iter().map(ProcessStatus::of).collect()
    }

    /// Stop every child: SIGTERM, wait up to the grace period, then SIGKILL.
    ///
    /// Returns `false` if another caller already ran or is running shutdown.
    pub async fn shutdown(&self) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already in progress");
            return false;
        }

        *self.state.lock() = SupervisorState::ShuttingDown;
        self.shutdown_tx.send_replace(true);

        let mut processes = std::mem::take(&mut *self.processes.lock());
        info!(count = processes.len(), grace_period_secs = self.grace_period.as_secs(), "Stopping backends");

        for process in processes.iter_mut() {
            process.terminate();
        }

        let deadline = Instant::now() + self.grace_period;
        for process in processes.iter_mut() {
            match tokio::time::timeout_at(deadline, process.wait()).await {
                Ok(Ok(state)) => {
                    debug!(name = process.name(), ?state, "Backend stopped");
                }
                Ok(Err(e)) => {
                    warn!(name = process.name(), error = %e, "Failed to wait for backend");
                }
                Err(_) => {
                    warn!(
                        name = process.name(),
                        pid = process.pid(),
                        "Backend did not exit within grace period, sending SIGKILL"
                    );
                    process.kill();
                    if tokio::time::timeout(KILL_WAIT, process.wait()).await.is_err() {
                        error!(name = process.name(), pid = process.pid(), "Backend still running after SIGKILL");
                    }
                }
            }
        }

        *self.processes.lock() = processes;
        *self.state.lock() = SupervisorState::Stopped;
        info!("All backends stopped");
        true
    }

    /// Run the router in the foreground until it exits or a termination
    /// signal arrives, then shut everything down.
    pub async fn run_foreground(
        &self,
        mut foreground: Foreground,
        signals: &mut ShutdownSignals,
    ) -> ForegroundExit {
        let mut reap = tokio::time::interval(self.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                exit = foreground.finished() => {
                    match exit {
                        ForegroundExit::RouterFailed(ref reason) => error!(reason = %reason, "Router failed"),
                        _ => info!("Router exited"),
                    }
                    break exit;
                }
                signal = signals.recv() => {
                    info!(signal, "Received signal, shutting down");
                    break ForegroundExit::Signal(signal);
                }
                _ = reap.tick() => {
                    self.reap_exited();
                }
            }
        };

        let stopping = async {
            self.stop_foreground(foreground).await;
            self.shutdown().await;
        };
        tokio::pin!(stopping);

        loop {
            tokio::select! {
                _ = &mut stopping => break,
                signal = signals.recv() => {
                    warn!(signal, "Shutdown already in progress, ignoring signal");
                }
            }
        }

        exit
    }

    async fn stop_foreground(&self, foreground: Foreground) {
        match foreground {
            Foreground::InProcess(router) => drop(router),
            Foreground::Process(mut process) => {
                if !process.is_alive() {
                    return;
                }
                process.terminate();
                if tokio::time::timeout(self.grace_period, process.wait()).await.is_err() {
                    warn!(pid = process.pid(), "Router did not exit within grace period, sending SIGKILL");
                    process.kill();
                    let _ = tokio::time::timeout(KILL_WAIT, process.wait()).await;
                }
            }
        }
    }
}

/// The router, either served by this process or running as a child
pub enum Foreground {
    InProcess(Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>),
    Process(BackendProcess),
}

impl Foreground {
    pub fn in_process<F>(router: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Foreground::InProcess(Box::pin(router))
    }

    /// Resolves when the router stops on its own. Cancel safe.
    async fn finished(&mut self) -> ForegroundExit {
        match self {
            Foreground::InProcess(router) => match router.as_mut().await {
                Ok(()) => ForegroundExit::RouterExited,
                Err(e) => ForegroundExit::RouterFailed(e.to_string()),
            },
            Foreground::Process(process) => match process.wait().await {
                Ok(ProcessState::Exited(Some(0))) => ForegroundExit::RouterExited,
                Ok(ProcessState::Exited(Some(code))) => {
                    ForegroundExit::RouterFailed(format!("router process exited with status {}", code))
                }
                Ok(state) => ForegroundExit::RouterFailed(format!("router process ended: {:?}", state)),
                Err(e) => ForegroundExit::RouterFailed(format!("failed to wait for router process: {}", e)),
            },
        }
    }
}

/// Why the foreground phase ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundExit {
    Signal(&'static str),
    RouterExited,
    RouterFailed(String),
}

impl ForegroundExit {
    pub fn exit_code(&self) -> u8 {
        match self {
            ForegroundExit::Signal(_) | ForegroundExit::RouterExited => 0,
            ForegroundExit::RouterFailed(_) => 1,
        }
    }
}

enum SignalSource {
    #[cfg(unix)]
    Os {
        interrupt: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
    },
    #[cfg(not(unix))]
    CtrlC,
    Channel(mpsc::UnboundedReceiver<&'static str>),
}

/// Termination signals (SIGINT and SIGTERM, or ctrl-c off unix)
pub struct ShutdownSignals {
    source: SignalSource,
}

impl ShutdownSignals {
    /// Install OS handlers. Must be called from within the runtime.
    pub fn install() -> Result<Self, SupervisorError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
            let terminate = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
            Ok(Self {
                source: SignalSource::Os { interrupt, terminate },
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {
                source: SignalSource::CtrlC,
            })
        }
    }

    /// Signals delivered by hand, for embedding and tests
    pub fn channel() -> (mpsc::UnboundedSender<&'static str>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { source: SignalSource::Channel(rx) })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        match &mut self.source {
            #[cfg(unix)]
            SignalSource::Os { interrupt, terminate } => {
                tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            #[cfg(not(unix))]
            SignalSource::CtrlC => {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
                "ctrl-c"
            }
            SignalSource::Channel(rx) => match rx.recv().await {
                Some(name) => name,
                None => std::future::pending().await,
            },
        }
    }
}
