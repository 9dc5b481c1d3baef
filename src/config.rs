use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the router port
pub const ROUTER_PORT_ENV: &str = "CODER2API_PORT";
/// Environment variable overriding the log directory
pub const LOG_DIR_ENV: &str = "CODER2API_LOG_DIR";
/// Prefix of the per-backend port variables (`CODER2API_<PREFIX>_PORT`)
const ENV_PREFIX: &str = "CODER2API_";
/// Directory whose presence marks the project root
const PROJECT_ROOT_MARKER: &str = "coders";
/// Placeholder in backend arguments replaced by the backend's port
const PORT_PLACEHOLDER: &str = "{port}";
/// Path served by the router itself, never routed to a backend
pub const HEALTH_PREFIX: &str = "health";

/// Top-level configuration: the router plus the supervised backends
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Router and supervisor settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backends in start order
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the router (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Router port (default: 8069)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Name reported by the health endpoint
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Directory for per-backend log files, relative to the current directory
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Upper bound for one downstream call in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL at shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// How often exited children are reaped while running, in milliseconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,

    /// Project root used to resolve relative working directories.
    /// Discovered from the current directory when unset.
    pub root: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            service_name: default_service_name(),
            log_dir: default_log_dir(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            reap_interval_ms: default_reap_interval(),
            root: None,
        }
    }
}

/// Launch command, either a single shell-style line or an argv array
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn split(&self) -> Result<Vec<String>, String> {
        match self {
            CommandSpec::Line(line) => {
                shell_words::split(line).map_err(|e| format!("invalid command '{}': {}", line, e))
            }
            CommandSpec::Argv(argv) => Ok(argv.clone()),
        }
    }
}

/// A supervised backend and the path prefix that routes to it
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Short service name, also used for log file names
    pub name: String,

    /// Executable (plus optional leading arguments)
    pub command: CommandSpec,

    /// Extra arguments; `{port}` is replaced by `port`
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative paths resolve against the project root
    pub working_dir: Option<String>,

    /// Environment variables to set for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the backend binds on 127.0.0.1
    pub port: u16,

    /// First path segment routed to this backend
    pub prefix: String,
}

impl BackendConfig {
    /// Create a backend config from an argv-style command
    pub fn local(name: &str, command: &[&str], port: u16, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            command: CommandSpec::Argv(command.iter().map(|s| s.to_string()).collect()),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port,
            prefix: prefix.to_string(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// The command alone, without the serve-time `args`
    pub fn program(&self) -> Result<Vec<String>, String> {
        let program = self.command.split()?;
        if program.is_empty() {
            return Err(format!("Backend '{}': 'command' must not be empty", self.name));
        }
        Ok(program)
    }

    /// Full argv: command, then args, with `{port}` substituted everywhere
    pub fn argv(&self) -> Result<Vec<String>, String> {
        let port = self.port.to_string();
        let mut argv = self.command.split()?;
        argv.extend(self.args.iter().cloned());
        if argv.is_empty() {
            return Err(format!("Backend '{}': 'command' must not be empty", self.name));
        }
        Ok(argv
            .into_iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect())
    }

    /// Working directory resolved against the project root
    pub fn resolved_working_dir(&self, root: &Path) -> Option<PathBuf> {
        self.working_dir.as_ref().map(|dir| root.join(dir))
    }

    /// Name of the variable carrying this backend's port into the router
    pub fn port_env_var(&self) -> String {
        format!(
            "{}{}_PORT",
            ENV_PREFIX,
            self.prefix.to_ascii_uppercase().replace('-', "_")
        )
    }

    /// Validate a single backend in isolation
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Backend with empty 'name'".to_string());
        }
        self.program()?;
        self.argv()?;

        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                self.name
            ));
        }

        if self.prefix.is_empty() || self.prefix.contains('/') {
            return Err(format!(
                "Backend '{}': 'prefix' must be a single non-empty path segment",
                self.name
            ));
        }

        if self.prefix == HEALTH_PREFIX {
            return Err(format!(
                "Backend '{}': prefix '{}' is reserved for the router",
                self.name, HEALTH_PREFIX
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8069
}

fn default_service_name() -> String {
    "coder2api".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_reap_interval() -> u64 {
    1000
}

fn default_backends() -> Vec<BackendConfig> {
    let port_args = |extra: &[&str]| {
        extra
            .iter()
            .map(|s| s.to_string())
            .chain(["--port".to_string(), PORT_PLACEHOLDER.to_string()])
            .collect::<Vec<_>>()
    };

    vec![
        BackendConfig::local("gemini", &["node", "dist/index.js"], 3001, "gemini")
            .with_args(port_args(&[]))
            .with_working_dir("coders/gemini-cli-proxy"),
        BackendConfig::local("chatmock", &["python3", "-m", "chatmock.cli"], 3002, "codex")
            .with_args(port_args(&["serve"])),
        BackendConfig::local(
            "claude-code",
            &["python3", "-m", "uvicorn", "claude_code_api.main:app"],
            3003,
            "cc",
        )
        .with_args({
            let mut args = port_args(&[]);
            args.extend(["--host".to_string(), "127.0.0.1".to_string()]);
            args
        }),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backends: default_backends(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if given (built-in defaults otherwise), apply process
    /// environment overrides and validate
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CODER2API_*` overrides from the given variables
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        if let Some(value) = vars.get(ROUTER_PORT_ENV) {
            self.server.port = parse_port(ROUTER_PORT_ENV, value)?;
        }

        if let Some(value) = vars.get(LOG_DIR_ENV) {
            self.server.log_dir = value.clone();
        }

        for backend in &mut self.backends {
            let key = backend.port_env_var();
            if let Some(value) = vars.get(&key) {
                backend.port = parse_port(&key, value)?;
            }
        }

        Ok(())
    }

    /// Port variables handed to a router running as a child process
    pub fn router_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .backends
            .iter()
            .map(|b| (b.port_env_var(), b.port.to_string()))
            .collect();
        env.push((ROUTER_PORT_ENV.to_string(), self.server.port.to_string()));
        env
    }

    /// Look up a backend by service name
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Project root: explicit `root`, else discovered from the current directory
    pub fn project_root(&self) -> PathBuf {
        match self.server.root {
            Some(ref root) => PathBuf::from(root),
            None => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                find_project_root(&cwd)
            }
        }
    }

    /// Log directory as an absolute-or-relative path
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.log_dir)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backends.is_empty() {
            errors.push("At least one backend must be configured".to_string());
        }

        if self.server.port == 0 {
            errors.push("Router 'port' must be greater than 0".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.server.reap_interval_ms == 0 {
            errors.push("'reap_interval_ms' must be greater than 0".to_string());
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut ports = HashSet::new();
        ports.insert(self.server.port);
        let mut port_vars = HashMap::new();

        for backend in &self.backends {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            if !names.insert(backend.name.as_str()) {
                errors.push(format!("Duplicate backend name '{}'", backend.name));
            }
            if !prefixes.insert(backend.prefix.as_str()) {
                errors.push(format!(
                    "Backend '{}': duplicate prefix '{}'",
                    backend.name, backend.prefix
                ));
            }
            if backend.port != 0 && !ports.insert(backend.port) {
                errors.push(format!(
                    "Backend '{}': port {} is already in use by another service",
                    backend.name, backend.port
                ));
            }
            let var = backend.port_env_var();
            if let Some(other) = port_vars.insert(var.clone(), backend.name.as_str()) {
                errors.push(format!(
                    "Backend '{}': prefix '{}' maps to {} which backend '{}' already uses",
                    backend.name, backend.prefix, var, other
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> anyhow::Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("Invalid port in {}='{}': {}", key, value, e))
}

/// Nearest ancestor of `start` (inclusive) containing the project marker
/// directory, falling back to `start`
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_ROOT_MARKER).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}
