use natrelay_transport::Backoff;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_RECOVERY: Backoff =
    Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), 10);

/// Port the backend's local control server answers on once it is ready.
pub const DEFAULT_BACKEND_PORT: u16 = 19988;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring unparseable {}={:?}", name, raw);
                None
            }
        },
        _ => None,
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often backend health is checked while the relay is open.
    pub health_interval: Duration,
    /// Upper bound on a single write to the backend.
    pub write_timeout: Duration,
    /// Time the backend gets to exit after SIGTERM before it is killed.
    pub shutdown_grace: Duration,
    /// Backoff between backend restart attempts.
    pub recovery: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            recovery: DEFAULT_RECOVERY,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `NATRELAY_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(d) = env_millis("NATRELAY_HEALTH_INTERVAL_MS") {
            config.health_interval = d;
        }
        if let Some(d) = env_millis("NATRELAY_WRITE_TIMEOUT_MS") {
            config.write_timeout = d;
        }
        if let Some(d) = env_millis("NATRELAY_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = d;
        }
        if let Some(n) = env_parse::<u32>("NATRELAY_MAX_RECOVERY_ATTEMPTS").filter(|n| *n > 0) {
            config.recovery.max_attempts = n;
        }
        config
    }
}

/// How to launch the backend process.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Passed to the backend as `--host`.
    pub host: String,
    /// Address that accepts TCP connections once the backend is ready.
    pub health_addr: Option<SocketAddr>,
    /// Readiness polling.
    pub startup_attempts: u32,
    pub startup_poll: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let program = if cfg!(windows) { "npx.cmd" } else { "npx" };
        Self {
            program: program.to_string(),
            args: vec!["playwriter@latest".to_string(), "serve".to_string()],
            host: "localhost".to_string(),
            health_addr: Some(SocketAddr::from(([127, 0, 0, 1], DEFAULT_BACKEND_PORT))),
            startup_attempts: 20,
            startup_poll: Duration::from_millis(500),
        }
    }
}

impl BackendConfig {
    /// Replaces the launch command with a whitespace-separated command line.
    pub fn with_command_line(mut self, command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            self.program = program;
            self.args = parts.collect();
        }
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cmd) = std::env::var("NATRELAY_BACKEND_CMD") {
            config = config.with_command_line(&cmd);
        }
        match std::env::var("NATRELAY_BACKEND_HEALTH_ADDR") {
            Ok(v) if v.trim() == "none" => config.health_addr = None,
            Ok(_) => {
                if let Some(addr) = env_parse::<SocketAddr>("NATRELAY_BACKEND_HEALTH_ADDR") {
                    config.health_addr = Some(addr);
                }
            }
            Err(_) => {}
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn command_line_splits_program_and_args() {
        let config = BackendConfig::default().with_command_line("node  server.js --quiet");
        assert_equal!(config.program, "node");
        assert_equal!(config.args, vec!["server.js", "--quiet"]);
    }

    #[test]
    fn empty_command_line_keeps_default() {
        let config = BackendConfig::default().with_command_line("   ");
        assert_equal!(config.args, BackendConfig::default().args);
    }

    #[test]
    fn recovery_defaults() {
        let config = RelayConfig::default();
        assert_equal!(config.recovery.delay(1), Duration::from_millis(2000));
        assert_equal!(config.recovery.delay(10), Duration::from_millis(30_000));
        assert_equal!(config.recovery.max_attempts, 10);
    }
}
