use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when `SITEFORGE_CONFIG` is unset, if present
pub const DEFAULT_CONFIG_FILE: &str = "siteforge.toml";

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Parent of the per-site workspace directories
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Fallback store, per-site logs and lock files live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Only archives inside this directory are accepted, and consumed
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            data_dir: default_data_dir(),
            upload_dir: default_upload_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `postgres://...` or `sqlite:<path>`; unset means fallback-only
    pub database_url: Option<String>,

    /// Deadline for connecting to the primary store (default: 2000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Container runtime CLI (default: podman)
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// First host port handed out (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the host port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// How long a mutating action waits for the site lock (default: 600)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Lines returned by the logs query when the request gives none
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            lock_timeout_secs: default_lock_timeout(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl RuntimeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// nginx map file regenerated after every change
    #[serde(default = "default_map_path")]
    pub map_path: PathBuf,

    /// Program and arguments that reload the proxy
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            map_path: default_map_path(),
            reload_command: default_reload_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecutionConfig {
    /// Run external commands for real (`GENERATOR_MODE=production`)
    #[serde(default)]
    pub production: bool,

    /// Log external commands without running them, even in production
    #[serde(default)]
    pub dry_run: bool,
}

impl ExecutionConfig {
    /// True when external commands are executed
    pub fn is_strict(&self) -> bool {
        self.production && !self.dry_run
    }
}

// Default value functions
fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./containers")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_runtime_binary() -> String {
    "podman".to_string()
}

fn default_port_range_start() -> u16 {
    10000
}

fn default_port_range_end() -> u16 {
    20000
}

fn default_lock_timeout() -> u64 {
    600
}

fn default_log_tail_lines() -> usize {
    100
}

fn default_map_path() -> PathBuf {
    PathBuf::from("./nginx-proxy/proxy_map.conf")
}

fn default_reload_command() -> Vec<String> {
    ["sudo", "systemctl", "reload", "nginx"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file named by `SITEFORGE_CONFIG` (or `siteforge.toml`
    /// when it exists), then apply environment overrides
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("SITEFORGE_CONFIG") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path, e))?;
                toml::from_str(&content)?
            }
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                toml::from_str(&std::fs::read_to_string(DEFAULT_CONFIG_FILE)?)?
            }
            Err(_) => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.store.database_url = Some(url);
        }
        if let Some(dir) = lookup("CONTAINER_DIR") {
            self.paths.workspace_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SITEFORGE_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SITEFORGE_UPLOAD_DIR") {
            self.paths.upload_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("SITEFORGE_PROXY_MAP") {
            self.proxy.map_path = PathBuf::from(path);
        }
        if let Some(command) = lookup("SITEFORGE_RELOAD_COMMAND") {
            self.proxy.reload_command = shell_words::split(&command)
                .map_err(|e| anyhow::anyhow!("SITEFORGE_RELOAD_COMMAND: {}", e))?;
        }
        if let Some(binary) = lookup("SITEFORGE_RUNTIME") {
            self.runtime.binary = binary;
        }
        if let Some(mode) = lookup("GENERATOR_MODE") {
            self.execution.production = mode.trim().eq_ignore_ascii_case("production");
        }
        if let Some(flag) = lookup("DRY_RUN") {
            self.execution.dry_run = is_truthy(&flag);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.runtime.binary.trim().is_empty() {
            errors.push("runtime.binary must not be empty".to_string());
        }
        if self.runtime.port_range_start == 0 {
            errors.push("runtime.port_range_start must be greater than 0".to_string());
        }
        if self.runtime.port_range_start >= self.runtime.port_range_end {
            errors.push(format!(
                "runtime.port_range_start ({}) must be below port_range_end ({})",
                self.runtime.port_range_start, self.runtime.port_range_end
            ));
        }
        if self.runtime.log_tail_lines == 0 {
            errors.push("runtime.log_tail_lines must be greater than 0".to_string());
        }
        if self.store.connect_timeout_ms == 0 {
            errors.push("store.connect_timeout_ms must be greater than 0".to_string());
        }
        if self.proxy.reload_command.is_empty() {
            errors.push("proxy.reload_command must name a program".to_string());
        }
        if self.paths.data_dir.as_os_str().is_empty() {
            errors.push("paths.data_dir must not be empty".to_string());
        }
        if self.paths.workspace_dir.as_os_str().is_empty() {
            errors.push("paths.workspace_dir must not be empty".to_string());
        }
        if self.paths.upload_dir.as_os_str().is_empty() {
            errors.push("paths.upload_dir must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Workspace directory for one site
    pub fn workspace_for(&self, slug: &str) -> PathBuf {
        self.paths.workspace_dir.join(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[paths]
workspace_dir = "/srv/sites"

[store]
database_url = "postgres://siteforge@db/sites"
connect_timeout_ms = 500

[runtime]
binary = "docker"
port_range_start = 30000
port_range_end = 30100

[proxy]
reload_command = ["nginx", "-s", "reload"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.paths.workspace_dir, PathBuf::from("/srv/sites"));
        assert_eq!(config.paths.data_dir, PathBuf::from("./data"));
        assert_eq!(config.store.connect_timeout(), Duration::from_millis(500));
        assert_eq!(config.runtime.binary, "docker");
        assert_eq!(config.runtime.lock_timeout_secs, 600);
        assert_eq!(config.proxy.reload_command, vec!["nginx", "-s", "reload"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.binary, "podman");
        assert_eq!(config.runtime.port_range_start, 10000);
        assert_eq!(config.runtime.port_range_end, 20000);
        assert_eq!(config.store.connect_timeout_ms, 2000);
        assert_eq!(
            config.proxy.reload_command,
            vec!["sudo", "systemctl", "reload", "nginx"]
        );
        assert!(!config.execution.is_strict());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite:/tmp/sites.db"),
            ("CONTAINER_DIR", "/srv/containers"),
            ("SITEFORGE_UPLOAD_DIR", "/srv/uploads"),
            ("SITEFORGE_RELOAD_COMMAND", "sudo '/usr/sbin/nginx' -s reload"),
            ("GENERATOR_MODE", "production"),
            ("DRY_RUN", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.database_url.as_deref(), Some("sqlite:/tmp/sites.db"));
        assert_eq!(config.workspace_for("demo"), PathBuf::from("/srv/containers/demo"));
        assert_eq!(config.paths.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(
            config.proxy.reload_command,
            vec!["sudo", "/usr/sbin/nginx", "-s", "reload"]
        );
        assert!(config.execution.is_strict());
    }

    #[test]
    fn test_dry_run_wins_over_production() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "GENERATOR_MODE" => Some("production".to_string()),
                "DRY_RUN" => Some("1".to_string()),
                _ => None,
            })
            .unwrap();
        assert!(config.execution.production);
        assert!(!config.execution.is_strict());
    }

    #[test]
    fn test_bad_reload_command_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|key| {
            (key == "SITEFORGE_RELOAD_COMMAND").then(|| "nginx 'unterminated".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.runtime.binary = String::new();
        config.runtime.port_range_start = 20000;
        config.runtime.port_range_end = 10000;
        config.proxy.reload_command.clear();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("runtime.binary"));
        assert!(err.contains("port_range_start"));
        assert!(err.contains("reload_command"));
    }
}
