//! Daemon configuration.
//!
//! Layered from built-in defaults, a TOML file and `WEBSPACED__*`
//! environment variables (e.g. `WEBSPACED__LXD__SOCKET`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::webspace::{ManagerConfig, WebspaceConfig};

pub const APP_NAME: &str = "webspaced";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub lxd: LxdConfig,
    pub webspaces: WebspacesConfig,
    pub logging: LoggingConfig,
}

/// Control socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path of the control socket.
    pub socket: String,
    /// Permissions applied to the socket. Access control is done on peer credentials.
    pub socket_mode: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: "/run/webspaced/server.sock".to_string(),
            socket_mode: 0o666,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LxdConfig {
    /// LXD daemon socket.
    pub socket: String,
    /// Prepended to `u<uid>` to name instances.
    pub instance_prefix: String,
    /// Profiles applied to new instances.
    pub profiles: Vec<String>,
    /// Managed network that must exist at startup.
    pub network: String,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            socket: "/var/lib/lxd/unix.socket".to_string(),
            instance_prefix: "ws-".to_string(),
            profiles: vec!["default".to_string()],
            network: "lxdbr0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebspacesConfig {
    /// Primary domains are `<username>.<domain>`.
    pub domain: String,
    /// Members may act for any user.
    pub admin_group: String,
    /// Settings for newly created webspaces.
    pub config_defaults: WebspaceConfig,
    pub ports: PortsConfig,
}

impl Default for WebspacesConfig {
    fn default() -> Self {
        Self {
            domain: "webspace.localhost".to_string(),
            admin_group: "webspace-admin".to_string(),
            config_defaults: WebspaceConfig::default(),
            ports: PortsConfig::default(),
        }
    }
}

/// External port forwarding limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the external range (inclusive).
    pub start: u16,
    /// Last port of the external range (inclusive).
    pub end: u16,
    /// Maximum forwarded ports per webspace.
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 49152,
            end: 65535,
            max: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let ports = &self.webspaces.ports;
        if ports.start == 0 || ports.start > ports.end {
            bail!(
                "invalid port range {}-{}: start must be non-zero and not after end",
                ports.start,
                ports.end
            );
        }
        if self.lxd.instance_prefix.is_empty() {
            bail!("lxd.instance_prefix cannot be empty");
        }
        self.webspaces
            .config_defaults
            .validate()
            .context("invalid webspaces.config_defaults")?;
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            instance_prefix: self.lxd.instance_prefix.clone(),
            profiles: self.lxd.profiles.clone(),
            domain: self.webspaces.domain.clone(),
            config_defaults: self.webspaces.config_defaults.clone(),
            ports: self.webspaces.ports,
        }
    }
}

/// Load the config at `path`, writing a default one first if it doesn't exist.
pub fn load_or_init(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        write_default(path)?;
    }
    load(path)
}

pub fn load(path: &Path) -> Result<AppConfig> {
    let defaults = AppConfig::default();
    let built = Config::builder()
        .set_default("server.socket", defaults.server.socket)?
        .set_default("lxd.socket", defaults.lxd.socket)?
        .set_default("logging.level", defaults.logging.level)?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    config.server.socket = expand_str_path(&config.server.socket)?
        .display()
        .to_string();
    config.lxd.socket = expand_str_path(&config.lxd.socket)?.display().to_string();
    if let Some(ref file) = config.logging.file {
        config.logging.file = Some(expand_str_path(file)?.display().to_string());
    }

    config.validate()?;
    Ok(config)
}

pub fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve the config file path, honouring an explicit override.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path),
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_or_init_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init(&path).unwrap();
        assert!(path.exists());
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for webspaced"));

        assert_eq!(config.server.socket, "/run/webspaced/server.sock");
        assert_eq!(config.server.socket_mode, 0o666);
        assert_eq!(config.lxd.instance_prefix, "ws-");
        assert_eq!(config.webspaces.ports, PortsConfig::default());
        assert_eq!(config.webspaces.config_defaults.http_port, 80);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[lxd]
instance_prefix = "test-"
network = "br1"

[webspaces]
domain = "ng.example.org"

[webspaces.ports]
start = 10000
end = 10010
max = 2
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.lxd.instance_prefix, "test-");
        assert_eq!(config.lxd.network, "br1");
        // Untouched keys keep their defaults.
        assert_eq!(config.lxd.profiles, vec!["default"]);
        assert_eq!(config.webspaces.domain, "ng.example.org");
        assert_eq!(
            config.webspaces.ports,
            PortsConfig {
                start: 10000,
                end: 10010,
                max: 2
            }
        );
        assert_eq!(config.webspaces.config_defaults, WebspaceConfig::default());

        let manager = config.manager_config();
        assert_eq!(manager.instance_prefix, "test-");
        assert_eq!(manager.ports.max, 2);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[webspaces.ports]\nstart = 20000\nend = 10000\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid port range"));
    }

    #[test]
    fn test_config_file_path_directory_override() {
        let dir = TempDir::new().unwrap();
        let path = config_file_path(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(path, dir.path().join("config.toml"));
    }
}
