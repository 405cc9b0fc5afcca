use crate::identity::IdentityResolver;
use crate::permissions::{parse_mode, PermissionPolicy};
use crate::OdmonError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
    pub services: ServicesConfig,
    pub permissions: PermissionsConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    pub refresh_interval_sec: u64,
    pub inspect_interval_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServicesConfig {
    pub odoo: OdooServiceConfig,
    pub postgres: PostgresServiceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OdooServiceConfig {
    pub service_name: String,
    pub config_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresServiceConfig {
    pub service_name: String,
    /// Cluster units such as `postgresql@14-main`.
    pub instances: Vec<String>,
    pub auto_detect: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionsConfig {
    pub owner: String,
    pub group: String,
    pub dir_mode: String,
    pub file_mode: String,
    pub max_reported_files: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Prefix privileged commands with `sudo -n` when not already root.
    pub use_sudo: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// Empty means stderr.
    pub file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            monitoring: MonitoringConfig::default(),
            services: ServicesConfig::default(),
            permissions: PermissionsConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8008,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_interval_sec: 5,
            inspect_interval_sec: 60,
        }
    }
}

impl Default for OdooServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "odoo".to_string(),
            config_file: "/etc/odoo/odoo.conf".to_string(),
        }
    }
}

impl Default for PostgresServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "postgresql".to_string(),
            instances: Vec::new(),
            auto_detect: true,
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            owner: "odoo".to_string(),
            group: "odoo".to_string(),
            dir_mode: "755".to_string(),
            file_mode: "644".to_string(),
            max_reported_files: crate::permissions::DEFAULT_MAX_REPORTED_FILES,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { use_sudo: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

impl PermissionsConfig {
    pub fn policy(&self) -> Result<PermissionPolicy, OdmonError> {
        let dir_mode = parse_mode(&self.dir_mode)
            .map_err(|err| OdmonError::Config(format!("permissions.dir_mode {err}")))?;
        let file_mode = parse_mode(&self.file_mode)
            .map_err(|err| OdmonError::Config(format!("permissions.file_mode {err}")))?;
        Ok(PermissionPolicy {
            owner: self.owner.trim().to_string(),
            group: self.group.trim().to_string(),
            dir_mode,
            file_mode,
            max_reported_files: self.max_reported_files,
        })
    }
}

impl Config {
    pub fn odoo_config_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.services.odoo.config_file))
    }

    /// `sudo -n` is only worth trying when configured and not already root.
    pub fn elevate_with_sudo(&self) -> bool {
        self.control.use_sudo && !nix::unistd::geteuid().is_root()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Policy identity problems. Never fatal: inspection reports the consequences.
    pub fn policy_warnings(&self, identity: &dyn IdentityResolver) -> Vec<String> {
        match self.permissions.policy() {
            Ok(policy) => policy.policy_warnings(identity),
            Err(err) => vec![err.to_string()],
        }
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, OdmonError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(OdmonError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, OdmonError> {
    let content = fs::read_to_string(path).map_err(|err| {
        OdmonError::Config(format!("failed to read {}: {err}", path.display()))
    })?;
    read_config_from_str(&content)
}

/// Missing config file means built-in defaults; an invalid one is still an error.
pub fn load_config_or_default(path: &Path) -> Result<Config, OdmonError> {
    if path.exists() {
        read_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file absent, using defaults");
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), OdmonError> {
    if cfg.server.host.trim().is_empty() {
        return Err(OdmonError::Config("server.host must be non-empty".to_string()));
    }
    if cfg.server.port == 0 {
        return Err(OdmonError::Config(
            "server.port must be greater than 0".to_string(),
        ));
    }
    if cfg.monitoring.refresh_interval_sec == 0 {
        return Err(OdmonError::Config(
            "monitoring.refresh_interval_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.monitoring.inspect_interval_sec == 0 {
        return Err(OdmonError::Config(
            "monitoring.inspect_interval_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.services.odoo.service_name.trim().is_empty() {
        return Err(OdmonError::Config(
            "services.odoo.service_name must be non-empty".to_string(),
        ));
    }
    if cfg.services.odoo.config_file.trim().is_empty() {
        return Err(OdmonError::Config(
            "services.odoo.config_file must be non-empty".to_string(),
        ));
    }
    if cfg.services.postgres.service_name.trim().is_empty() {
        return Err(OdmonError::Config(
            "services.postgres.service_name must be non-empty".to_string(),
        ));
    }
    for instance in &cfg.services.postgres.instances {
        if !instance.starts_with("postgresql@") || instance.len() == "postgresql@".len() {
            return Err(OdmonError::Config(format!(
                "services.postgres.instances entry '{instance}' must look like postgresql@<cluster>"
            )));
        }
    }
    if cfg.permissions.owner.trim().is_empty() {
        return Err(OdmonError::Config(
            "permissions.owner must be non-empty".to_string(),
        ));
    }
    if cfg.permissions.group.trim().is_empty() {
        return Err(OdmonError::Config(
            "permissions.group must be non-empty".to_string(),
        ));
    }
    if cfg.permissions.max_reported_files == 0 {
        return Err(OdmonError::Config(
            "permissions.max_reported_files must be at least 1".to_string(),
        ));
    }
    let _ = cfg.permissions.policy()?;
    if !cfg.logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(cfg.logging.level.trim()).is_err()
    {
        return Err(OdmonError::Config(format!(
            "logging.level '{}' is not a valid filter",
            cfg.logging.level
        )));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("ODMON_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("odmon")
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ODMON_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join("config.yaml")
}

pub fn config_dir_from_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(default_config_dir, PathBuf::from)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddonPaths {
    pub config_file: String,
    pub paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// `addons_path` from the `[options]` section, or `None` when the key is absent.
pub fn parse_addons_path(content: &str) -> Option<Vec<PathBuf>> {
    let mut in_options = false;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_options = line[1..line.len() - 1].trim().eq_ignore_ascii_case("options");
            continue;
        }
        if !in_options {
            continue;
        }
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        if key.trim() != "addons_path" {
            continue;
        }
        return Some(
            value
                .split(',')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(|segment| PathBuf::from(expand_path(segment)))
                .collect(),
        );
    }
    None
}

pub fn read_addon_paths(cfg: &Config) -> Result<AddonPaths, OdmonError> {
    let config_file = cfg.odoo_config_path();
    let content = fs::read_to_string(&config_file).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            OdmonError::NotFound(format!(
                "odoo config file not found: {}",
                config_file.display()
            ))
        } else {
            OdmonError::Config(format!(
                "failed to read odoo config {}: {err}",
                config_file.display()
            ))
        }
    })?;
    let config_text = config_file.to_string_lossy().to_string();
    match parse_addons_path(&content) {
        Some(paths) => Ok(AddonPaths {
            config_file: config_text,
            paths,
            warning: None,
        }),
        None => {
            tracing::warn!(config_file = %config_text, "addons_path not set in [options]");
            Ok(AddonPaths {
                warning: Some(format!("addons_path not found in [options] of {config_text}")),
                config_file: config_text,
                paths: Vec::new(),
            })
        }
    }
}
