use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::domain::DeploymentMode;
use crate::error::FleetError;

fn xdg_config_home() -> PathBuf {
    env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
}

pub fn default_config_path() -> PathBuf {
    xdg_config_home().join("flotilla/config.toml")
}

/// Settings for one invocation. Built once in `main`, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub fleet_root: PathBuf,
    pub template_dir: PathBuf,
    pub deployment_mode: DeploymentMode,
    pub config_file_name: String,
    pub app_service: String,
    pub proxy_service: String,
    pub db_service: String,
    pub mail_service: String,
    pub default_image: Option<String>,
    pub default_tag: Option<String>,
    pub default_repository: String,
    pub image_repository: Option<String>,
    pub mail_relay: Option<String>,
    pub port_floor: u16,
    pub port_ceiling: u16,
    pub port_attempts: u32,
    pub probe_connect_timeout: Duration,
    pub probe_http_timeout: Duration,
    pub version_path: String,
    pub version_field: String,
    pub proxy_config: PathBuf,
    pub proxy_backup: PathBuf,
    pub proxy_reload_command: Vec<String>,
    pub proxy_backend_host: String,
    pub cert_tool: String,
    pub public_addresses: Vec<IpAddr>,
    pub command_timeout: Duration,
    pub ready_timeout: Duration,
    pub db_user: String,
    pub clone_databases: Vec<String>,
    pub secret_length: usize,
}

impl FleetConfig {
    /// Defaults for everything except the deployment mode, which has none.
    pub fn with_mode(deployment_mode: DeploymentMode) -> Self {
        let proxy_config = PathBuf::from("/etc/nginx/stream.d/flotilla.conf");
        Self {
            fleet_root: PathBuf::from("/srv/flotilla"),
            template_dir: PathBuf::from("/srv/flotilla-template"),
            deployment_mode,
            config_file_name: "docker-compose.yml".to_string(),
            app_service: "app".to_string(),
            proxy_service: "proxy".to_string(),
            db_service: "db".to_string(),
            mail_service: "smtp".to_string(),
            default_image: None,
            default_tag: None,
            default_repository: "registry.example.org/fleet".to_string(),
            image_repository: None,
            mail_relay: None,
            port_floor: 61000,
            port_ceiling: 65535,
            port_attempts: 64,
            probe_connect_timeout: Duration::from_millis(250),
            probe_http_timeout: Duration::from_millis(100),
            version_path: "/web/version".to_string(),
            version_field: "server_version".to_string(),
            proxy_backup: backup_path_for(&proxy_config),
            proxy_config,
            proxy_reload_command: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            proxy_backend_host: "127.0.0.1".to_string(),
            cert_tool: "certwant".to_string(),
            public_addresses: Vec::new(),
            command_timeout: Duration::from_secs(600),
            ready_timeout: Duration::from_secs(120),
            db_user: "app".to_string(),
            clone_databases: vec!["app".to_string()],
            secret_length: 32,
        }
    }

    /// Layer order: defaults, TOML file, `FLOTILLA_*` environment, then the
    /// command-line mode override.
    pub fn load(
        config_path: Option<&Path>,
        mode_override: Option<DeploymentMode>,
    ) -> anyhow::Result<Self> {
        let file = match config_path {
            Some(path) => ConfigFile::load_required(path)?,
            None => ConfigFile::load_optional(&default_config_path())?,
        };
        Self::from_layers(file, mode_override)
    }

    fn from_layers(
        file: ConfigFile,
        mode_override: Option<DeploymentMode>,
    ) -> anyhow::Result<Self> {
        let mode = match mode_override {
            Some(mode) => Some(mode),
            None => match env::var("FLOTILLA_DEPLOYMENT_MODE") {
                Ok(raw) => Some(raw.parse::<DeploymentMode>().map_err(FleetError::Configuration)?),
                Err(_) => match file.deployment_mode.as_deref() {
                    Some(raw) => Some(raw.parse::<DeploymentMode>().map_err(FleetError::Configuration)?),
                    None => None,
                },
            },
        };
        let Some(mode) = mode else {
            return Err(FleetError::configuration(
                "deployment mode is not set (use --mode, FLOTILLA_DEPLOYMENT_MODE or deployment_mode in config.toml)",
            )
            .into());
        };

        let mut cfg = Self::with_mode(mode);

        // Layer 2: TOML config file
        if let Some(ref v) = file.fleet_root {
            cfg.fleet_root = expand_tilde(v);
        }
        if let Some(ref v) = file.template_dir {
            cfg.template_dir = expand_tilde(v);
        }
        if let Some(ref v) = file.config_file_name {
            cfg.config_file_name = v.clone();
        }
        if let Some(ref v) = file.app_service {
            cfg.app_service = v.clone();
        }
        if let Some(ref v) = file.proxy_service {
            cfg.proxy_service = v.clone();
        }
        if let Some(ref v) = file.db_service {
            cfg.db_service = v.clone();
        }
        if let Some(ref v) = file.mail_service {
            cfg.mail_service = v.clone();
        }
        if file.default_image.is_some() {
            cfg.default_image = file.default_image.clone();
        }
        if file.default_tag.is_some() {
            cfg.default_tag = file.default_tag.clone();
        }
        if let Some(ref v) = file.default_repository {
            cfg.default_repository = v.trim_end_matches('/').to_string();
        }
        if let Some(ref v) = file.image_repository {
            cfg.image_repository = Some(v.trim_end_matches('/').to_string());
        }
        if file.mail_relay.is_some() {
            cfg.mail_relay = file.mail_relay.clone();
        }
        if let Some(v) = file.port_floor {
            cfg.port_floor = v;
        }
        if let Some(v) = file.port_ceiling {
            cfg.port_ceiling = v;
        }
        if let Some(v) = file.port_attempts {
            cfg.port_attempts = v;
        }
        if let Some(v) = file.probe_connect_timeout_ms {
            cfg.probe_connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.probe_http_timeout_ms {
            cfg.probe_http_timeout = Duration::from_millis(v);
        }
        if let Some(ref v) = file.version_path {
            cfg.version_path = v.clone();
        }
        if let Some(ref v) = file.version_field {
            cfg.version_field = v.clone();
        }
        if let Some(ref v) = file.proxy_config {
            cfg.proxy_config = expand_tilde(v);
            cfg.proxy_backup = backup_path_for(&cfg.proxy_config);
        }
        if let Some(ref v) = file.proxy_backup {
            cfg.proxy_backup = expand_tilde(v);
        }
        if let Some(ref v) = file.proxy_reload_command {
            cfg.proxy_reload_command = v.clone();
        }
        if let Some(ref v) = file.proxy_backend_host {
            cfg.proxy_backend_host = v.clone();
        }
        if let Some(ref v) = file.cert_tool {
            cfg.cert_tool = v.clone();
        }
        if let Some(ref v) = file.public_addresses {
            cfg.public_addresses = v
                .iter()
                .map(|raw| {
                    raw.parse::<IpAddr>()
                        .with_context(|| format!("invalid public_addresses entry in config.toml: {raw}"))
                })
                .collect::<anyhow::Result<_>>()?;
        }
        if let Some(v) = file.command_timeout_secs {
            cfg.command_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.ready_timeout_secs {
            cfg.ready_timeout = Duration::from_secs(v);
        }
        if let Some(ref v) = file.db_user {
            cfg.db_user = v.clone();
        }
        if let Some(ref v) = file.clone_databases {
            cfg.clone_databases = v.clone();
        }
        if let Some(v) = file.secret_length {
            cfg.secret_length = v;
        }

        // Layer 3: environment variables
        if let Ok(path) = env::var("FLOTILLA_FLEET_ROOT") {
            cfg.fleet_root = PathBuf::from(path);
        }
        if let Ok(path) = env::var("FLOTILLA_TEMPLATE_DIR") {
            cfg.template_dir = PathBuf::from(path);
        }
        if let Ok(v) = env::var("FLOTILLA_IMAGE_REPOSITORY") {
            cfg.image_repository = Some(v.trim_end_matches('/').to_string());
        }
        if let Ok(v) = env::var("FLOTILLA_MAIL_RELAY") {
            cfg.mail_relay = Some(v);
        }
        if let Ok(path) = env::var("FLOTILLA_PROXY_CONFIG") {
            cfg.proxy_config = PathBuf::from(path);
            if file.proxy_backup.is_none() {
                cfg.proxy_backup = backup_path_for(&cfg.proxy_config);
            }
        }
        if let Ok(v) = env::var("FLOTILLA_CERT_TOOL") {
            cfg.cert_tool = v;
        }
        if let Ok(raw) = env::var("FLOTILLA_COMMAND_TIMEOUT_SECS") {
            cfg.command_timeout = Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("invalid FLOTILLA_COMMAND_TIMEOUT_SECS: {raw}"))?,
            );
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.port_floor >= self.port_ceiling {
            return Err(FleetError::configuration(format!(
                "port_floor ({}) must be below port_ceiling ({})",
                self.port_floor, self.port_ceiling
            ))
            .into());
        }
        if self.proxy_reload_command.is_empty() {
            return Err(FleetError::configuration("proxy_reload_command must not be empty").into());
        }
        if self.secret_length == 0 {
            return Err(FleetError::configuration("secret_length must be > 0").into());
        }
        Ok(())
    }

    /// `(default namespace, custom namespace)` when images are pulled from a
    /// non-default repository.
    pub fn repository_rewrite(&self) -> Option<(String, String)> {
        self.image_repository
            .as_ref()
            .filter(|custom| **custom != self.default_repository)
            .map(|custom| (self.default_repository.clone(), custom.clone()))
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".flotilla.bak");
    path.with_file_name(name)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    fleet_root: Option<String>,
    template_dir: Option<String>,
    deployment_mode: Option<String>,
    config_file_name: Option<String>,
    app_service: Option<String>,
    proxy_service: Option<String>,
    db_service: Option<String>,
    mail_service: Option<String>,
    default_image: Option<String>,
    default_tag: Option<String>,
    default_repository: Option<String>,
    image_repository: Option<String>,
    mail_relay: Option<String>,
    port_floor: Option<u16>,
    port_ceiling: Option<u16>,
    port_attempts: Option<u32>,
    probe_connect_timeout_ms: Option<u64>,
    probe_http_timeout_ms: Option<u64>,
    version_path: Option<String>,
    version_field: Option<String>,
    proxy_config: Option<String>,
    proxy_backup: Option<String>,
    proxy_reload_command: Option<Vec<String>>,
    proxy_backend_host: Option<String>,
    cert_tool: Option<String>,
    public_addresses: Option<Vec<String>>,
    command_timeout_secs: Option<u64>,
    ready_timeout_secs: Option<u64>,
    db_user: Option<String>,
    clone_databases: Option<Vec<String>>,
    secret_length: Option<usize>,
}

impl ConfigFile {
    fn parse(raw: &str, path: &Path) -> anyhow::Result<Self> {
        toml::from_str(raw).map_err(|e| {
            FleetError::configuration(format!("failed to parse {}: {e}", path.display())).into()
        })
    }

    fn load_required(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FleetError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw, path)
    }

    fn load_optional(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw, path),
            Err(_) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}
