use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::alist::{AlistConfig, DEFAULT_ALIST_API_URL, DEFAULT_SIGN_TIMEOUT};
use crate::auth::{DEFAULT_SESSION_TTL, MAX_SESSION_TTL};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mlwio-env";
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/mlwio/catalog.db";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
const MAX_ALIST_TIMEOUT_SECS: u64 = 300;

/// Raw values as found in the env file and the process environment. Later
/// sources overwrite earlier ones key by key.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub alist_api_url: Option<String>,
    pub alist_token: Option<String>,
    pub alist_host_markers: Option<Vec<String>>,
    pub alist_timeout_secs: Option<u64>,
    pub session_ttl_secs: Option<u64>,
    pub cookie_secure: Option<bool>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

impl EnvConfig {
    /// Applies one `KEY=VALUE` pair; unknown keys are ignored. `source` only
    /// shows up in error messages.
    pub fn apply(&mut self, key: &str, value: &str, source: &str) -> Result<()> {
        let value = value.trim().trim_matches('"');
        let non_empty = || (!value.is_empty()).then(|| value.to_string());
        match key {
            "DATABASE_PATH" => self.database_path = non_empty().map(PathBuf::from),
            "HOST" => {
                if let Some(host) = non_empty() {
                    self.host = Some(host);
                }
            }
            "PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing PORT from {source}"))?;
                self.port = Some(port);
            }
            "ALIST_API_URL" => {
                if let Some(url) = non_empty() {
                    self.alist_api_url = Some(url);
                }
            }
            "ALIST_TOKEN" => self.alist_token = non_empty(),
            "ALIST_HOST_MARKERS" => {
                let markers: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|marker| !marker.is_empty())
                    .map(str::to_owned)
                    .collect();
                self.alist_host_markers = (!markers.is_empty()).then_some(markers);
            }
            "ALIST_TIMEOUT_SECS" => {
                self.alist_timeout_secs =
                    Some(parse_secs(key, value, source, MAX_ALIST_TIMEOUT_SECS)?);
            }
            "SESSION_TTL_SECS" => {
                self.session_ttl_secs =
                    Some(parse_secs(key, value, source, MAX_SESSION_TTL.as_secs())?);
            }
            "COOKIE_SECURE" => {
                self.cookie_secure = Some(
                    parse_bool(value)
                        .ok_or_else(|| anyhow!("Parsing COOKIE_SECURE from {source}: {value:?}"))?,
                );
            }
            "ADMIN_USERNAME" => self.admin_username = non_empty(),
            "ADMIN_PASSWORD" => self.admin_password = non_empty(),
            _ => {}
        }
        Ok(())
    }
}

/// Whole seconds in `1..=max`.
fn parse_secs(key: &str, value: &str, source: &str, max: u64) -> Result<u64> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("Parsing {key} from {source}"))?;
    if !(1..=max).contains(&secs) {
        bail!("{key} from {source} must be between 1 and {max} seconds, got {secs}");
    }
    Ok(secs)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub alist: AlistConfig,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
    /// Created at startup when both are set and the user does not exist yet.
    pub admin: Option<(String, String)>,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    apply_env_file(&mut cfg, &content, &path.display().to_string())?;
    Ok(Some(cfg))
}

fn apply_env_file(cfg: &mut EnvConfig, content: &str, source: &str) -> Result<()> {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value)) = trimmed.split_once('=') {
            cfg.apply(key.trim(), value, source)?;
        }
    }
    Ok(())
}

/// Reads the env file at `path` (a missing file is fine) and overlays `vars`,
/// normally the process environment.
pub fn load_server_config_from<I>(path: impl AsRef<Path>, vars: I) -> Result<ServerConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    for (key, value) in vars {
        cfg.apply(&key, &value, "environment")?;
    }
    Ok(finish(cfg))
}

fn finish(cfg: EnvConfig) -> ServerConfig {
    let api_url = cfg
        .alist_api_url
        .unwrap_or_else(|| DEFAULT_ALIST_API_URL.to_string());
    let mut alist = AlistConfig::new(api_url, cfg.alist_token).with_timeout(
        cfg.alist_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SIGN_TIMEOUT),
    );
    if let Some(markers) = cfg.alist_host_markers {
        alist = alist.with_host_markers(markers);
    }

    ServerConfig {
        database_path: cfg
            .database_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        alist,
        session_ttl: cfg
            .session_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TTL),
        cookie_secure: cfg.cookie_secure.unwrap_or(false),
        admin: cfg.admin_username.zip(cfg.admin_password),
    }
}
