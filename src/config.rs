//! Configuration for hazardflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (HAZARDFLOW_CONFIG, HAZARDFLOW_<NAME>_URL)
//! 2. Config file (.hazardflow/config.yaml)
//! 3. Defaults (the standard service set on localhost)
//!
//! Config file discovery:
//! - Searches current directory and parents for .hazardflow/config.yaml
//! - `workflows_dir` is relative to the directory holding .hazardflow/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{ClientSettings, EngineSettings, HealthSettings};
use crate::domain::ServiceEndpoint;

/// Overrides the config file location
pub const CONFIG_ENV: &str = "HAZARDFLOW_CONFIG";

const CONFIG_DIR: &str = ".hazardflow";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Backend services by name; replaces the default set when present
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Extra workflow definitions (YAML or JSON)
    #[serde(default)]
    pub workflows_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Full base URL; takes precedence over host/port
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Path of the liveness probe (default: /health)
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub error_threshold: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServiceConfig {
    /// Service on localhost at `port`
    pub fn local(port: u16) -> Self {
        Self {
            url: None,
            host: None,
            port: Some(port),
            health_path: None,
            timeout_seconds: None,
            error_threshold: None,
            enabled: true,
        }
    }

    pub fn base_url(&self, name: &str) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let port = self
            .port
            .with_context(|| format!("Service '{}' needs either 'url' or 'port'", name))?;
        let host = self.host.as_deref().unwrap_or("localhost");
        Ok(format!("http://{}:{}", host, port))
    }

    /// Build the registry endpoint for this service
    pub fn endpoint(&self, name: &str) -> Result<ServiceEndpoint> {
        let mut endpoint = ServiceEndpoint::new(name, self.base_url(name)?);

        if let Some(path) = &self.health_path {
            let health_url = format!(
                "{}/{}",
                endpoint.base_url,
                path.trim_start_matches('/')
            );
            endpoint = endpoint.with_health_url(health_url);
        }
        if let Some(secs) = self.timeout_seconds {
            endpoint = endpoint.with_timeout(Duration::from_secs(secs));
        }
        if let Some(threshold) = self.error_threshold {
            endpoint = endpoint.with_error_threshold(threshold);
        }

        Ok(endpoint)
    }
}

/// The standard deployment: model services on 8001-8008 plus the
/// publishing sink on 8080
pub fn default_services() -> BTreeMap<String, ServiceConfig> {
    [
        ("climada", 8001),
        ("lisflood", 8002),
        ("pangu_weather", 8003),
        ("nfdrs4", 8004),
        ("cell2fire", 8005),
        ("aurora", 8006),
        ("postgis", 8007),
        ("filesystem", 8008),
        ("geoserver", 8080),
    ]
    .into_iter()
    .map(|(name, port)| (name.to_string(), ServiceConfig::local(port)))
    .collect()
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub services: BTreeMap<String, ServiceConfig>,
    pub health: HealthSettings,
    pub client: ClientSettings,
    pub engine: EngineSettings,
    /// Absolute or config-relative workflows directory
    pub workflows_dir: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Endpoints for every enabled service, ordered by name
    pub fn endpoints(&self) -> Result<Vec<ServiceEndpoint>> {
        self.services
            .iter()
            .filter(|(_, svc)| svc.enabled)
            .map(|(name, svc)| svc.endpoint(name))
            .collect()
    }
}

/// Environment variable overriding one service's URL
pub fn service_url_env(name: &str) -> String {
    format!("HAZARDFLOW_{}_URL", name.to_ascii_uppercase())
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge a parsed file with defaults and environment overrides
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let mut services = if file.services.is_empty() {
        default_services()
    } else {
        file.services
    };

    for (name, svc) in services.iter_mut() {
        if let Some(url) = env(&service_url_env(name)) {
            svc.url = Some(url);
        }
    }

    // Relative to the project root (parent of .hazardflow/)
    let workflows_dir = file.workflows_dir.map(|dir| {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return path;
        }
        let base = config_file
            .as_deref()
            .and_then(Path::parent)
            .and_then(Path::parent)
            .unwrap_or(Path::new("."));
        base.join(path)
    });

    ResolvedConfig {
        services,
        health: file.health,
        client: file.client,
        engine: file.engine,
        workflows_dir,
        config_file,
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();

    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, |key| std::env::var(key).ok()))
}
