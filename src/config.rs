use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::BusResult;

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Default bind address for both sockets
    #[serde(default = "default_host")]
    pub host: String,

    /// Overrides `host` for the command socket
    #[serde(default)]
    pub commander_host: Option<String>,

    #[serde(default = "default_commander_port")]
    pub commander_port: u16,

    /// Overrides `host` for the notification socket
    #[serde(default)]
    pub notifier_host: Option<String>,

    #[serde(default = "default_notifier_port")]
    pub notifier_port: u16,

    /// Connection timeout towards hordes, 0 disables it
    #[serde(default)]
    pub timeout_ms: u64,

    #[serde(default)]
    pub no_tls: bool,

    /// Use unix sockets named after this id instead of TCP
    #[serde(default)]
    pub unix_socket_id: Option<String>,

    #[serde(default = "default_accept_incoming")]
    pub accept_incoming: bool,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Known tribes; tribe-aware routing is enabled when non-empty
    #[serde(default)]
    pub tribes: Vec<String>,

    /// Own tribe, `None` is the default partition
    #[serde(default)]
    pub tribe: Option<String>,

    /// Never forward commands to hordes
    #[serde(default)]
    pub passive: bool,

    #[serde(default)]
    pub hordes: Vec<HordeConfig>,

    /// Module locations loaded at boot
    #[serde(default)]
    pub modules: Vec<ModulePathConfig>,

    /// The one module name allowed to span several files
    #[serde(default)]
    pub shared_module: Option<String>,

    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

/// A peer bus reachable from this one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HordeConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub commander_port: u16,
    pub notifier_port: u16,
    #[serde(default)]
    pub tribe: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePathConfig {
    pub path: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub hot: bool,
}

/// Resolved addresses persisted on boot for operators and tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub host: String,
    pub commander_port: u16,
    pub notifier_port: u16,
    pub unix_socket_id: Option<String>,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    #[serde(rename = "noTLS")]
    pub no_tls: bool,
    pub timeout: u64,
}

pub const RUN_RECORD_FILE: &str = "bus.run.json";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_commander_port() -> u16 {
    35400
}

fn default_notifier_port() -> u16 {
    35800
}

fn default_accept_incoming() -> bool {
    true
}

fn default_pattern() -> String {
    r".*".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("var/run")
}

fn default_heartbeat_ms() -> u64 {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            commander_host: None,
            commander_port: default_commander_port(),
            notifier_host: None,
            notifier_port: default_notifier_port(),
            timeout_ms: 0,
            no_tls: false,
            unix_socket_id: None,
            accept_incoming: true,
            key_path: None,
            cert_path: None,
            tribes: Vec::new(),
            tribe: None,
            passive: false,
            hordes: Vec::new(),
            modules: Vec::new(),
            shared_module: None,
            run_dir: default_run_dir(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl BusConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BusResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BusConfig = toml::from_str(&content)?;
        info!(
            host = %config.host,
            commander_port = config.commander_port,
            notifier_port = config.notifier_port,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn commander_host(&self) -> &str {
        self.commander_host.as_deref().unwrap_or(&self.host)
    }

    pub fn notifier_host(&self) -> &str {
        self.notifier_host.as_deref().unwrap_or(&self.host)
    }

    /// Tribe-aware routing is on as soon as tribes are declared.
    pub fn tribes_enabled(&self) -> bool {
        !self.tribes.is_empty()
    }

    pub fn tls_requested(&self) -> bool {
        !self.no_tls && (self.key_path.is_some() || self.cert_path.is_some())
    }
}

impl RunRecord {
    /// Write the record as a flat JSON object under `run_dir`.
    pub fn save(&self, run_dir: &Path) -> BusResult<PathBuf> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join(RUN_RECORD_FILE);
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, data)?;
        info!(path = %path.display(), "run record saved");
        Ok(path)
    }

    pub fn load(run_dir: &Path) -> BusResult<Self> {
        let data = std::fs::read_to_string(run_dir.join(RUN_RECORD_FILE))?;
        Ok(serde_json::from_str(&data)?)
    }
}
