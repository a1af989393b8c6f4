use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use chirp_conduit::ConduitOptions;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 8080
//
//   env var:         CHIRP_SERVER__PORT=8080   (double underscore = nesting)
//
//   (single underscore stays within field names: CHIRP_CONDUIT__REPLAY_INTERVAL_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub conduit: ConduitFileConfig,
    #[serde(default)]
    pub feed: FeedFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory served for every path that is not an API route.
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_dir: None,
        }
    }
}

/// Broadcast tunables (lives under `[conduit]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConduitFileConfig {
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
}

impl Default for ConduitFileConfig {
    fn default() -> Self {
        Self {
            replay_interval_ms: default_replay_interval_ms(),
        }
    }
}

/// Message store settings (lives under `[feed]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedFileConfig {
    #[serde(default = "default_feed_enabled")]
    pub enabled: bool,
    /// Defaults to `chirp.db` in the data directory.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl Default for FeedFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_feed_enabled(),
            database: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_replay_interval_ms() -> u64 {
    100
}
fn default_feed_enabled() -> bool {
    true
}

/// Build a figment that layers: defaults → config.toml → CHIRP_* env vars.
///
/// `config_file` replaces `<data_dir>/config.toml` when given.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHIRP_SERVER__PORT=8080`  →  `server.port = 8080`
///   `CHIRP_FEED__ENABLED=false`  →  `feed.enabled = false`
pub fn load_config(data_dir: &Path, config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join("config.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("CHIRP_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig + CLI overrides)
// =============================================================================

/// Server configuration for runtime behavior.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub public_dir: Option<PathBuf>,
    pub conduit: ConduitOptions,
    /// Where the message store lives; `None` keeps history in memory only.
    pub feed_db: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig, dirs: &ChirpConfig) -> Result<Self> {
        let ip: IpAddr = fc
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid listen host: {}", fc.server.host))?;
        let bind_addr = SocketAddr::new(ip, fc.server.port);

        Ok(Self {
            bind_addr,
            public_dir: fc.server.public_dir.clone(),
            conduit: ConduitOptions {
                replay_interval: Duration::from_millis(fc.conduit.replay_interval_ms),
            },
            feed_db: if fc.feed.enabled {
                Some(
                    fc.feed
                        .database
                        .clone()
                        .unwrap_or_else(|| dirs.db_path.clone()),
                )
            } else {
                None
            },
        })
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChirpConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl ChirpConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chirp"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("chirp.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }
}
