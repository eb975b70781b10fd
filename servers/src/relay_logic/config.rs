use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_relay::{BackoffPolicy, DrainGapPolicy, RelaySettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "relay_controller.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[command(about = "Event relay controller: buffers app events and replays them to rate-limited providers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "RELAY_LISTEN_ADDR", help = "Address the app ingress listens on.")]
    pub listen_addr: Option<SocketAddr>,

    #[arg(long, env = "RELAY_INGRESS_PATH", help = "HTTP path upgraded to the app WebSocket.")]
    pub ingress_path: Option<String>,

    #[arg(long, env = "RELAY_PRIMARY_URL", help = "WebSocket URL of the primary provider.")]
    pub primary_url: Option<String>,

    #[arg(long, env = "RELAY_BACKUP_URL", help = "WebSocket URL of the backup provider.")]
    pub backup_url: Option<String>,

    #[arg(long, env = "RELAY_RATE_MAX", help = "Sends granted per rate interval, shared by both providers.")]
    pub rate_max: Option<u32>,

    #[arg(long, env = "RELAY_RATE_INTERVAL_SECS", help = "Seconds between token bucket refills.")]
    pub rate_interval_secs: Option<u64>,

    #[arg(long, env = "RELAY_BACKOFF_SECS", help = "Seconds a rate-limited worker sleeps in fixed backoff mode.")]
    pub backoff_secs: Option<u64>,

    #[arg(long, env = "RELAY_BACKOFF_MODE", help = "Backoff after a denied send (fixed, until-refill).")]
    pub backoff_mode: Option<String>,

    #[arg(long, env = "RELAY_DRAIN_GAP", help = "Handling of frames arriving at the end of a drain (preserve, close).")]
    pub drain_gap: Option<String>,

    #[arg(long, env = "RELAY_LIVE_CAPACITY", help = "Frames queued per pass-through worker before ingest waits for it.")]
    pub live_capacity: Option<usize>,

    #[arg(long, env = "RELAY_LOG_DIR", help = "Directory for log files. Logs only to stdout when unset.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub ingress_path: String,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub settings: RelaySettings,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            listen_addr: other.listen_addr.or(self.listen_addr),
            ingress_path: other.ingress_path.or(self.ingress_path),
            primary_url: other.primary_url.or(self.primary_url),
            backup_url: other.backup_url.or(self.backup_url),
            rate_max: other.rate_max.or(self.rate_max),
            rate_interval_secs: other.rate_interval_secs.or(self.rate_interval_secs),
            backoff_secs: other.backoff_secs.or(self.backoff_secs),
            backoff_mode: other.backoff_mode.or(self.backoff_mode),
            drain_gap: other.drain_gap.or(self.drain_gap),
            live_capacity: other.live_capacity.or(self.live_capacity),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn defaults() -> Config {
        let settings = RelaySettings::default();
        Config {
            listen_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            ingress_path: Some("/app/ws".to_string()),
            primary_url: Some(settings.primary_url),
            backup_url: Some(settings.backup_url),
            rate_max: Some(settings.rate_max),
            rate_interval_secs: Some(settings.rate_interval.as_secs()),
            backoff_secs: Some(60),
            backoff_mode: Some("fixed".to_string()),
            drain_gap: Some("preserve".to_string()),
            live_capacity: Some(settings.live_capacity),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    fn resolve(self) -> Result<RelayConfig> {
        let defaults = Config::defaults();
        let merged = defaults.merge(self);

        let backoff_secs = merged.backoff_secs.unwrap_or(60);
        let backoff = match merged.backoff_mode.as_deref().unwrap_or("fixed") {
            "fixed" => BackoffPolicy::Fixed(Duration::from_secs(backoff_secs)),
            "until-refill" => BackoffPolicy::UntilRefill,
            other => bail!("unknown backoff mode '{}', expected 'fixed' or 'until-refill'", other),
        };
        let drain_gap: DrainGapPolicy = merged
            .drain_gap
            .as_deref()
            .unwrap_or("preserve")
            .parse()?;

        let ingress_path = merged.ingress_path.unwrap_or_else(|| "/app/ws".to_string());
        if !ingress_path.starts_with('/') {
            bail!("ingress path '{}' must start with '/'", ingress_path);
        }

        let fallback = RelaySettings::default();
        let settings = RelaySettings {
            primary_url: merged.primary_url.unwrap_or(fallback.primary_url),
            backup_url: merged.backup_url.unwrap_or(fallback.backup_url),
            rate_max: merged.rate_max.unwrap_or(fallback.rate_max),
            rate_interval: merged
                .rate_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(fallback.rate_interval),
            backoff,
            drain_gap,
            live_capacity: merged.live_capacity.unwrap_or(fallback.live_capacity),
        };
        settings.validate()?;

        Ok(RelayConfig {
            listen_addr: merged
                .listen_addr
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            ingress_path,
            log_dir: merged.log_dir,
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            settings,
        })
    }
}

fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return Ok(None);
    }

    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(Some(file_config))
}

/// Layers defaults, the JSON config file and CLI/env arguments, in that order.
pub fn build_config(cli: Config) -> Result<RelayConfig> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let layered = match read_config_file(&config_file_path)? {
        Some(file_config) => file_config.merge(cli),
        None => cli,
    };
    layered.resolve()
}

pub fn load_config() -> Result<RelayConfig> {
    // clap::Parser picks up both env vars and CLI args.
    build_config(Config::parse())
}
