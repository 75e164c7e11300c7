use clap::Parser;
use lib_common::configs::RoomConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Real-time chat room WebSocket server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CHAT_HOST", help = "Address to bind the listener to.")]
    pub host: Option<String>,

    #[clap(long, env = "CHAT_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "CHAT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CHAT_HISTORY_CAPACITY", help = "Number of messages kept for replay.")]
    pub history_capacity: Option<usize>,

    #[clap(long, env = "CHAT_REPLAY_LIMIT", help = "Messages replayed to a client when it joins (0 disables replay).")]
    pub replay_limit: Option<usize>,

    #[clap(long, env = "CHAT_HEARTBEAT_PERIOD_MS", help = "Interval in milliseconds between liveness probes.")]
    pub heartbeat_period_ms: Option<u64>,

    #[clap(long, env = "CHAT_PROBE_TIMEOUT_MS", help = "Milliseconds a client has to answer a probe.")]
    pub probe_timeout_ms: Option<u64>,

    #[clap(long, env = "CHAT_DELIVERY_TIMEOUT_MS", help = "Milliseconds allowed for one delivery to one client.")]
    pub delivery_timeout_ms: Option<u64>,

    #[clap(long, env = "CHAT_ANNOUNCE_PRESENCE", help = "Broadcast join and leave notices.")]
    pub announce_presence: Option<bool>,

    #[clap(long, env = "CHAT_BROADCAST_USER_LIST", help = "Send every client the user list after each join and leave.")]
    pub broadcast_user_list: Option<bool>,

    #[clap(long, env = "CHAT_ACCEPT_BACKLOG", help = "Upgraded connections that may wait for the room to accept them.")]
    pub accept_backlog: Option<usize>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            history_capacity: other.history_capacity.or(self.history_capacity),
            replay_limit: other.replay_limit.or(self.replay_limit),
            heartbeat_period_ms: other.heartbeat_period_ms.or(self.heartbeat_period_ms),
            probe_timeout_ms: other.probe_timeout_ms.or(self.probe_timeout_ms),
            delivery_timeout_ms: other.delivery_timeout_ms.or(self.delivery_timeout_ms),
            announce_presence: other.announce_presence.or(self.announce_presence),
            broadcast_user_list: other.broadcast_user_list.or(self.broadcast_user_list),
            accept_backlog: other.accept_backlog.or(self.accept_backlog),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        let room = RoomConfig::default();
        Config {
            host: Some("0.0.0.0".to_string()),
            port: Some(8765),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            history_capacity: Some(room.history_capacity),
            replay_limit: Some(room.replay_limit),
            heartbeat_period_ms: Some(room.heartbeat_period_ms),
            probe_timeout_ms: Some(room.probe_timeout_ms),
            delivery_timeout_ms: Some(room.delivery_timeout_ms),
            announce_presence: Some(room.announce_presence),
            broadcast_user_list: Some(true),
            accept_backlog: Some(128),
            ..Default::default()
        }
    }

    /// The engine settings carried by this config. Unset fields keep the
    /// engine defaults.
    pub fn room(&self) -> RoomConfig {
        let defaults = RoomConfig::default();
        let replay_limit = self.replay_limit.unwrap_or(defaults.replay_limit);
        RoomConfig {
            history_capacity: self.history_capacity.unwrap_or(defaults.history_capacity),
            heartbeat_period_ms: self.heartbeat_period_ms.unwrap_or(defaults.heartbeat_period_ms),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
            delivery_timeout_ms: self.delivery_timeout_ms.unwrap_or(defaults.delivery_timeout_ms),
            replay_on_join: replay_limit > 0,
            replay_limit,
            announce_presence: self.announce_presence.unwrap_or(defaults.announce_presence),
            broadcast_user_list: self.broadcast_user_list.unwrap_or(defaults.broadcast_user_list),
            ..defaults
        }
    }

    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(8765)
        )
    }
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

/// Layers the sources: defaults, then the JSON file (server_chat.conf unless
/// overridden), then environment variables and CLI arguments.
fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_chat.conf"));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config = current_config.merge(cli);

    // Default TLS paths if not already set. TLS is only used when both files exist.
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        } else {
            log::warn!("Could not determine home directory for default TLS paths.");
        }
    }

    current_config
}
