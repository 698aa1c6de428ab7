use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_SIGNAL_URL: &str = "ws://localhost:3001/ws";
pub const DEFAULT_ICE_SERVERS: [&str; 2] = ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    pub signal_url: String,
    pub ice_servers: Vec<String>,
    pub heartbeat_secs: u64,
}

impl MeshConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let signal_url = lookup("HUDDLE_SIGNAL_URL")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or(defaults.signal_url);
        // An explicitly empty list turns STUN off.
        let ice_servers = match lookup("HUDDLE_ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.ice_servers,
        };
        let heartbeat_secs = match lookup("HUDDLE_HEARTBEAT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    warn!(value = %raw, "ignoring invalid HUDDLE_HEARTBEAT_SECS");
                    defaults.heartbeat_secs
                }
            },
            None => defaults.heartbeat_secs,
        };
        Self {
            signal_url,
            ice_servers,
            heartbeat_secs,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signal_url: DEFAULT_SIGNAL_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            heartbeat_secs: 30,
        }
    }
}
