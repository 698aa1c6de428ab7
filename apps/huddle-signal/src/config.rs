use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// What happens to the admin role when the admin leaves a non-empty room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdminSuccession {
    /// Nobody is promoted; the room stays without an admin.
    #[default]
    None,
    /// The earliest remaining joiner becomes admin.
    Oldest,
}

impl FromStr for AdminSuccession {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(AdminSuccession::None),
            "oldest" | "first" => Ok(AdminSuccession::Oldest),
            other => Err(format!("unknown admin succession policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    /// Connections silent for longer than this are evicted.
    pub heartbeat_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Unused `POST /api/create-room` reservations expire after this.
    pub reservation_ttl_secs: u64,
    pub admin_succession: AdminSuccession,
    /// `{name}` is replaced with the URL-encoded display name.
    pub avatar_template: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let admin_succession = match lookup("HUDDLE_ADMIN_SUCCESSION") {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(error = %err, "falling back to default admin succession");
                defaults.admin_succession
            }),
            None => defaults.admin_succession,
        };
        // A zero timeout would evict every connection on each sweep.
        let positive = |key: &str| parse_setting::<u64>(&lookup, key).filter(|secs| *secs > 0);

        Self {
            bind_host: lookup("HUDDLE_BIND").unwrap_or(defaults.bind_host),
            port: parse_setting(&lookup, "HUDDLE_PORT").unwrap_or(defaults.port),
            heartbeat_timeout_secs: positive("HUDDLE_HEARTBEAT_TIMEOUT_SECS")
                .unwrap_or(defaults.heartbeat_timeout_secs),
            maintenance_interval_secs: positive("HUDDLE_MAINTENANCE_INTERVAL_SECS")
                .unwrap_or(defaults.maintenance_interval_secs),
            reservation_ttl_secs: parse_setting(&lookup, "HUDDLE_RESERVATION_TTL_SECS")
                .unwrap_or(defaults.reservation_ttl_secs),
            admin_succession,
            avatar_template: lookup("HUDDLE_AVATAR_TEMPLATE")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.avatar_template),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn avatar_url_for(&self, display_name: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(display_name.as_bytes()).collect();
        self.avatar_template.replace("{name}", &encoded)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 3001,
            heartbeat_timeout_secs: 600,
            maintenance_interval_secs: 60,
            reservation_ttl_secs: 3600,
            admin_succession: AdminSuccession::None,
            avatar_template: "https://api.dicebear.com/7.x/avataaars/svg?seed={name}".to_string(),
        }
    }
}

fn parse_setting<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
