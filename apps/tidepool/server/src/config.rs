use std::time::Duration;

use crate::origin::OriginPolicy;
use crate::transport::TransportKind;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_COOKIE: &str = "io";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Advertised to clients; they ping at this cadence.
    pub ping_interval: Duration,
    /// Grace added to `ping_interval` before a silent session is closed.
    pub ping_timeout: Duration,
    /// How long a WebSocket may take to finish the probe before the upgrade
    /// is abandoned.
    pub upgrade_timeout: Duration,
    /// How long a polling GET is held open with nothing to deliver.
    pub poll_timeout: Duration,
    /// Upper bound on a whole HTTP request, head plus declared body.
    pub max_package_size: usize,
    pub transports: Vec<TransportKind>,
    pub allow_upgrades: bool,
    pub origins: OriginPolicy,
    /// Cookie carrying the sid on handshake responses; `None` disables it.
    pub cookie: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
            allow_upgrades: true,
            origins: OriginPolicy::Any,
            cookie: Some(DEFAULT_COOKIE.to_string()),
        }
    }
}

impl EngineConfig {
    pub fn allows(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Silence tolerated on a session before it is considered dead.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }

    /// Transports a session on `current` may upgrade to.
    pub fn upgrades_for(&self, current: TransportKind) -> Vec<&'static str> {
        if self.allow_upgrades
            && current == TransportKind::Polling
            && self.allows(TransportKind::WebSocket)
        {
            vec![TransportKind::WebSocket.name()]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_sessions_advertise_websocket() {
        let config = EngineConfig::default();
        assert_eq!(config.upgrades_for(TransportKind::Polling), vec!["websocket"]);
        assert!(config.upgrades_for(TransportKind::WebSocket).is_empty());
        assert_eq!(config.heartbeat_deadline(), Duration::from_millis(85_000));
    }

    #[test]
    fn upgrades_follow_configuration() {
        let config = EngineConfig {
            allow_upgrades: false,
            ..EngineConfig::default()
        };
        assert!(config.upgrades_for(TransportKind::Polling).is_empty());

        let polling_only = EngineConfig {
            transports: vec![TransportKind::Polling],
            ..EngineConfig::default()
        };
        assert!(polling_only.upgrades_for(TransportKind::Polling).is_empty());
    }
}
