use std::collections::HashMap;
use std::time::Duration;

use live_proto::Scope;
use serde::Deserialize;
use tracing::warn;

/// Room for the opening burst (established, initial state, status, role) plus a few events.
const MIN_CHANNEL_CAPACITY: usize = 8;

/// Process configuration, read from `LIVE_RELAY__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Treat every bearer token as the user id. Local development only.
    #[serde(default)]
    pub auth_bypass: bool,
    /// `token=user_id` pairs separated by commas.
    #[serde(default)]
    pub auth_tokens: Option<String>,
    #[serde(default = "default_game_heartbeat")]
    pub game_heartbeat_secs: u64,
    #[serde(default = "default_user_heartbeat")]
    pub notifications_heartbeat_secs: u64,
    #[serde(default = "default_user_heartbeat")]
    pub messages_heartbeat_secs: u64,
    #[serde(default = "default_active_stale_after")]
    pub active_stale_after_ms: u64,
    #[serde(default = "default_prune_after")]
    pub prune_after_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub notifications_single_client: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            auth_bypass: false,
            auth_tokens: None,
            game_heartbeat_secs: default_game_heartbeat(),
            notifications_heartbeat_secs: default_user_heartbeat(),
            messages_heartbeat_secs: default_user_heartbeat(),
            active_stale_after_ms: default_active_stale_after(),
            prune_after_secs: default_prune_after(),
            cleanup_interval_secs: default_cleanup_interval(),
            channel_capacity: default_channel_capacity(),
            notifications_single_client: false,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("LIVE_RELAY").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<RelayConfig>())
            .map(RelayConfig::normalize)
            .unwrap_or_else(|err| {
                warn!(error = %err, "invalid relay configuration, falling back to defaults");
                RelayConfig::default().normalize()
            })
    }

    pub fn normalize(mut self) -> Self {
        self.auth_tokens = self.auth_tokens.take().and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self.game_heartbeat_secs = self.game_heartbeat_secs.max(1);
        self.notifications_heartbeat_secs = self.notifications_heartbeat_secs.max(1);
        self.messages_heartbeat_secs = self.messages_heartbeat_secs.max(1);
        self.cleanup_interval_secs = self.cleanup_interval_secs.max(1);
        self.channel_capacity = self.channel_capacity.max(MIN_CHANNEL_CAPACITY);

        // A single late heartbeat must never get a live stream pruned.
        let floor = 2 * self
            .game_heartbeat_secs
            .max(self.notifications_heartbeat_secs)
            .max(self.messages_heartbeat_secs);
        if self.prune_after_secs < floor {
            warn!(
                configured = self.prune_after_secs,
                floor, "prune_after_secs below two heartbeat intervals, raising"
            );
            self.prune_after_secs = floor;
        }
        self
    }

    /// Parses `auth_tokens` into `token -> user_id`. Malformed pairs are skipped.
    pub fn token_map(&self) -> HashMap<String, String> {
        let Some(raw) = self.auth_tokens.as_deref() else {
            return HashMap::new();
        };
        raw.split(',')
            .filter_map(|pair| {
                let (token, user) = pair.split_once('=')?;
                let (token, user) = (token.trim(), user.trim());
                if token.is_empty() || user.is_empty() {
                    warn!(entry = pair, "ignoring malformed auth token entry");
                    return None;
                }
                Some((token.to_string(), user.to_string()))
            })
            .collect()
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            game: ScopePolicy {
                single_active_tab: true,
                enforce_single_client: false,
                heartbeat_interval: Duration::from_secs(self.game_heartbeat_secs),
            },
            notifications: ScopePolicy {
                single_active_tab: false,
                enforce_single_client: self.notifications_single_client,
                heartbeat_interval: Duration::from_secs(self.notifications_heartbeat_secs),
            },
            messages: ScopePolicy {
                single_active_tab: false,
                enforce_single_client: false,
                heartbeat_interval: Duration::from_secs(self.messages_heartbeat_secs),
            },
            active_stale_after: Duration::from_millis(self.active_stale_after_ms),
            prune_after: Duration::from_secs(self.prune_after_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// How connections of one scope are arbitrated and kept alive.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    /// Only one tab per entity may mutate; the rest are passive.
    pub single_active_tab: bool,
    /// A new connection closes every other connection of the entity.
    pub enforce_single_client: bool,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub game: ScopePolicy,
    pub notifications: ScopePolicy,
    pub messages: ScopePolicy,
    /// Age of the active tab's last heartbeat after which another tab may take over.
    pub active_stale_after: Duration,
    /// Age after which a silent connection is pruned by the sweep.
    pub prune_after: Duration,
    pub cleanup_interval: Duration,
    /// Per-connection buffer; a full buffer counts as a failed write.
    pub channel_capacity: usize,
}

impl RegistrySettings {
    pub fn policy(&self, scope: Scope) -> &ScopePolicy {
        match scope {
            Scope::Game => &self.game,
            Scope::Notifications => &self.notifications,
            Scope::Messages => &self.messages,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RelayConfig::default().normalize().registry_settings()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_game_heartbeat() -> u64 {
    15
}

fn default_user_heartbeat() -> u64 {
    30
}

fn default_active_stale_after() -> u64 {
    5_000
}

fn default_prune_after() -> u64 {
    75
}

fn default_cleanup_interval() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    64
}
