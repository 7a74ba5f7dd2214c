use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::RelayConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
}

/// Resolves a session token issued elsewhere into the user it belongs to.
pub trait SessionAuthority: Send + Sync {
    fn session_user(&self, token: &str) -> Option<SessionUser>;
}

/// Fixed token table from configuration.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl SessionAuthority for StaticTokens {
    fn session_user(&self, token: &str) -> Option<SessionUser> {
        self.tokens
            .get(token)
            .map(|id| SessionUser { id: id.clone() })
    }
}

/// Development mode: the token *is* the user id.
#[derive(Debug, Default)]
pub struct BypassAuthority;

impl SessionAuthority for BypassAuthority {
    fn session_user(&self, token: &str) -> Option<SessionUser> {
        let token = token.trim();
        (!token.is_empty()).then(|| SessionUser {
            id: token.to_string(),
        })
    }
}

pub fn authority_from_config(cfg: &RelayConfig) -> Arc<dyn SessionAuthority> {
    if cfg.auth_bypass {
        warn!("auth bypass enabled; bearer tokens are trusted as user ids");
        return Arc::new(BypassAuthority);
    }
    let tokens = cfg.token_map();
    if tokens.is_empty() {
        warn!("no auth tokens configured; user-scoped streams will reject every request");
    }
    Arc::new(StaticTokens::new(tokens))
}
