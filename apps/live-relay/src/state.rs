use std::sync::Arc;

use crate::auth::{BypassAuthority, SessionAuthority};
use crate::config::RegistrySettings;
use crate::fanout::Fanout;
use crate::registry::Registry;
use crate::store::{EntityStore, MemoryStore};

/// Shared router state. Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn EntityStore>,
    pub auth: Arc<dyn SessionAuthority>,
    pub fanout: Fanout,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn EntityStore>,
        auth: Arc<dyn SessionAuthority>,
    ) -> Self {
        let fanout = Fanout::new(Arc::clone(&registry));
        Self {
            registry,
            store,
            auth,
            fanout,
        }
    }

    /// In-memory store, default settings, bearer token taken as the user id.
    pub fn in_memory() -> Self {
        Self::with_settings(RegistrySettings::default())
    }

    /// Like [`AppState::in_memory`] with explicit registry settings.
    pub fn with_settings(settings: RegistrySettings) -> Self {
        Self::new(
            Arc::new(Registry::new(settings)),
            Arc::new(MemoryStore::new()),
            Arc::new(BypassAuthority),
        )
    }
}
