//! Live relay: multiplexes per-game and per-user SSE streams across browser tabs,
//! arbitrates the single active tab of a game and fans domain events out to every tab.

pub mod arbiter;
pub mod auth;
pub mod config;
pub mod fanout;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod state;
pub mod store;
pub mod stream;

pub use config::{RegistrySettings, RelayConfig, ScopePolicy};
pub use fanout::Fanout;
pub use registry::{ConnectOptions, Registration, Registry, RegistryError, SweepReport};
pub use routes::build_router;
pub use state::AppState;
pub use store::{EntityStore, MemoryStore, StoreError};
