//! Configuration for the relay orchestration core.
//!
//! Config files: `relay.toml`, `relay.yaml`, `relay.yml` or `relay.json`,
//! searched in `./` then in the user config directory.
//!
//! Supports `${ENV_VAR}` substitution in all string values. API keys are
//! deliberately absent from the schema; callers pass them per request.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, load_config},
    schema::{AgentConfig, ProviderEntry, ProvidersConfig, RelayConfig},
};
