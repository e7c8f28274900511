//! Configuration for the reverb broker.
//!
//! Configuration is assembled in three layers, later layers winning:
//! 1. a config file (`reverb.{toml,yaml,yml,json}`, project-local or under
//!    `~/.config/reverb/`), with `${ENV_VAR}` placeholders substituted,
//! 2. `REVERB_*` environment variable overrides,
//! 3. CLI flags (applied by the binary).

pub mod env;
pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    env::apply_env_overrides,
    loader::{discover_and_load, load_config},
    schema::{AppConfig, AppsConfig, ReverbConfig, ScalingConfig, ServerConfig},
};
