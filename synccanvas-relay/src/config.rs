//! Relay configuration from the environment.
//!
//! Every [`RelayConfig`] field can be set through a `SYNCCANVAS_RELAY_`
//! prefixed variable, e.g. `SYNCCANVAS_RELAY_BIND_ADDR=0.0.0.0:9090`.
//! Unset fields keep their defaults.

use synccanvas_collab::RelayConfig;

pub const ENV_PREFIX: &str = "SYNCCANVAS_RELAY_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
}

/// Load variables from `relay.env` if present, otherwise from `.env`.
pub fn load_env_file() {
    if std::path::Path::new("relay.env").exists() {
        dotenvy::from_filename("relay.env").ok();
    } else {
        dotenvy::dotenv().ok();
    }
}

/// Read the relay configuration from the process environment.
pub fn load() -> Result<RelayConfig, ConfigError> {
    from_iter(std::env::vars())
}

fn from_iter<I>(vars: I) -> Result<RelayConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
}
