//! Client options shared by every metadata and API call.
//!
//! The options are read once per process from the environment. A malformed
//! `AWS_TIMEOUT` is a deployment error and terminates the process on first
//! access.

use anyhow::Context;
use std::env;
use std::sync::LazyLock;
use std::time::Duration;

const ENV_AWS_TIMEOUT: &str = "AWS_TIMEOUT";

/// Timeout applied when `AWS_TIMEOUT` is unset or zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

static CLIENT_OPTIONS: LazyLock<ClientOptions> = LazyLock::new(|| match ClientOptions::from_env() {
    Ok(options) => options,
    Err(err) => {
        tracing::error!("Cannot start with an invalid configuration: {:#}", err);
        std::process::exit(1);
    }
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn from_env() -> anyhow::Result<ClientOptions> {
        Self::parse(env::var(ENV_AWS_TIMEOUT).ok().as_deref())
    }

    /// Parses a timeout given in milliseconds. An empty value counts as unset.
    pub fn parse(timeout: Option<&str>) -> anyhow::Result<ClientOptions> {
        match timeout.filter(|value| !value.is_empty()) {
            None => Ok(ClientOptions::default()),
            Some(value) => {
                let millis = value.parse::<u64>().with_context(|| {
                    format!(
                        "Invalid {} value '{}' - must be an integer",
                        ENV_AWS_TIMEOUT, value
                    )
                })?;

                Ok(ClientOptions {
                    timeout: Some(Duration::from_millis(millis)),
                })
            }
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Returns the process-wide options, reading the environment on first use.
pub fn client_options() -> ClientOptions {
    *CLIENT_OPTIONS
}
