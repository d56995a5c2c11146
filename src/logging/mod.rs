//! Log setup for binaries that embed the lookup functions.
//!
//! Lookups never fail towards the template; they fall back to defaults and
//! report the reason here. Installing a subscriber is therefore the only way
//! to see why `aws.EC2Tag` rendered its default.
//!
//! # Usage
//!
//! ```rust,ignore
//! fn main() {
//!     ec2info::logging::setup_tracing();
//!     // ... render templates
//! }
//! ```
//!
//! Libraries and tests that may run after another subscriber was installed
//! use [`try_setup_tracing`] instead.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RUST_LOG` | Event filter, e.g. `ec2info=debug` to see every fallback | `info` |
//! | `APP_NAME` | Name printed after the level on each line | `EC2INFO` |
//!
//! # Output
//!
//! One plain text line per event, with the enclosing spans appended:
//! ```text
//! WARN  EC2INFO ec2info::aws::info: Unable to describe instances (tag{name="role"})
//! ```

use anyhow::Context;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

mod format;

const DEFAULT_FILTER: &str = "info";

/// Installs the console subscriber.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn setup_tracing() {
    Registry::default().with(console_layer(env_filter())).init();
    tracing::info!("Tracing initialized [filter from RUST_LOG, default '{DEFAULT_FILTER}']");
}

/// Like [`setup_tracing`], but reports an already installed subscriber as an
/// error and leaves it in place.
pub fn try_setup_tracing() -> anyhow::Result<()> {
    Registry::default()
        .with(console_layer(env_filter()))
        .try_init()
        .context("A global tracing subscriber is already installed")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn console_layer<S>(filter: EnvFilter) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(format::LookupLogFormat)
        .with_filter(filter)
}
