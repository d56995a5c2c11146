//! # ec2info
//!
//! Cached discovery of EC2 instance identity and peer addresses.
//!
//! The crate answers two questions for a running process: "what am I?" (region,
//! instance metadata, tags of the local instance) and "who else is out there?"
//! (addresses of other running instances carrying a given tag). Every lookup
//! degrades to a default value when the process is not running on EC2, so the
//! functions can safely be used while rendering templates on any host.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ec2info::funcs::AwsFuncs;
//! use ec2info::logging;
//!
//! #[tokio::main]
//! async fn main() {
//!     logging::setup_tracing();
//!
//!     let aws = AwsFuncs::shared();
//!     println!("region: {}", aws.ec2_region(None).await);
//!     println!("env: {}", aws.ec2_tag("env", Some("dev")).await);
//!     println!("peers: {:?}", aws.discover_addrs_by_ec2_tag("role", "web", None).await);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`aws`] - Metadata service access, SDK session, instance descriptions and tag lookups
//! - [`funcs`] - Named function namespace handed to the template engine
//! - [`logging`] - Tracing setup
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `AWS_TIMEOUT` | Timeout of metadata and API calls in milliseconds (must be an integer) | `500` |
//! | `AWS_REGION` / `AWS_DEFAULT_REGION` | If present, the region is not taken from instance metadata | (unset) |
//! | `AWS_EC2_METADATA_DISABLED` | `true` skips the instance metadata service entirely | `false` |
//! | `APP_NAME` | Application identifier used in log output | `EC2INFO` |
//! | `RUST_LOG` | Console log filter (e.g., `info`, `ec2info=debug`) | `info` |

use std::env;
use std::sync::LazyLock;

/// EC2 lookups: metadata, session, instance descriptions and tags.
pub mod aws;

/// Function namespace exposed to the template engine.
pub mod funcs;

/// Logging and tracing infrastructure.
pub mod logging;

/// Application name from `APP_NAME` environment variable.
///
/// Prefixed to every log line. Defaults to `"EC2INFO"` if not set.
pub static APP_NAME: LazyLock<String> =
    LazyLock::new(|| env::var("APP_NAME").unwrap_or("EC2INFO".to_string()));
