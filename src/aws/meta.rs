//! Access to the EC2 instance metadata service (IMDS).
//!
//! Values are cached per path for the lifetime of an [`Ec2Meta`]. The first
//! transport failure marks the fetcher as running outside of EC2, after which
//! every lookup returns its default without touching the network.

use crate::aws::options::{ClientOptions, client_options};
use async_trait::async_trait;
use aws_config::imds;
use aws_config::imds::client::error::ImdsError;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

/// Region reported when no determination is possible.
pub const UNKNOWN_REGION: &str = "unknown";

const ENV_METADATA_DISABLED: &str = "AWS_EC2_METADATA_DISABLED";
const META_DATA_PATH: &str = "/latest/meta-data/";
const DYNAMIC_PATH: &str = "/latest/dynamic/";
const IDENTITY_DOCUMENT: &str = "instance-identity/document";

static SHARED: LazyLock<Arc<Ec2Meta>> = LazyLock::new(|| Arc::new(Ec2Meta::new(client_options())));

/// Outcome of a single metadata lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    /// The service answered, but has no value for the path.
    Absent,
    /// The service could not be reached at all.
    Unreachable,
}

/// Fetches raw values from a metadata endpoint.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn lookup(&self, path: &str) -> Lookup;
}

/// [`MetadataSource`] backed by the IMDS client of the AWS SDK.
pub struct ImdsSource {
    client: imds::Client,
}

impl ImdsSource {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            client: Self::builder(options).build(),
        }
    }

    /// Talks to the metadata service at `endpoint`, e.g. `http://127.0.0.1:1338`.
    pub fn with_endpoint(options: ClientOptions, endpoint: &str) -> anyhow::Result<Self> {
        let client = Self::builder(options)
            .endpoint(endpoint)
            .map_err(|err| anyhow::anyhow!("Invalid metadata endpoint '{}': {}", endpoint, err))?
            .build();

        Ok(Self { client })
    }

    fn builder(options: ClientOptions) -> imds::client::Builder {
        let timeout = options.effective_timeout();
        imds::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .max_attempts(1)
    }
}

#[async_trait]
impl MetadataSource for ImdsSource {
    async fn lookup(&self, path: &str) -> Lookup {
        match self.client.get(path).await {
            Ok(value) => Lookup::Found(value.into()),
            Err(ImdsError::ErrorResponse(_)) => {
                tracing::debug!("No instance metadata available for '{}'", path);
                Lookup::Absent
            }
            Err(err) => {
                tracing::debug!("Failed to fetch instance metadata '{}': {}", path, err);
                Lookup::Unreachable
            }
        }
    }
}

#[derive(Deserialize)]
struct InstanceIdentityDocument {
    region: Option<String>,
}

pub struct Ec2Meta {
    source: Arc<dyn MetadataSource>,
    cache: RwLock<HashMap<String, String>>,
    non_cloud: AtomicBool,
}

impl Ec2Meta {
    /// Creates a fetcher talking to the real metadata service.
    ///
    /// Honors `AWS_EC2_METADATA_DISABLED`, in which case the fetcher starts out
    /// in the non-cloud state and never performs any I/O.
    pub fn new(options: ClientOptions) -> Self {
        Self::configured(
            Arc::new(ImdsSource::new(options)),
            env::var(ENV_METADATA_DISABLED).ok().as_deref(),
        )
    }

    /// Creates a fetcher for `source` which starts out in the non-cloud state
    /// if `disabled_flag` (the value of `AWS_EC2_METADATA_DISABLED`) is `true`.
    pub fn configured(source: Arc<dyn MetadataSource>, disabled_flag: Option<&str>) -> Self {
        let meta = Self::with_source(source);
        if is_disabled(disabled_flag) {
            tracing::info!("Instance metadata is disabled via {}", ENV_METADATA_DISABLED);
            meta.non_cloud.store(true, Ordering::Relaxed);
        }

        meta
    }

    pub fn with_source(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            non_cloud: AtomicBool::new(false),
        }
    }

    /// A fetcher which already knows that it runs outside of EC2.
    pub fn non_cloud(source: Arc<dyn MetadataSource>) -> Self {
        let meta = Self::with_source(source);
        meta.non_cloud.store(true, Ordering::Relaxed);
        meta
    }

    /// The process-wide fetcher, sharing its non-cloud determination with the
    /// SDK session and every default-constructed [`crate::aws::info::Ec2Info`].
    pub fn shared() -> Arc<Ec2Meta> {
        SHARED.clone()
    }

    pub fn is_non_cloud(&self) -> bool {
        self.non_cloud.load(Ordering::Relaxed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn meta(&self, key: &str, default: Option<&str>) -> String {
        self.retrieve(&format!("{}{}", META_DATA_PATH, key))
            .await
            .unwrap_or_else(|| default.unwrap_or_default().to_owned())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn dynamic(&self, key: &str, default: Option<&str>) -> String {
        self.retrieve(&format!("{}{}", DYNAMIC_PATH, key))
            .await
            .unwrap_or_else(|| default.unwrap_or_default().to_owned())
    }

    /// Reads the region from the instance identity document.
    ///
    /// Falls back to `default`, or to [`UNKNOWN_REGION`] if none is given.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn region(&self, default: Option<&str>) -> String {
        let fallback = default
            .filter(|region| !region.is_empty())
            .unwrap_or(UNKNOWN_REGION);

        self.retrieve(&format!("{}{}", DYNAMIC_PATH, IDENTITY_DOCUMENT))
            .await
            .and_then(|document| {
                serde_json::from_str::<InstanceIdentityDocument>(&document)
                    .inspect_err(|err| {
                        tracing::debug!("Cannot parse instance identity document: {}", err)
                    })
                    .ok()
            })
            .and_then(|document| document.region)
            .filter(|region| !region.is_empty())
            .unwrap_or_else(|| fallback.to_owned())
    }

    async fn retrieve(&self, path: &str) -> Option<String> {
        if let Some(value) = self.cache.read().await.get(path) {
            return Some(value.clone());
        }

        if self.is_non_cloud() {
            return None;
        }

        match self.source.lookup(path).await {
            Lookup::Found(value) => {
                let value = value.trim().to_owned();
                self.cache
                    .write()
                    .await
                    .insert(path.to_owned(), value.clone());

                Some(value)
            }
            Lookup::Absent => None,
            Lookup::Unreachable => {
                if !self.non_cloud.swap(true, Ordering::Relaxed) {
                    tracing::info!(
                        "Instance metadata service is unreachable. Assuming to run outside of EC2..."
                    );
                }

                None
            }
        }
    }
}

fn is_disabled(value: Option<&str>) -> bool {
    value
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
