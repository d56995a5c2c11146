//! The process-wide AWS SDK configuration used by all API clients.

use crate::aws::meta::{Ec2Meta, UNKNOWN_REGION};
use crate::aws::options::client_options;
use aws_config::environment::region::EnvironmentVariableRegionProvider;
use aws_config::meta::region::RegionProviderChain;
use aws_config::profile::region::ProfileFileRegionProvider;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::env;
use std::sync::Arc;
use tokio::sync::OnceCell;

const ENV_REGION: &str = "AWS_REGION";
const ENV_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";

static SESSION: OnceCell<SdkConfig> = OnceCell::const_new();

/// How the session obtains its region.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RegionSource {
    /// The region reported by instance metadata, set explicitly.
    Metadata(String),
    /// The SDK's default provider chain, honoring an explicit override.
    SdkDefault,
    /// Environment and profile only. The metadata service has already been
    /// asked once and is not contacted again.
    WithoutMetadata,
}

/// Returns the shared SDK configuration, building it on first use.
///
/// Concurrent first callers wait for a single construction, which probes the
/// instance metadata service for the region once.
pub async fn sdk_session() -> &'static SdkConfig {
    SESSION
        .get_or_init(|| build_session(Ec2Meta::shared()))
        .await
}

async fn build_session(meta: Arc<Ec2Meta>) -> SdkConfig {
    tracing::info!("Setting up AWS session....");
    let timeout = client_options().effective_timeout();

    let loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(
        TimeoutConfig::builder()
            .connect_timeout(timeout)
            .operation_attempt_timeout(timeout)
            .build(),
    );

    let loader = match region_source(&meta, |name| env::var_os(name).is_some()).await {
        RegionSource::Metadata(region) => {
            tracing::info!("Using region '{}' as reported by instance metadata", region);
            loader.region(Region::new(region))
        }
        RegionSource::SdkDefault => loader,
        RegionSource::WithoutMetadata => loader.region(
            RegionProviderChain::first_try(EnvironmentVariableRegionProvider::new())
                .or_else(ProfileFileRegionProvider::new()),
        ),
    };

    loader.load().await
}

/// Probes the metadata service for the region and decides where the session
/// takes its region from.
///
/// The mere presence of `AWS_REGION` or `AWS_DEFAULT_REGION` leaves region
/// resolution to the SDK. Once the host is known to run outside of EC2, the
/// SDK chain is replaced by one that skips the metadata service.
async fn region_source(meta: &Ec2Meta, is_present: impl Fn(&str) -> bool) -> RegionSource {
    let metadata_region = meta.region(None).await;
    let overridden = is_present(ENV_REGION) || is_present(ENV_DEFAULT_REGION);

    if overridden && !meta.is_non_cloud() {
        RegionSource::SdkDefault
    } else if !overridden && metadata_region != UNKNOWN_REGION {
        RegionSource::Metadata(metadata_region)
    } else {
        RegionSource::WithoutMetadata
    }
}
