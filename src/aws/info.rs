//! Tag lookups for the local instance and tag based discovery of peers.
//!
//! The description of the local instance is fetched at most once per
//! [`Ec2Info`] and reused for every subsequent tag lookup. Tag values are
//! therefore a snapshot taken on first access. Peer discovery is never cached,
//! as its filter changes from call to call.

use crate::aws::describer::{
    DescribeQuery, DescribeResult, Ec2Describer, Instance, InstanceDescriber,
};
use crate::aws::meta::Ec2Meta;
use crate::aws::session::sdk_session;
use anyhow::{Context, bail};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// The kind of address collected by [`Ec2Info::addresses_by_tag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    PrivateV4,
    PublicV4,
    PublicV6,
}

impl AddressKind {
    pub const DEFAULT_NAME: &'static str = "private_v4";

    pub fn parse(name: &str) -> Option<AddressKind> {
        match name {
            "private_v4" => Some(AddressKind::PrivateV4),
            "public_v4" => Some(AddressKind::PublicV4),
            "public_v6" => Some(AddressKind::PublicV6),
            _ => None,
        }
    }

    fn addresses<'a>(&self, instance: &'a Instance) -> Vec<&'a str> {
        match self {
            AddressKind::PublicV6 => instance
                .network_interfaces
                .iter()
                .flat_map(|interface| interface.ipv6_addresses.iter().map(String::as_str))
                .collect(),
            AddressKind::PublicV4 => instance.public_ip_address.as_deref().into_iter().collect(),
            // Legacy (EC2 Classic) instances may lack a private address.
            AddressKind::PrivateV4 => instance.private_ip_address.as_deref().into_iter().collect(),
        }
    }
}

pub struct Ec2Info {
    meta: Arc<Ec2Meta>,
    describer: OnceCell<Arc<dyn InstanceDescriber>>,
    local_instance: OnceCell<DescribeResult>,
}

impl Ec2Info {
    /// Creates an instance which builds its EC2 client from the shared SDK
    /// session once the first remote call is due.
    pub fn new(meta: Arc<Ec2Meta>) -> Self {
        Self {
            meta,
            describer: OnceCell::new(),
            local_instance: OnceCell::new(),
        }
    }

    pub fn with_describer(meta: Arc<Ec2Meta>, describer: Arc<dyn InstanceDescriber>) -> Self {
        Self {
            meta,
            describer: OnceCell::new_with(Some(describer)),
            local_instance: OnceCell::new(),
        }
    }

    /// Returns the value of the given tag of the local instance.
    ///
    /// Yields `default` (or an empty string) if the tag is missing or the
    /// instance cannot be described at all.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tag(&self, name: &str, default: Option<&str>) -> String {
        self.describe_local_instance()
            .await
            .and_then(DescribeResult::first_instance)
            .and_then(|instance| instance.tag(name))
            .unwrap_or(default.unwrap_or_default())
            .to_owned()
    }

    /// Collects the addresses of all running instances where the tag
    /// `tag_name` has the value `tag_value`.
    ///
    /// `address_kind` is one of `private_v4`, `public_v4` or `public_v6`. Any
    /// other kind, as well as any failure, yields an empty list. Unparsable
    /// addresses are skipped and the order of the response is kept.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn addresses_by_tag(
        &self,
        tag_name: &str,
        tag_value: &str,
        address_kind: &str,
    ) -> Vec<IpAddr> {
        let Some(kind) = AddressKind::parse(address_kind) else {
            return Vec::new();
        };

        let query = DescribeQuery::default()
            .with_filter(format!("tag:{}", tag_name), tag_value)
            .with_filter("instance-state-name", "running");

        match self.describe(&query).await {
            Ok(result) => result
                .instances()
                .flat_map(|instance| kind.addresses(instance))
                .filter_map(|address| address.parse::<IpAddr>().ok())
                .collect(),
            Err(err) => {
                tracing::debug!("Cannot discover instances by tag '{}': {:#}", tag_name, err);
                Vec::new()
            }
        }
    }

    async fn describe_local_instance(&self) -> Option<&DescribeResult> {
        if self.meta.is_non_cloud() {
            return None;
        }

        self.local_instance
            .get_or_try_init(|| self.fetch_local_instance())
            .await
            .inspect_err(|err| tracing::debug!("Cannot describe local instance: {:#}", err))
            .ok()
    }

    async fn fetch_local_instance(&self) -> anyhow::Result<DescribeResult> {
        let instance_id = self.meta.meta("instance-id", None).await;
        if instance_id.is_empty() {
            bail!("No instance-id available from instance metadata");
        }

        self.describe(&DescribeQuery::for_instance(instance_id)).await
    }

    async fn describe(&self, query: &DescribeQuery) -> anyhow::Result<DescribeResult> {
        if self.meta.is_non_cloud() {
            bail!("Not running on EC2");
        }

        let describer = self.describer().await;

        // Building the session probes the metadata service as well.
        if self.meta.is_non_cloud() {
            bail!("Not running on EC2");
        }

        describer
            .describe_instances(query)
            .await
            .context("Failed to describe instances")
    }

    async fn describer(&self) -> &Arc<dyn InstanceDescriber> {
        self.describer
            .get_or_init(|| async {
                Arc::new(Ec2Describer::new(sdk_session().await)) as Arc<dyn InstanceDescriber>
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::describer::Reservation;
    use crate::aws::test::{
        MockDescriber, MockMetadataSource, instance_with_addresses, instance_with_tags,
        single_reservation,
    };

    fn ec2_meta(instance_id: &str) -> Arc<Ec2Meta> {
        Arc::new(Ec2Meta::with_source(Arc::new(
            MockMetadataSource::new().with_instance_id(instance_id),
        )))
    }

    fn tagged_instance_info() -> (Ec2Info, Arc<MockDescriber>) {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_tags(&[("Name", "web-1"), ("env", "prod")]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0123456789abcdef0"), describer.clone());

        (info, describer)
    }

    fn ips(addresses: &[&str]) -> Vec<IpAddr> {
        addresses.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn tag_returns_value_of_local_instance() {
        let (info, describer) = tagged_instance_info();

        assert_eq!(info.tag("env", Some("unknown")).await, "prod");
        assert_eq!(info.tag("Name", None).await, "web-1");
        assert_eq!(
            describer.queries()[0],
            DescribeQuery::for_instance("i-0123456789abcdef0")
        );
    }

    #[tokio::test]
    async fn missing_tag_yields_default_or_empty_string() {
        let (info, _) = tagged_instance_info();

        assert_eq!(info.tag("missing", Some("fallback")).await, "fallback");
        assert_eq!(info.tag("missing", None).await, "");
        assert_eq!(info.tag("ENV", Some("d")).await, "d");
    }

    #[tokio::test]
    async fn local_instance_is_described_only_once() {
        let (info, describer) = tagged_instance_info();

        info.tag("env", None).await;
        assert_eq!(describer.calls(), 1);

        info.tag("Name", None).await;
        info.tag("missing", Some("x")).await;
        assert_eq!(describer.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_lookups_share_one_describe_call() {
        let (info, describer) = tagged_instance_info();

        let (env, name) = tokio::join!(info.tag("env", None), info.tag("Name", None));

        assert_eq!(env, "prod");
        assert_eq!(name, "web-1");
        assert_eq!(describer.calls(), 1);
    }

    #[tokio::test]
    async fn describe_failure_yields_default() {
        let describer = Arc::new(MockDescriber::failing("UnauthorizedOperation"));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer.clone());

        assert_eq!(info.tag("env", Some("dev")).await, "dev");
        assert_eq!(info.tag("env", None).await, "");
        // Failures are not cached, so each lookup tries again.
        assert_eq!(describer.calls(), 2);
    }

    #[tokio::test]
    async fn empty_description_yields_default() {
        let describer = Arc::new(MockDescriber::returning(DescribeResult {
            reservations: vec![Reservation::default()],
        }));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer);

        assert_eq!(info.tag("env", Some("none")).await, "none");
    }

    #[tokio::test]
    async fn missing_instance_id_skips_remote_call() {
        let meta = Arc::new(Ec2Meta::with_source(Arc::new(MockMetadataSource::new())));
        let describer = Arc::new(MockDescriber::returning(DescribeResult::default()));
        let info = Ec2Info::with_describer(meta, describer.clone());

        assert_eq!(info.tag("env", Some("d")).await, "d");
        assert_eq!(describer.calls(), 0);
    }

    #[tokio::test]
    async fn non_cloud_environment_never_calls_describer() {
        let meta = Arc::new(Ec2Meta::non_cloud(Arc::new(
            MockMetadataSource::new().with_instance_id("i-0abc"),
        )));
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_tags(&[("env", "prod")]),
        ])));
        let info = Ec2Info::with_describer(meta, describer.clone());

        assert_eq!(info.tag("env", Some("local")).await, "local");
        assert!(info.addresses_by_tag("role", "web", "private_v4").await.is_empty());
        assert_eq!(describer.calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_metadata_service_never_calls_describer() {
        let meta = Arc::new(Ec2Meta::with_source(Arc::new(MockMetadataSource::unreachable())));
        let describer = Arc::new(MockDescriber::returning(DescribeResult::default()));
        let info = Ec2Info::with_describer(meta, describer.clone());

        assert_eq!(info.tag("env", Some("local")).await, "local");
        assert!(info.addresses_by_tag("role", "web", "public_v4").await.is_empty());
        assert_eq!(describer.calls(), 0);
    }

    #[tokio::test]
    async fn private_addresses_skip_instances_without_one() {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_addresses(Some("10.0.0.1"), None, &[]),
            instance_with_addresses(Some("10.0.0.2"), None, &[]),
            instance_with_addresses(None, Some("54.0.0.3"), &[]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer.clone());

        assert_eq!(
            info.addresses_by_tag("role", "web", "private_v4").await,
            ips(&["10.0.0.1", "10.0.0.2"])
        );
        assert_eq!(
            describer.queries()[0],
            DescribeQuery::default()
                .with_filter("tag:role", "web")
                .with_filter("instance-state-name", "running")
        );
    }

    #[tokio::test]
    async fn addresses_follow_reservation_order() {
        let describer = Arc::new(MockDescriber::returning(DescribeResult {
            reservations: vec![
                Reservation {
                    instances: vec![instance_with_addresses(None, Some("54.0.0.2"), &[])],
                },
                Reservation {
                    instances: vec![
                        instance_with_addresses(None, Some("54.0.0.1"), &[]),
                        instance_with_addresses(None, Some("54.0.0.1"), &[]),
                        instance_with_addresses(Some("10.0.0.9"), None, &[]),
                    ],
                },
            ],
        }));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer);

        assert_eq!(
            info.addresses_by_tag("role", "web", "public_v4").await,
            ips(&["54.0.0.2", "54.0.0.1", "54.0.0.1"])
        );
    }

    #[tokio::test]
    async fn ipv6_addresses_are_collected_from_all_interfaces() {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_addresses(Some("10.0.0.1"), None, &[&["2001:db8::1", "2001:db8::2"], &[]]),
            instance_with_addresses(Some("10.0.0.2"), None, &[]),
            instance_with_addresses(None, None, &[&["2001:db8::3"]]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer);

        assert_eq!(
            info.addresses_by_tag("role", "web", "public_v6").await,
            ips(&["2001:db8::1", "2001:db8::2", "2001:db8::3"])
        );
    }

    #[tokio::test]
    async fn unparsable_addresses_are_dropped() {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_addresses(Some("10.0.0.1"), None, &[]),
            instance_with_addresses(Some("not-an-ip"), None, &[]),
            instance_with_addresses(Some("10.0.0.300"), None, &[]),
            instance_with_addresses(Some("10.0.0.3"), None, &[]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer);

        assert_eq!(
            info.addresses_by_tag("role", "web", "private_v4").await,
            ips(&["10.0.0.1", "10.0.0.3"])
        );
    }

    #[tokio::test]
    async fn invalid_address_kind_skips_remote_call() {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_addresses(Some("10.0.0.1"), None, &[]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer.clone());

        assert!(info.addresses_by_tag("role", "web", "private_v6").await.is_empty());
        assert!(info.addresses_by_tag("role", "web", "").await.is_empty());
        assert_eq!(describer.calls(), 0);
    }

    #[tokio::test]
    async fn discovery_is_never_cached() {
        let describer = Arc::new(MockDescriber::returning(single_reservation(vec![
            instance_with_addresses(Some("10.0.0.1"), None, &[]),
        ])));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer.clone());

        info.addresses_by_tag("role", "web", "private_v4").await;
        info.addresses_by_tag("role", "web", "private_v4").await;
        info.addresses_by_tag("role", "db", "private_v4").await;

        assert_eq!(describer.calls(), 3);
    }

    #[tokio::test]
    async fn discovery_failure_yields_empty_list() {
        let describer = Arc::new(MockDescriber::failing("RequestLimitExceeded"));
        let info = Ec2Info::with_describer(ec2_meta("i-0abc"), describer.clone());

        assert!(info.addresses_by_tag("role", "web", "private_v4").await.is_empty());
        assert_eq!(describer.calls(), 1);
    }

    #[test]
    fn address_kinds_are_parsed_by_name() {
        assert_eq!(AddressKind::parse("private_v4"), Some(AddressKind::PrivateV4));
        assert_eq!(AddressKind::parse("public_v4"), Some(AddressKind::PublicV4));
        assert_eq!(AddressKind::parse("public_v6"), Some(AddressKind::PublicV6));
        assert_eq!(AddressKind::parse("PUBLIC_V4"), None);
        assert_eq!(AddressKind::parse(AddressKind::DEFAULT_NAME), Some(AddressKind::PrivateV4));
    }
}
