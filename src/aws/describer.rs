//! The boundary between instance lookups and the EC2 `DescribeInstances` API.
//!
//! [`InstanceDescriber`] is the only seam through which remote instance
//! descriptions enter the crate. The SDK response is translated into the small
//! [`DescribeResult`] model right away, so that callers and test doubles never
//! deal with SDK types.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::operation::describe_instances::DescribeInstancesOutput;
use std::fmt::{Display, Formatter};

/// Selects the instances to describe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescribeQuery {
    pub instance_ids: Vec<String>,
    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl DescribeQuery {
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_ids: vec![instance_id.into()],
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(Filter {
            name: name.into(),
            values: vec![value.into()],
        });
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescribeResult {
    pub reservations: Vec<Reservation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reservation {
    pub instances: Vec<Instance>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: Option<String>,
    pub tags: Vec<Tag>,
    pub private_ip_address: Option<String>,
    pub public_ip_address: Option<String>,
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub ipv6_addresses: Vec<String>,
}

impl DescribeResult {
    /// All instances of all reservations, in response order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.reservations
            .iter()
            .flat_map(|reservation| reservation.instances.iter())
    }

    pub fn first_instance(&self) -> Option<&Instance> {
        self.reservations
            .first()
            .and_then(|reservation| reservation.instances.first())
    }
}

impl Instance {
    /// Returns the value of the first tag with exactly the given key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

/// A failed remote describe call (transport, authentication, throttling...).
#[derive(Debug)]
pub struct RemoteCallError {
    pub operation: &'static str,
    pub message: String,
}

impl RemoteCallError {
    pub fn new(operation: &'static str, message: impl ToString) -> Self {
        Self {
            operation,
            message: message.to_string(),
        }
    }
}

impl Display for RemoteCallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

impl std::error::Error for RemoteCallError {}

/// Describes the instances matching a query.
///
/// Implementations perform a single attempt. Retries, if any, are up to the
/// underlying transport.
#[async_trait]
pub trait InstanceDescriber: Send + Sync {
    async fn describe_instances(
        &self,
        query: &DescribeQuery,
    ) -> Result<DescribeResult, RemoteCallError>;
}

/// [`InstanceDescriber`] calling the EC2 API.
#[derive(Clone, Debug)]
pub struct Ec2Describer {
    client: Client,
}

impl Ec2Describer {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl InstanceDescriber for Ec2Describer {
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    async fn describe_instances(
        &self,
        query: &DescribeQuery,
    ) -> Result<DescribeResult, RemoteCallError> {
        let filters = query
            .filters
            .iter()
            .map(|filter| {
                aws_sdk_ec2::types::Filter::builder()
                    .name(&filter.name)
                    .set_values(Some(filter.values.clone()))
                    .build()
            })
            .collect::<Vec<_>>();

        let output = self
            .client
            .describe_instances()
            .set_instance_ids(Some(query.instance_ids.clone()).filter(|ids| !ids.is_empty()))
            .set_filters(Some(filters).filter(|filters| !filters.is_empty()))
            .send()
            .await
            .map_err(|err| RemoteCallError::new("DescribeInstances", DisplayErrorContext(&err)))?;

        Ok(DescribeResult::from(&output))
    }
}

impl From<&DescribeInstancesOutput> for DescribeResult {
    fn from(output: &DescribeInstancesOutput) -> Self {
        DescribeResult {
            reservations: output
                .reservations()
                .iter()
                .map(|reservation| Reservation {
                    instances: reservation.instances().iter().map(Instance::from).collect(),
                })
                .collect(),
        }
    }
}

impl From<&aws_sdk_ec2::types::Instance> for Instance {
    fn from(instance: &aws_sdk_ec2::types::Instance) -> Self {
        Instance {
            instance_id: instance.instance_id().map(str::to_owned),
            tags: instance
                .tags()
                .iter()
                .map(|tag| Tag {
                    key: tag.key().unwrap_or_default().to_owned(),
                    value: tag.value().unwrap_or_default().to_owned(),
                })
                .collect(),
            private_ip_address: instance.private_ip_address().map(str::to_owned),
            public_ip_address: instance.public_ip_address().map(str::to_owned),
            network_interfaces: instance
                .network_interfaces()
                .iter()
                .map(|interface| NetworkInterface {
                    ipv6_addresses: interface
                        .ipv6_addresses()
                        .iter()
                        .filter_map(|address| address.ipv6_address())
                        .map(str::to_owned)
                        .collect(),
                })
                .collect(),
        }
    }
}
