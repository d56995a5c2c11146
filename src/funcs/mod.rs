//! The `aws` function namespace handed to the template engine.
//!
//! [`AwsFuncs`] creates its metadata fetcher and its instance info lazily and
//! independently of each other: looking up a tag never constructs the
//! metadata fetcher of the namespace and vice versa. Functions can be invoked
//! directly or by name via [`AwsFuncs::call`], which also accepts the
//! deprecated flat aliases (`ec2meta`, `ec2tag`, ...).

use crate::aws::info::{AddressKind, Ec2Info};
use crate::aws::meta::Ec2Meta;
use crate::aws::options::{ClientOptions, client_options};
use anyhow::{Context, bail};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

static SHARED: LazyLock<AwsFuncs> = LazyLock::new(AwsFuncs::new);

static REPORTED_ALIASES: LazyLock<Mutex<HashSet<&'static str>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwsFunction {
    Region,
    Meta,
    Dynamic,
    Tag,
    AddressesByTag,
}

struct FunctionName {
    name: &'static str,
    function: AwsFunction,
    deprecated: bool,
}

const FUNCTIONS: &[FunctionName] = &[
    FunctionName {
        name: "aws.EC2Region",
        function: AwsFunction::Region,
        deprecated: false,
    },
    FunctionName {
        name: "aws.EC2Meta",
        function: AwsFunction::Meta,
        deprecated: false,
    },
    FunctionName {
        name: "aws.EC2Dynamic",
        function: AwsFunction::Dynamic,
        deprecated: false,
    },
    FunctionName {
        name: "aws.EC2Tag",
        function: AwsFunction::Tag,
        deprecated: false,
    },
    FunctionName {
        name: "aws.DiscoverAddrsByEC2Tag",
        function: AwsFunction::AddressesByTag,
        deprecated: false,
    },
    FunctionName {
        name: "ec2region",
        function: AwsFunction::Region,
        deprecated: true,
    },
    FunctionName {
        name: "ec2meta",
        function: AwsFunction::Meta,
        deprecated: true,
    },
    FunctionName {
        name: "ec2dynamic",
        function: AwsFunction::Dynamic,
        deprecated: true,
    },
    FunctionName {
        name: "ec2tag",
        function: AwsFunction::Tag,
        deprecated: true,
    },
];

impl AwsFunction {
    /// Resolves a namespaced function name or one of the deprecated aliases.
    pub fn resolve(name: &str) -> Option<AwsFunction> {
        let entry = FUNCTIONS.iter().find(|entry| entry.name == name)?;
        if entry.deprecated && report_alias(entry.name) {
            tracing::warn!(
                "'{}' is deprecated. Use the 'aws.' namespace instead.",
                entry.name
            );
        }

        Some(entry.function)
    }

    /// All names the namespace answers to, including deprecated aliases.
    pub fn names() -> impl Iterator<Item = &'static str> {
        FUNCTIONS.iter().map(|entry| entry.name)
    }

    fn arity(&self) -> (usize, usize) {
        match self {
            AwsFunction::Region => (0, 1),
            AwsFunction::Meta | AwsFunction::Dynamic | AwsFunction::Tag => (1, 2),
            AwsFunction::AddressesByTag => (2, 3),
        }
    }
}

fn report_alias(name: &'static str) -> bool {
    REPORTED_ALIASES
        .lock()
        .map(|mut reported| reported.insert(name))
        .unwrap_or(false)
}

/// The result of a function invoked by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FuncValue {
    Text(String),
    Addresses(Vec<IpAddr>),
}

impl Display for FuncValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncValue::Text(text) => write!(f, "{}", text),
            FuncValue::Addresses(addresses) => {
                write!(f, "[")?;
                for (index, address) in addresses.iter().enumerate() {
                    if index > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", address)?;
                }
                write!(f, "]")
            }
        }
    }
}

type ClientFactory<T> = Box<dyn Fn() -> Arc<T> + Send + Sync>;

pub struct AwsFuncs {
    options: ClientOptions,
    meta: OnceLock<Arc<Ec2Meta>>,
    info: OnceLock<Arc<Ec2Info>>,
    meta_factory: ClientFactory<Ec2Meta>,
    info_factory: ClientFactory<Ec2Info>,
}

impl AwsFuncs {
    /// Creates a namespace backed by the process-wide metadata fetcher.
    ///
    /// Reads the client options right away, so a malformed `AWS_TIMEOUT`
    /// aborts when the namespace is created.
    pub fn new() -> Self {
        Self::with_factories(
            client_options(),
            Box::new(Ec2Meta::shared),
            Box::new(|| Arc::new(Ec2Info::new(Ec2Meta::shared()))),
        )
    }

    pub fn with_factories(
        options: ClientOptions,
        meta_factory: ClientFactory<Ec2Meta>,
        info_factory: ClientFactory<Ec2Info>,
    ) -> Self {
        Self {
            options,
            meta: OnceLock::new(),
            info: OnceLock::new(),
            meta_factory,
            info_factory,
        }
    }

    /// The process-wide namespace.
    pub fn shared() -> &'static AwsFuncs {
        &SHARED
    }

    pub fn options(&self) -> ClientOptions {
        self.options
    }

    fn meta(&self) -> &Ec2Meta {
        self.meta.get_or_init(|| (self.meta_factory)())
    }

    fn info(&self) -> &Ec2Info {
        self.info.get_or_init(|| (self.info_factory)())
    }

    pub async fn ec2_region(&self, default: Option<&str>) -> String {
        self.meta().region(default).await
    }

    pub async fn ec2_meta(&self, key: &str, default: Option<&str>) -> String {
        self.meta().meta(key, default).await
    }

    pub async fn ec2_dynamic(&self, key: &str, default: Option<&str>) -> String {
        self.meta().dynamic(key, default).await
    }

    pub async fn ec2_tag(&self, tag: &str, default: Option<&str>) -> String {
        self.info().tag(tag, default).await
    }

    /// Discovers peers by tag. `address_kind` defaults to `private_v4`.
    pub async fn discover_addrs_by_ec2_tag(
        &self,
        tag_name: &str,
        tag_value: &str,
        address_kind: Option<&str>,
    ) -> Vec<IpAddr> {
        self.info()
            .addresses_by_tag(
                tag_name,
                tag_value,
                address_kind.unwrap_or(AddressKind::DEFAULT_NAME),
            )
            .await
    }

    /// Invokes a function by name with positional string arguments.
    ///
    /// Fails only for unknown names or a wrong number of arguments. Lookups
    /// themselves never fail but fall back to their defaults.
    pub async fn call(&self, name: &str, args: &[&str]) -> anyhow::Result<FuncValue> {
        let function =
            AwsFunction::resolve(name).with_context(|| format!("Unknown function: {}", name))?;

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            bail!(
                "{} expects between {} and {} arguments, but {} were given",
                name,
                min,
                max,
                args.len()
            );
        }

        let arg = |index: usize| args.get(index).copied();

        let value = match function {
            AwsFunction::Region => FuncValue::Text(self.ec2_region(arg(0)).await),
            AwsFunction::Meta => FuncValue::Text(self.ec2_meta(args[0], arg(1)).await),
            AwsFunction::Dynamic => FuncValue::Text(self.ec2_dynamic(args[0], arg(1)).await),
            AwsFunction::Tag => FuncValue::Text(self.ec2_tag(args[0], arg(1)).await),
            AwsFunction::AddressesByTag => FuncValue::Addresses(
                self.discover_addrs_by_ec2_tag(args[0], args[1], arg(2)).await,
            ),
        };

        Ok(value)
    }
}

impl Default for AwsFuncs {
    fn default() -> Self {
        Self::new()
    }
}
