//! Match predicates used to build filter conditions
//!
//! Every type in this module is an immutable value object. Constructors
//! validate their input and fail with a [`ValidationError`] naming the
//! offending field, so a value that exists is always well-formed: there is no
//! way to build an address that matches nothing or a port of zero.
//!
//! - [`Address`]: single host, CIDR network, or unspecified (matches all)
//! - [`Port`]: 1..=65535; an absent port is `Option::None` and matches all
//! - [`Protocol`]: TCP, UDP, ICMP (both families) or any
//! - [`Interface`], [`Application`]: the tunnel device and the relay client
//! - [`Condition`]: one predicate inside a filter

use crate::core::error::ValidationError;
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A remote address predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Address {
    /// Matches every address of both families
    Unspecified,
    /// Matches exactly one address
    Host(IpAddr),
    /// Matches every address inside the prefix
    Network(IpNetwork),
}

impl Address {
    /// Parses an address predicate.
    ///
    /// Accepts `any`/`*`, an IPv4/IPv6 literal, or a CIDR prefix. A prefix with
    /// host bits set is normalised to its network address, and a full-length
    /// prefix (`/32`, `/128`) becomes a host.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for empty or unparsable input.
    pub fn parse(field: &str, text: &str) -> Result<Self, ValidationError> {
        let text = text.trim();

        if text.is_empty() {
            return Err(ValidationError::new(field, "address is empty"));
        }

        if text == "any" || text == "*" {
            return Ok(Address::Unspecified);
        }

        if text.contains('/') {
            let network: IpNetwork = text.parse().map_err(|_| {
                ValidationError::new(field, format!("'{text}' is not a valid CIDR prefix"))
            })?;
            return Self::network(field, network);
        }

        text.parse::<IpAddr>().map(Address::Host).map_err(|_| {
            ValidationError::new(field, format!("'{text}' is not a valid IPv4/IPv6 address"))
        })
    }

    /// Builds a network predicate, normalising the prefix.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the normalised prefix cannot be rebuilt,
    /// which only happens for a corrupted `IpNetwork`.
    pub fn network(field: &str, network: IpNetwork) -> Result<Self, ValidationError> {
        let full_length = if network.is_ipv4() { 32 } else { 128 };
        if network.prefix() == full_length {
            return Ok(Address::Host(network.ip()));
        }

        IpNetwork::new(network.network(), network.prefix())
            .map(Address::Network)
            .map_err(|e| ValidationError::new(field, e.to_string()))
    }

    pub const fn is_unspecified(&self) -> bool {
        matches!(self, Address::Unspecified)
    }

    /// `Some(true)` for IPv6, `Some(false)` for IPv4, `None` when unspecified.
    pub fn is_ipv6(&self) -> Option<bool> {
        match self {
            Address::Unspecified => None,
            Address::Host(ip) => Some(ip.is_ipv6()),
            Address::Network(net) => Some(net.is_ipv6()),
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Address::Unspecified => true,
            Address::Host(host) => *host == ip,
            Address::Network(net) => net.contains(ip),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unspecified => write!(f, "any"),
            Address::Host(ip) => write!(f, "{ip}"),
            Address::Network(net) => write!(f, "{net}"),
        }
    }
}

/// A transport port. Zero is reserved and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(u16);

impl Port {
    /// # Errors
    ///
    /// Returns `ValidationError` if `value` is 0.
    pub fn new(field: &str, value: u16) -> Result<Self, ValidationError> {
        validators::validate_port(value)
            .map(Port)
            .map_err(|message| ValidationError::new(field, message))
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network protocol matched by a filter
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Match all protocols
    #[default]
    #[strum(serialize = "any")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// ICMP for IPv4 and ICMPv6 for IPv6
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    /// # Errors
    ///
    /// Returns `ValidationError` for anything but `tcp`, `udp`, `icmp` or `any`.
    pub fn parse(field: &str, text: &str) -> Result<Self, ValidationError> {
        text.trim().parse().map_err(|_| {
            ValidationError::new(
                field,
                format!("'{text}' is not a protocol (expected tcp, udp, icmp or any)"),
            )
        })
    }

    /// `Any` carries ports only through its TCP and UDP members.
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::Any)
    }

    pub const fn is_transport(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Traffic direction a filter applies to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[strum(serialize = "outbound")]
    Outbound,
    #[strum(serialize = "inbound")]
    Inbound,
    /// Both directions
    #[strum(serialize = "any")]
    Any,
}

impl Direction {
    pub fn covers(self, other: Direction) -> bool {
        self == Direction::Any || other == Direction::Any || self == other
    }
}

/// What happens to a packet that matches a filter
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[strum(serialize = "permit")]
    Permit,
    #[strum(serialize = "block")]
    Block,
}

/// A validated network interface name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interface(String);

impl Interface {
    /// The loopback device
    pub fn loopback() -> Self {
        Interface("lo".to_string())
    }

    /// # Errors
    ///
    /// Returns `ValidationError` if the name violates kernel naming rules.
    pub fn new(field: &str, name: &str) -> Result<Self, ValidationError> {
        validators::validate_interface(name.trim())
            .map(Interface)
            .map_err(|message| ValidationError::new(field, message))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the process that originates traffic (the relay client)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Application(String);

impl Application {
    /// # Errors
    ///
    /// Returns `ValidationError` if the identity is empty or unsafe.
    pub fn new(field: &str, path: &str) -> Result<Self, ValidationError> {
        validators::validate_application(path)
            .map(Application)
            .map_err(|message| ValidationError::new(field, message))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One match condition of a filter. A filter matches when all of its
/// conditions do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Protocol(Protocol),
    RemoteAddress(Address),
    RemotePort(Port),
    LocalPort(Port),
    Interface(Interface),
    Application(Application),
}

impl Condition {
    /// Short tag used to detect duplicate condition kinds
    pub const fn kind(&self) -> &'static str {
        match self {
            Condition::Protocol(_) => "protocol",
            Condition::RemoteAddress(_) => "remote_address",
            Condition::RemotePort(_) => "remote_port",
            Condition::LocalPort(_) => "local_port",
            Condition::Interface(_) => "interface",
            Condition::Application(_) => "application",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Protocol(p) => write!(f, "proto={p}"),
            Condition::RemoteAddress(a) => write!(f, "dst={a}"),
            Condition::RemotePort(p) => write!(f, "dport={p}"),
            Condition::LocalPort(p) => write!(f, "sport={p}"),
            Condition::Interface(i) => write!(f, "if={i}"),
            Condition::Application(a) => write!(f, "app={a}"),
        }
    }
}
