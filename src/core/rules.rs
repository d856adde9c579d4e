//! The rule catalog
//!
//! A [`Rule`] is one firewall intent. It is built fresh from the current
//! parameters on every composition, carries those parameters verbatim, and
//! turns them into validated [`Filter`]s only when applied. A rule whose
//! parameters do not form a valid predicate fails in [`Rule::filters`], so
//! [`Rule::apply`] never hands a partial rule to the installer.

use crate::core::error::{ApplyError, ValidationError};
use crate::core::filter::{Filter, Weight};
use crate::core::identity::{RuleName, Sublayer};
use crate::core::installer::Transaction;
use crate::core::predicate::{
    Action, Address, Application, Condition, Direction, Interface, Port, Protocol,
};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub const DNS_PORT: u16 = 53;

/// Private and link-local ranges permitted by `permit-lan` when no networks
/// are configured
pub const DEFAULT_LAN_NETWORKS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "fe80::/10",
    "fc00::/7",
];

/// Local multicast scopes (service discovery, SSDP, mDNS)
pub const LAN_MULTICAST_NETWORKS: &[&str] = &[
    "224.0.0.0/24",
    "239.255.255.250/32",
    "239.255.255.251/32",
    "ff01::/16",
    "ff02::/16",
    "ff05::/16",
];

const NDP_NETWORKS: &[&str] = &["fe80::/10", "ff02::/16"];

/// Parameters of a permit for one remote endpoint reached by one local
/// application. Shared by `permit-vpn-relay` and `permit-endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayPermit {
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Originating application. `None` permits any local process.
    pub client: Option<String>,
    pub sublayer: Sublayer,
}

impl RelayPermit {
    /// A relay permit placed by [`RelayPermit::placement`].
    pub fn new(
        address: impl Into<String>,
        port: u16,
        protocol: Protocol,
        client: Option<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            protocol,
            client,
            sublayer: Self::placement(port),
        }
    }

    /// A relay reached on the DNS port would be caught by `block-dns`, so it
    /// is exempted in the DNS sublayer. Everything else is baseline traffic.
    pub const fn placement(port: u16) -> Sublayer {
        if port == DNS_PORT {
            Sublayer::Dns
        } else {
            Sublayer::Baseline
        }
    }

    /// Overrides the port-based placement. The evaluator then weighs this
    /// permit against the blocks of `sublayer`.
    pub fn in_sublayer(mut self, sublayer: Sublayer) -> Self {
        self.sublayer = sublayer;
        self
    }

    fn filter(&self, rule: RuleName, prefix: &str) -> Result<Filter, ValidationError> {
        let address_field = format!("{prefix}.address");
        let address = Address::parse(&address_field, &self.address)?;
        if !matches!(address, Address::Host(_)) {
            return Err(ValidationError::new(
                address_field,
                format!("'{}' is not a single host", self.address),
            ));
        }
        if let Address::Host(ip) = address
            && let Some(note) = validators::check_reserved_ip(ip)
        {
            warn!("{rule} {address}: {note}");
        }

        if !self.protocol.is_transport() {
            return Err(ValidationError::new(
                format!("{prefix}.protocol"),
                format!("relay protocol must be tcp or udp, got {}", self.protocol),
            ));
        }

        let port = Port::new(&format!("{prefix}.port"), self.port)?;

        let mut filter = Filter::new(
            rule.identity(),
            self.sublayer,
            Weight::PERMIT,
            Direction::Outbound,
            Action::Permit,
        )
        .with(Condition::Protocol(self.protocol))
        .with(Condition::RemoteAddress(address))
        .with(Condition::RemotePort(port));

        if let Some(client) = &self.client {
            filter = filter.with(Condition::Application(Application::new(
                &format!("{prefix}.client"),
                client,
            )?));
        }

        Ok(filter)
    }
}

impl fmt::Display for RelayPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, self.protocol)?;
        if let Some(client) = &self.client {
            write!(f, " via {client}")?;
        }
        Ok(())
    }
}

/// One firewall intent from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum Rule {
    /// Default deny for all traffic in both directions
    BlockAll,
    PermitLoopback,
    /// DHCPv4 client/server exchange and DHCPv6 client traffic
    PermitDhcp,
    /// IPv6 neighbour and router discovery
    PermitNdp,
    /// Outbound to local networks and local multicast. Empty means
    /// [`DEFAULT_LAN_NETWORKS`].
    PermitLan { networks: Vec<String> },
    /// Inbound from local networks
    PermitLanService { networks: Vec<String> },
    /// DNS to the given servers, or to any server when empty
    PermitDns { servers: Vec<String> },
    PermitVpnRelay(RelayPermit),
    /// A non-relay endpoint the VPN client needs while blocked (API, bridge)
    PermitEndpoint(RelayPermit),
    PermitVpnTunnel { interface: String },
    /// DNS leak protection: blocks every DNS query not explicitly permitted
    /// in the DNS sublayer
    BlockDns,
    /// DNS through the tunnel. Empty `servers` permits any server on the
    /// tunnel interface.
    PermitTunnelDns {
        interface: String,
        servers: Vec<String>,
    },
}

impl Rule {
    pub const fn name(&self) -> RuleName {
        match self {
            Rule::BlockAll => RuleName::BlockAll,
            Rule::PermitLoopback => RuleName::PermitLoopback,
            Rule::PermitDhcp => RuleName::PermitDhcp,
            Rule::PermitNdp => RuleName::PermitNdp,
            Rule::PermitLan { .. } => RuleName::PermitLan,
            Rule::PermitLanService { .. } => RuleName::PermitLanService,
            Rule::PermitDns { .. } => RuleName::PermitDns,
            Rule::PermitVpnRelay(_) => RuleName::PermitVpnRelay,
            Rule::PermitEndpoint(_) => RuleName::PermitEndpoint,
            Rule::PermitVpnTunnel { .. } => RuleName::PermitVpnTunnel,
            Rule::BlockDns => RuleName::BlockDns,
            Rule::PermitTunnelDns { .. } => RuleName::PermitTunnelDns,
        }
    }

    pub const fn sublayer(&self) -> Sublayer {
        match self {
            Rule::PermitVpnRelay(relay) | Rule::PermitEndpoint(relay) => relay.sublayer,
            _ => self.name().default_sublayer(),
        }
    }

    pub const fn action(&self) -> Action {
        match self {
            Rule::BlockAll | Rule::BlockDns => Action::Block,
            _ => Action::Permit,
        }
    }

    pub const fn weight(&self) -> Weight {
        match self.action() {
            Action::Block => Weight::BLOCK,
            Action::Permit => Weight::PERMIT,
        }
    }

    fn base(&self, direction: Direction) -> Filter {
        Filter::new(
            self.name().identity(),
            self.sublayer(),
            self.weight(),
            direction,
            self.action(),
        )
    }

    /// Builds and validates every filter this rule installs.
    ///
    /// Multi-filter rules number their filters with
    /// [`FilterIdentity::instance`](crate::core::identity::FilterIdentity::instance)
    /// in emission order, so each gets its own stable key.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found in the rule's parameters.
    pub fn filters(&self) -> Result<Vec<Filter>, ValidationError> {
        let filters = match self {
            Rule::BlockAll => vec![self.base(Direction::Any)],

            Rule::PermitLoopback => {
                vec![self.base(Direction::Any).with(Condition::Interface(Interface::loopback()))]
            }

            Rule::PermitDhcp => self.dhcp_filters()?,

            Rule::PermitNdp => NDP_NETWORKS
                .iter()
                .map(|net| -> Result<Filter, ValidationError> {
                    Ok(self
                        .base(Direction::Any)
                        .with(Condition::Protocol(Protocol::Icmp))
                        .with(Condition::RemoteAddress(Address::parse("ndp", net)?)))
                })
                .collect::<Result<Vec<_>, _>>()?,

            Rule::PermitLan { networks } => {
                let mut filters = self.network_filters(
                    "lan.networks",
                    Self::or_default_lan(networks),
                    Direction::Outbound,
                )?;
                for net in LAN_MULTICAST_NETWORKS {
                    filters.push(
                        self.base(Direction::Outbound)
                            .with(Condition::RemoteAddress(Address::parse("lan.multicast", net)?)),
                    );
                }
                filters
            }

            Rule::PermitLanService { networks } => self.network_filters(
                "lan.networks",
                Self::or_default_lan(networks),
                Direction::Inbound,
            )?,

            Rule::PermitDns { servers } => {
                let dns = Port::new("dns.port", DNS_PORT)?;
                if servers.is_empty() {
                    vec![self.base(Direction::Outbound).with(Condition::RemotePort(dns))]
                } else {
                    servers
                        .iter()
                        .enumerate()
                        .map(|(i, server)| -> Result<Filter, ValidationError> {
                            Ok(self
                                .base(Direction::Outbound)
                                .with(Condition::RemoteAddress(Address::parse(
                                    &format!("dns.servers[{i}]"),
                                    server,
                                )?))
                                .with(Condition::RemotePort(dns)))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                }
            }

            Rule::PermitVpnRelay(relay) => vec![relay.filter(self.name(), "relay")?],

            Rule::PermitEndpoint(endpoint) => vec![endpoint.filter(self.name(), "endpoint")?],

            Rule::PermitVpnTunnel { interface } => {
                let interface = Interface::new("tunnel.interface", interface)?;
                vec![self.base(Direction::Any).with(Condition::Interface(interface))]
            }

            Rule::BlockDns => {
                let dns = Port::new("dns.port", DNS_PORT)?;
                vec![self.base(Direction::Outbound).with(Condition::RemotePort(dns))]
            }

            Rule::PermitTunnelDns { interface, servers } => {
                let interface = Interface::new("tunnel.interface", interface)?;
                let dns = Port::new("dns.port", DNS_PORT)?;
                let tunnel_dns = || {
                    self.base(Direction::Outbound)
                        .with(Condition::Interface(interface.clone()))
                        .with(Condition::RemotePort(dns))
                };

                if servers.is_empty() {
                    vec![tunnel_dns()]
                } else {
                    servers
                        .iter()
                        .enumerate()
                        .map(|(i, server)| -> Result<Filter, ValidationError> {
                            Ok(tunnel_dns().with(Condition::RemoteAddress(Address::parse(
                                &format!("tunnel.dns_servers[{i}]"),
                                server,
                            )?)))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                }
            }
        };

        filters
            .into_iter()
            .enumerate()
            .map(|(n, mut filter)| -> Result<Filter, ValidationError> {
                filter.identity = filter.identity.instance(n);
                filter.validate()?;
                Ok(filter)
            })
            .collect()
    }

    /// Builds this rule's filters and adds them to `session`.
    ///
    /// # Errors
    ///
    /// `ApplyError::InvalidRule` if the parameters are invalid, in which case
    /// `session` has not been touched. `ApplyError::FilterRejected` if the
    /// installer refused a filter; the session must then be aborted.
    pub fn apply(&self, session: &mut dyn Transaction) -> Result<(), ApplyError> {
        let filters = self.filters().map_err(|source| ApplyError::InvalidRule {
            rule: self.name(),
            source,
        })?;

        for filter in filters {
            debug!("Adding filter {}", filter);
            session
                .add_filter(filter)
                .map_err(|source| ApplyError::FilterRejected {
                    rule: self.name(),
                    source,
                })?;
        }

        Ok(())
    }

    fn or_default_lan(networks: &[String]) -> Vec<&str> {
        if networks.is_empty() {
            DEFAULT_LAN_NETWORKS.to_vec()
        } else {
            networks.iter().map(String::as_str).collect()
        }
    }

    fn network_filters(
        &self,
        field: &str,
        networks: Vec<&str>,
        direction: Direction,
    ) -> Result<Vec<Filter>, ValidationError> {
        networks
            .into_iter()
            .enumerate()
            .map(|(i, net)| -> Result<Filter, ValidationError> {
                let address = Address::parse(&format!("{field}[{i}]"), net)?;
                if address.is_unspecified() {
                    return Err(ValidationError::new(
                        format!("{field}[{i}]"),
                        "a local network cannot be 'any'",
                    ));
                }
                Ok(self
                    .base(direction)
                    .with(Condition::RemoteAddress(address)))
            })
            .collect()
    }

    fn dhcp_filters(&self) -> Result<Vec<Filter>, ValidationError> {
        let port = |p| Port::new("dhcp.port", p);
        let udp = Condition::Protocol(Protocol::Udp);

        Ok(vec![
            // v4 client to server, broadcast or unicast
            self.base(Direction::Outbound)
                .with(udp.clone())
                .with(Condition::RemoteAddress(Address::parse("dhcp", "0.0.0.0/0")?))
                .with(Condition::LocalPort(port(68)?))
                .with(Condition::RemotePort(port(67)?)),
            self.base(Direction::Inbound)
                .with(udp.clone())
                .with(Condition::RemoteAddress(Address::parse("dhcp", "0.0.0.0/0")?))
                .with(Condition::LocalPort(port(68)?))
                .with(Condition::RemotePort(port(67)?)),
            // v6 client to All_DHCP_Relay_Agents_and_Servers
            self.base(Direction::Outbound)
                .with(udp.clone())
                .with(Condition::RemoteAddress(Address::parse("dhcp", "ff02::1:2")?))
                .with(Condition::LocalPort(port(546)?))
                .with(Condition::RemotePort(port(547)?)),
            self.base(Direction::Inbound)
                .with(udp)
                .with(Condition::RemoteAddress(Address::parse("dhcp", "fe80::/10")?))
                .with(Condition::LocalPort(port(546)?))
                .with(Condition::RemotePort(port(547)?)),
        ])
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} w{}]", self.name(), self.sublayer(), self.weight())?;
        match self {
            Rule::PermitVpnRelay(relay) | Rule::PermitEndpoint(relay) => write!(f, " {relay}"),
            Rule::PermitLan { networks } | Rule::PermitLanService { networks }
                if !networks.is_empty() =>
            {
                write!(f, " {}", networks.join(","))
            }
            Rule::PermitDns { servers } if !servers.is_empty() => {
                write!(f, " {}", servers.join(","))
            }
            Rule::PermitVpnTunnel { interface } => write!(f, " {interface}"),
            Rule::PermitTunnelDns { interface, servers } => {
                write!(f, " {interface}")?;
                if !servers.is_empty() {
                    write!(f, " {}", servers.join(","))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
