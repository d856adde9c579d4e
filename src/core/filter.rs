//! Low-level filter objects handed to an installer
//!
//! A [`Filter`] is what one `add_filter` call carries: identity, sublayer,
//! weight, direction, action and match conditions. Filters are evaluated by
//! sublayer first ([`Sublayer::EVALUATION_ORDER`]) and by descending weight
//! inside a sublayer; the first matching filter decides.

use crate::core::error::ValidationError;
use crate::core::identity::{FilterIdentity, Sublayer};
use crate::core::predicate::{Action, Address, Condition, Direction, Protocol};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Evaluation precedence inside a sublayer. Higher weights are evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weight(u8);

impl Weight {
    /// Default-deny level
    pub const BLOCK: Weight = Weight(0);
    /// Baseline override: any permit is evaluated before the default block
    pub const PERMIT: Weight = Weight(10);
    pub const MAX: Weight = Weight(15);

    pub const fn new(value: u8) -> Self {
        Weight(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub identity: FilterIdentity,
    pub sublayer: Sublayer,
    pub weight: Weight,
    pub direction: Direction,
    pub action: Action,
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// A filter with no conditions (matches all traffic in `direction`).
    pub fn new(
        identity: FilterIdentity,
        sublayer: Sublayer,
        weight: Weight,
        direction: Direction,
        action: Action,
    ) -> Self {
        Self {
            identity: identity.in_sublayer(sublayer),
            sublayer,
            weight,
            direction,
            action,
            conditions: Vec::new(),
        }
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn key(&self) -> Uuid {
        self.identity.filter_key
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Checks that the conditions form a matchable, non-contradictory set.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if a condition kind repeats, a port is
    /// combined with ICMP, or the weight is out of range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let field = format!("{}.conditions", self.identity.name);

        if self.weight > Weight::MAX {
            return Err(ValidationError::new(
                format!("{}.weight", self.identity.name),
                format!("weight {} exceeds maximum {}", self.weight, Weight::MAX),
            ));
        }

        let mut seen = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            if seen.contains(&condition.kind()) {
                return Err(ValidationError::new(
                    &field,
                    format!("condition '{}' appears more than once", condition.kind()),
                ));
            }
            seen.push(condition.kind());
        }

        let has_port = self
            .conditions
            .iter()
            .any(|c| matches!(c, Condition::RemotePort(_) | Condition::LocalPort(_)));
        if has_port && !self.protocol().supports_ports() {
            return Err(ValidationError::new(
                &field,
                format!("protocol {} does not carry ports", self.protocol()),
            ));
        }

        Ok(())
    }

    pub fn protocol(&self) -> Protocol {
        self.conditions
            .iter()
            .find_map(|c| match c {
                Condition::Protocol(p) => Some(*p),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn remote_address(&self) -> Address {
        self.conditions
            .iter()
            .find_map(|c| match c {
                Condition::RemoteAddress(a) => Some(*a),
                _ => None,
            })
            .unwrap_or(Address::Unspecified)
    }

    /// Evaluation order: sublayer rank ascending, then weight descending,
    /// then key for a total order.
    pub fn evaluation_order(a: &Filter, b: &Filter) -> Ordering {
        a.sublayer
            .rank()
            .cmp(&b.sublayer.rank())
            .then_with(|| b.weight.cmp(&a.weight))
            .then_with(|| a.key().cmp(&b.key()))
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        if !self.direction.covers(packet.direction) {
            return false;
        }

        self.conditions.iter().all(|condition| match condition {
            Condition::Protocol(Protocol::Any) => true,
            Condition::Protocol(p) => *p == packet.protocol,
            Condition::RemoteAddress(addr) => addr.matches(packet.remote),
            Condition::RemotePort(port) => packet.remote_port == Some(port.get()),
            Condition::LocalPort(port) => packet.local_port == Some(port.get()),
            Condition::Interface(iface) => packet.interface.as_deref() == Some(iface.as_str()),
            Condition::Application(app) => packet.application.as_deref() == Some(app.as_str()),
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} w{}] {} {}",
            self.identity.name, self.sublayer, self.weight, self.action, self.direction
        )?;
        for condition in &self.conditions {
            write!(f, " {condition}")?;
        }
        Ok(())
    }
}

/// A packet as seen by the evaluator. Only the fields filters match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub direction: Direction,
    pub protocol: Protocol,
    pub remote: IpAddr,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
    pub interface: Option<String>,
    pub application: Option<String>,
}

impl Packet {
    pub fn outbound(protocol: Protocol, remote: IpAddr, remote_port: Option<u16>) -> Self {
        Self {
            direction: Direction::Outbound,
            protocol,
            remote,
            remote_port,
            local_port: None,
            interface: None,
            application: None,
        }
    }

    pub fn inbound(protocol: Protocol, remote: IpAddr, local_port: Option<u16>) -> Self {
        Self {
            direction: Direction::Inbound,
            protocol,
            remote,
            remote_port: None,
            local_port,
            interface: None,
            application: None,
        }
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn on_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn from_application(mut self, application: &str) -> Self {
        self.application = Some(application.to_string());
        self
    }
}
