//! Ruleset composition and transactional install
//!
//! [`compose`] maps a logical kill-switch state and the current parameters to
//! the complete, ordered list of rules that implement it. [`install`] applies
//! such a list through one installer session. A state change always replaces
//! the whole active rule-set; there is no diffing between states.

use crate::core::error::ApplyError;
use crate::core::filter::Filter;
use crate::core::installer::Installer;
use crate::core::predicate::Protocol;
use crate::core::rules::{RelayPermit, Rule};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info, warn};

/// The VPN relay (or any other single endpoint) the client talks to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Local application allowed to reach the endpoint
    #[serde(default)]
    pub client: Option<String>,
}

impl RelayEndpoint {
    pub fn new(address: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            port,
            protocol,
            client: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    fn permit(&self) -> RelayPermit {
        RelayPermit::new(
            self.address.clone(),
            self.port,
            self.protocol,
            self.client.clone(),
        )
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, self.protocol)
    }
}

/// The established tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelParams {
    pub interface: String,
    /// Resolvers reached through the tunnel. Empty permits any resolver on
    /// the tunnel interface.
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Logical kill-switch state requested by the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TargetState {
    Disconnected,
    Blocked,
    Connecting {
        relay: RelayEndpoint,
    },
    Connected {
        relay: RelayEndpoint,
        tunnel: TunnelParams,
    },
}

impl TargetState {
    pub const fn name(&self) -> &'static str {
        match self {
            TargetState::Disconnected => "disconnected",
            TargetState::Blocked => "blocked",
            TargetState::Connecting { .. } => "connecting",
            TargetState::Connected { .. } => "connected",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Disconnected | TargetState::Blocked => f.write_str(self.name()),
            TargetState::Connecting { relay } => write!(f, "connecting to {relay}"),
            TargetState::Connected { relay, tunnel } => {
                write!(f, "connected to {relay} via {}", tunnel.interface)
            }
        }
    }
}

/// Policy toggles and host parameters that shape every state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Disconnected blocks like `Blocked` instead of passing traffic through
    pub block_when_disconnected: bool,
    pub allow_loopback: bool,
    pub allow_dhcp: bool,
    pub allow_ndp: bool,
    /// Permits local networks both ways (`permit-lan` and `permit-lan-service`)
    pub allow_lan: bool,
    /// Empty means the private and link-local defaults
    pub lan_networks: Vec<String>,
    /// Resolvers permitted while connecting. Empty permits any resolver.
    pub dns_servers: Vec<String>,
    /// An extra endpoint kept reachable while blocked (API, bridge)
    pub allowed_endpoint: Option<RelayEndpoint>,
}

/// The complete rule list for one state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ruleset {
    pub state: TargetState,
    pub rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(state: TargetState, rules: Vec<Rule>) -> Self {
        Self { state, rules }
    }

    /// The ruleset that removes every kill-switch filter
    pub fn empty() -> Self {
        Self::new(TargetState::Disconnected, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Checks every rule without touching an installer.
    ///
    /// # Errors
    ///
    /// `ApplyError::InvalidRule` for the first rule that cannot build its
    /// filters.
    pub fn validate(&self) -> Result<(), ApplyError> {
        self.filters().map(|_| ())
    }

    /// Every filter the ruleset installs, in rule order.
    ///
    /// # Errors
    ///
    /// `ApplyError::InvalidRule` for the first invalid rule.
    pub fn filters(&self) -> Result<Vec<Filter>, ApplyError> {
        let mut filters = Vec::new();
        for rule in &self.rules {
            let built = rule.filters().map_err(|source| ApplyError::InvalidRule {
                rule: rule.name(),
                source,
            })?;
            filters.extend(built);
        }
        Ok(filters)
    }

    /// SHA-256 over the canonical JSON of the ruleset's filters.
    ///
    /// Two rulesets with equal fingerprints install identical filters.
    ///
    /// # Errors
    ///
    /// Returns `Error::Apply` for an invalid rule and `Error::Serialization`
    /// if the filters cannot be encoded.
    pub fn fingerprint(&self) -> crate::core::error::Result<String> {
        let filters = self.filters()?;
        let json = serde_json::to_vec(&filters)?;

        let mut hasher = Sha256::new();
        hasher.update(&json);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Composes the rules for `state`. Pure: the same inputs always give a
/// structurally identical ruleset.
pub fn compose(state: &TargetState, params: &Params) -> Ruleset {
    let mut rules = match state {
        TargetState::Disconnected if !params.block_when_disconnected => {
            return Ruleset::new(state.clone(), Vec::new());
        }
        TargetState::Disconnected | TargetState::Blocked => vec![Rule::BlockAll],
        TargetState::Connecting { relay } => vec![
            Rule::BlockAll,
            Rule::PermitVpnRelay(relay.permit()),
            Rule::PermitDns {
                servers: params.dns_servers.clone(),
            },
        ],
        TargetState::Connected { relay, tunnel } => vec![
            Rule::BlockAll,
            Rule::PermitVpnRelay(relay.permit()),
            Rule::PermitVpnTunnel {
                interface: tunnel.interface.clone(),
            },
            Rule::BlockDns,
            Rule::PermitTunnelDns {
                interface: tunnel.interface.clone(),
                servers: tunnel.dns_servers.clone(),
            },
        ],
    };

    if params.allow_loopback {
        rules.push(Rule::PermitLoopback);
    }
    if params.allow_dhcp {
        rules.push(Rule::PermitDhcp);
    }
    if params.allow_ndp {
        rules.push(Rule::PermitNdp);
    }
    if params.allow_lan {
        rules.push(Rule::PermitLan {
            networks: params.lan_networks.clone(),
        });
        rules.push(Rule::PermitLanService {
            networks: params.lan_networks.clone(),
        });
    }
    if let Some(endpoint) = &params.allowed_endpoint {
        rules.push(Rule::PermitEndpoint(endpoint.permit()));
    }

    debug!("Composed {} rules for {}", rules.len(), state);
    Ruleset::new(state.clone(), rules)
}

/// Installs `ruleset` as the complete active rule-set, atomically.
///
/// Every rule is validated before a session is opened, so an invalid
/// ruleset never reaches the installer. Any failure after that aborts the
/// session and leaves the previous rule-set in place.
///
/// # Errors
///
/// - `ApplyError::InvalidRule`: a rule's parameters are invalid
/// - `ApplyError::FilterRejected`: the installer refused a filter
/// - `ApplyError::Session`: the session could not be opened or committed
pub fn install(ruleset: &Ruleset, installer: &mut dyn Installer) -> Result<(), ApplyError> {
    ruleset.validate()?;

    let backend = installer.backend();
    info!(
        "Installing {} rules for {} via {}",
        ruleset.len(),
        ruleset.state,
        backend
    );

    let mut session = installer.begin()?;

    for rule in &ruleset.rules {
        if let Err(e) = rule.apply(session.as_mut()) {
            warn!("Aborting transaction: {e}");
            session.abort();
            return Err(e);
        }
    }

    debug!("Committing {} staged filters", session.staged());
    session.commit()?;

    info!("Ruleset for {} is active", ruleset.state);
    Ok(())
}
