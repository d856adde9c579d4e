//! Stable identities for every filter ksfw installs
//!
//! A filter key is a UUIDv5 derived from [`KEY_NAMESPACE`] and the rule's
//! catalog name plus its key revision. The same logical rule therefore maps
//! to the same key in every process run, which makes re-applying a ruleset
//! idempotent and lets a previously installed filter be addressed without
//! listing the engine's contents.
//!
//! # Key rotation
//!
//! When a rule's match semantics change, bump its [`RuleName::revision`].
//! The old key then no longer collides with the new filter, so a stale filter
//! left by an older version is never mistaken for the current one.

use crate::core::error::UnknownRuleName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use strum::IntoEnumIterator;
use uuid::Uuid;

/// Namespace all ksfw keys are derived from
pub const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6b73_6677_2d6b_696c_6c2d_7377_6974_6368);

static PROVIDER_KEY: LazyLock<Uuid> = LazyLock::new(|| derive_key("provider/ksfw"));

static CATALOG: LazyLock<HashMap<RuleName, FilterIdentity>> = LazyLock::new(|| {
    RuleName::iter()
        .map(|rule| (rule, FilterIdentity::derive(rule)))
        .collect()
});

fn derive_key(name: &str) -> Uuid {
    Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes())
}

/// Evaluation bucket a filter is placed in.
///
/// Sublayers are evaluated in [`Sublayer::EVALUATION_ORDER`]. A filter in an
/// earlier sublayer decides before any filter in a later one, whatever the
/// weights.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Sublayer {
    /// DNS leak protection. Evaluated first.
    #[strum(serialize = "dns")]
    Dns,
    /// General kill-switch policy
    #[strum(serialize = "baseline")]
    Baseline,
}

impl Sublayer {
    pub const EVALUATION_ORDER: [Sublayer; 2] = [Sublayer::Dns, Sublayer::Baseline];

    pub fn key(self) -> Uuid {
        static DNS: LazyLock<Uuid> = LazyLock::new(|| derive_key("sublayer/dns"));
        static BASELINE: LazyLock<Uuid> = LazyLock::new(|| derive_key("sublayer/baseline"));

        match self {
            Sublayer::Dns => *DNS,
            Sublayer::Baseline => *BASELINE,
        }
    }

    /// Position in the evaluation order; lower runs first.
    pub const fn rank(self) -> u8 {
        match self {
            Sublayer::Dns => 0,
            Sublayer::Baseline => 1,
        }
    }
}

/// The closed catalog of rule names
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RuleName {
    BlockAll,
    PermitLoopback,
    PermitDhcp,
    PermitNdp,
    PermitLan,
    PermitLanService,
    PermitDns,
    PermitVpnRelay,
    PermitEndpoint,
    PermitVpnTunnel,
    BlockDns,
    PermitTunnelDns,
}

impl RuleName {
    /// Key revision of the rule. Bump a rule's revision when its match
    /// semantics change.
    pub const fn revision(self) -> u32 {
        match self {
            RuleName::BlockAll
            | RuleName::PermitLoopback
            | RuleName::PermitDhcp
            | RuleName::PermitNdp
            | RuleName::PermitLan
            | RuleName::PermitLanService
            | RuleName::PermitDns
            | RuleName::PermitVpnRelay
            | RuleName::PermitEndpoint
            | RuleName::PermitVpnTunnel
            | RuleName::BlockDns
            | RuleName::PermitTunnelDns => 1,
        }
    }

    /// Sublayer the rule's identity is registered in. Relay-style rules may
    /// be placed elsewhere; see [`FilterIdentity::in_sublayer`].
    pub const fn default_sublayer(self) -> Sublayer {
        match self {
            RuleName::BlockDns | RuleName::PermitTunnelDns => Sublayer::Dns,
            _ => Sublayer::Baseline,
        }
    }

    pub fn identity(self) -> FilterIdentity {
        CATALOG
            .get(&self)
            .cloned()
            .unwrap_or_else(|| FilterIdentity::derive(self))
    }
}

/// Stable identity of one installed filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterIdentity {
    pub name: String,
    pub filter_key: Uuid,
    pub sublayer_key: Uuid,
    pub provider_key: Uuid,
}

impl FilterIdentity {
    fn derive(rule: RuleName) -> Self {
        Self {
            name: rule.as_ref().to_string(),
            filter_key: derive_key(&format!("filter/{rule}/r{}", rule.revision())),
            sublayer_key: rule.default_sublayer().key(),
            provider_key: *PROVIDER_KEY,
        }
    }

    /// Identity of the `n`th filter of a rule that emits several.
    ///
    /// Instance 0 is the rule's own identity. Other instances are derived
    /// from the base key, so they are as stable as the base key itself.
    pub fn instance(&self, n: usize) -> Self {
        if n == 0 {
            return self.clone();
        }

        Self {
            name: format!("{}#{n}", self.name),
            filter_key: Uuid::new_v5(&self.filter_key, n.to_string().as_bytes()),
            sublayer_key: self.sublayer_key,
            provider_key: self.provider_key,
        }
    }

    /// Same filter key, attached to another sublayer.
    pub fn in_sublayer(mut self, sublayer: Sublayer) -> Self {
        self.sublayer_key = sublayer.key();
        self
    }
}

impl fmt::Display for FilterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.filter_key)
    }
}

/// Looks up the identity registered for a catalog name.
///
/// # Errors
///
/// Returns `UnknownRuleName` if `name` is not in the catalog. The catalog is
/// fixed at build time, so this indicates a programming error.
pub fn lookup(name: &str) -> Result<FilterIdentity, UnknownRuleName> {
    name.parse::<RuleName>()
        .map(RuleName::identity)
        .map_err(|_| UnknownRuleName(name.to_string()))
}

/// The provider every ksfw filter is registered under
pub fn provider_key() -> Uuid {
    *PROVIDER_KEY
}

/// Every catalog identity, in catalog order.
pub fn catalog() -> Vec<(RuleName, FilterIdentity)> {
    RuleName::iter().map(|rule| (rule, rule.identity())).collect()
}
