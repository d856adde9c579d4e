//! ksfw - kill-switch firewall
//!
//! Composes the firewall rules that keep a host's traffic inside a VPN tunnel
//! and installs them as one all-or-nothing transaction.
//!
//! # Architecture
//!
//! - [`core`] - Rule catalog, state composition, installers and the kill switch
//! - [`audit`] - Audit log of every state change
//! - [`validators`] - Input validation for interface names and applications
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privileged `nft` invocation
//! - [`utils`] - XDG directories
//!
//! # Guarantees
//!
//! - A state change replaces the whole active rule-set or nothing at all
//! - Every state except pass-through disconnected ends with a block-all filter
//! - Filter keys are stable across runs, so re-applying a state is a no-op
//! - Optional `nft --check` verification before every commit

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::composer::{
    Params, RelayEndpoint, Ruleset, TargetState, TunnelParams, compose, install,
};
pub use core::error::{ApplyError, Error, InstallError, Result};
pub use core::identity::{RuleName, Sublayer};
pub use core::installer::{Installer, Transaction};
pub use core::killswitch::{ActiveRuleset, KillSwitch};
pub use core::rules::Rule;
