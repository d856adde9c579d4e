//! Kill-switch rule engine
//!
//! Leaf modules first:
//!
//! - [`predicate`]: validated address, port, protocol and interface values
//! - [`identity`]: stable filter keys, sublayers and the rule name catalog
//! - [`filter`]: the filter objects an installer receives
//! - [`rules`]: the catalog of firewall intents and how each becomes filters
//! - [`installer`]: the transactional installer contract
//! - [`memory`]: an in-memory engine implementing it
//! - [`nft`]: the nftables back end
//! - [`composer`]: state to ruleset composition and atomic install
//! - [`killswitch`]: the stateful facade the rest of ksfw drives
//! - [`error`]: error types

pub mod composer;
pub mod error;
pub mod filter;
pub mod identity;
pub mod installer;
pub mod killswitch;
pub mod memory;
pub mod nft;
pub mod predicate;
pub mod rules;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
