//! The kill switch facade
//!
//! [`KillSwitch`] owns an installer and remembers which ruleset is active.
//! A failed state change leaves both the installer's active rule-set and the
//! recorded ruleset untouched, so the switch never believes it is in a state
//! it failed to reach.

use crate::core::composer::{self, Params, Ruleset, TargetState};
use crate::core::error::Result;
use crate::core::installer::Installer;
use chrono::{DateTime, Utc};
use tracing::{error, info};

/// The ruleset last installed successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRuleset {
    pub ruleset: Ruleset,
    pub fingerprint: String,
    pub filter_count: usize,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct KillSwitch<I: Installer> {
    installer: I,
    active: Option<ActiveRuleset>,
}

impl<I: Installer> KillSwitch<I> {
    pub fn new(installer: I) -> Self {
        Self {
            installer,
            active: None,
        }
    }

    /// Composes the rules for `state` and installs them as the complete
    /// active rule-set.
    ///
    /// # Errors
    ///
    /// Returns `Error::Apply` if the ruleset is invalid or the installer
    /// refused it. The previous rule-set stays active.
    pub fn set_state(&mut self, state: &TargetState, params: &Params) -> Result<&ActiveRuleset> {
        let ruleset = composer::compose(state, params);
        self.install(ruleset)
    }

    /// Removes every kill-switch filter.
    ///
    /// # Errors
    ///
    /// Returns `Error::Apply` if the installer refused the empty rule-set.
    pub fn reset(&mut self) -> Result<&ActiveRuleset> {
        info!("Resetting kill switch");
        self.install(Ruleset::empty())
    }

    fn install(&mut self, ruleset: Ruleset) -> Result<&ActiveRuleset> {
        let fingerprint = ruleset.fingerprint()?;
        let filter_count = ruleset.filters()?.len();

        if let Err(e) = composer::install(&ruleset, &mut self.installer) {
            error!("Kill switch stays in its previous state: {e}");
            return Err(e.into());
        }

        info!(
            "Kill switch is {} ({} filters, fingerprint {})",
            ruleset.state,
            filter_count,
            &fingerprint[..12]
        );

        Ok(self.active.insert(ActiveRuleset {
            ruleset,
            fingerprint,
            filter_count,
            applied_at: Utc::now(),
        }))
    }

    pub fn active(&self) -> Option<&ActiveRuleset> {
        self.active.as_ref()
    }

    /// `true` when `ruleset` would install exactly the active filters.
    pub fn is_active(&self, ruleset: &Ruleset) -> bool {
        match (&self.active, ruleset.fingerprint()) {
            (Some(active), Ok(fingerprint)) => active.fingerprint == fingerprint,
            _ => false,
        }
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn installer_mut(&mut self) -> &mut I {
        &mut self.installer
    }

    pub fn into_inner(self) -> I {
        self.installer
    }
}
