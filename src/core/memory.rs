//! In-memory packet filter engine
//!
//! [`MemoryEngine`] implements [`Installer`] with the same commit semantics
//! as a kernel engine: staged filters are invisible until commit, a commit
//! replaces the whole active rule-set, and a failed or aborted session leaves
//! the active rule-set untouched. It also records every call it receives and
//! can be told to fail at a chosen point, which is what the transaction tests
//! are built on.

use crate::core::error::InstallError;
use crate::core::filter::{Filter, Packet};
use crate::core::installer::{Installer, Transaction};
use crate::core::predicate::Action;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One call received by the engine, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerCall {
    Begin,
    AddFilter(Uuid),
    Commit,
    Abort,
}

/// Where the next session should fail. One-shot: cleared once triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    Begin,
    /// The `n`th `add_filter` of the session, counting from 1
    AddFilter(usize),
    Commit,
}

#[derive(Debug)]
pub struct MemoryEngine {
    active: Vec<Filter>,
    journal: Vec<InstallerCall>,
    failure: Option<FailurePoint>,
    generation: u64,
    default_action: Action,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// An empty engine that permits traffic no filter matches
    pub fn new() -> Self {
        Self {
            active: Vec::new(),
            journal: Vec::new(),
            failure: None,
            generation: 0,
            default_action: Action::Permit,
        }
    }

    pub fn fail_at(&mut self, point: FailurePoint) {
        self.failure = Some(point);
    }

    pub fn journal(&self) -> &[InstallerCall] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    /// Number of `add_filter` calls received since the journal was cleared
    pub fn add_filter_calls(&self) -> usize {
        self.journal
            .iter()
            .filter(|c| matches!(c, InstallerCall::AddFilter(_)))
            .count()
    }

    /// Active filters in evaluation order
    pub fn active(&self) -> &[Filter] {
        &self.active
    }

    pub fn active_keys(&self) -> HashSet<Uuid> {
        self.active.iter().map(Filter::key).collect()
    }

    pub fn find(&self, key: Uuid) -> Option<&Filter> {
        self.active.iter().find(|f| f.key() == key)
    }

    /// Incremented on every successful commit
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The filter that decides `packet`, if any matches.
    pub fn decide(&self, packet: &Packet) -> Option<&Filter> {
        self.active.iter().find(|f| f.matches(packet))
    }

    /// What the engine does with `packet`.
    pub fn evaluate(&self, packet: &Packet) -> Action {
        self.decide(packet)
            .map_or(self.default_action, |filter| filter.action)
    }

    fn take_failure(&mut self, point: FailurePoint) -> bool {
        if self.failure == Some(point) {
            self.failure = None;
            true
        } else {
            false
        }
    }
}

impl Installer for MemoryEngine {
    fn begin(&mut self) -> Result<Box<dyn Transaction + '_>, InstallError> {
        self.journal.push(InstallerCall::Begin);

        if self.take_failure(FailurePoint::Begin) {
            warn!("Injected failure opening memory session");
            return Err(InstallError::Session("injected failure".to_string()));
        }

        Ok(Box::new(MemorySession {
            engine: self,
            staged: Vec::new(),
            keys: HashSet::new(),
            finished: false,
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession<'a> {
    engine: &'a mut MemoryEngine,
    staged: Vec<Filter>,
    keys: HashSet<Uuid>,
    finished: bool,
}

impl Transaction for MemorySession<'_> {
    fn add_filter(&mut self, filter: Filter) -> Result<(), InstallError> {
        self.engine
            .journal
            .push(InstallerCall::AddFilter(filter.key()));

        let call = self.staged.len() + 1;
        if self.engine.take_failure(FailurePoint::AddFilter(call)) {
            warn!("Injected failure on add_filter #{call}");
            return Err(InstallError::Rejected {
                filter: filter.name().to_string(),
                reason: "injected failure".to_string(),
            });
        }

        if !self.keys.insert(filter.key()) {
            return Err(InstallError::DuplicateFilter {
                filter: filter.name().to_string(),
                key: filter.key(),
            });
        }

        self.staged.push(filter);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), InstallError> {
        self.finished = true;
        self.engine.journal.push(InstallerCall::Commit);

        if self.engine.take_failure(FailurePoint::Commit) {
            warn!("Injected failure on commit");
            return Err(InstallError::Commit {
                message: "injected failure".to_string(),
                stderr: None,
                exit_code: None,
            });
        }

        let mut filters = std::mem::take(&mut self.staged);
        filters.sort_by(Filter::evaluation_order);

        self.engine.active = filters;
        self.engine.generation += 1;
        info!(
            "Memory engine committed {} filters (generation {})",
            self.engine.active.len(),
            self.engine.generation
        );
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.finished = true;
        self.engine.journal.push(InstallerCall::Abort);
        debug!("Memory session aborted, {} staged filters discarded", self.staged.len());
    }

    fn staged(&self) -> usize {
        self.staged.len()
    }
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.journal.push(InstallerCall::Abort);
            debug!("Memory session dropped without commit");
        }
    }
}
