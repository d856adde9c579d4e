//! The transactional installer contract
//!
//! An [`Installer`] opens one [`Transaction`] at a time. Filters added to a
//! transaction are staged and become active together on
//! [`Transaction::commit`], or not at all. A transaction that is dropped
//! without committing is aborted by its implementation.
//!
//! Opening a transaction borrows the installer mutably, so two sessions on
//! the same installer cannot be open at once.

use crate::core::error::InstallError;
use crate::core::filter::Filter;

pub trait Installer {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns `InstallError::Session` if the back end cannot start one.
    fn begin(&mut self) -> Result<Box<dyn Transaction + '_>, InstallError>;

    /// Short back-end name for logs
    fn backend(&self) -> &'static str;
}

pub trait Transaction {
    /// Stages one filter.
    ///
    /// # Errors
    ///
    /// Returns `InstallError` if the back end refuses the filter. The
    /// transaction must then be aborted.
    fn add_filter(&mut self, filter: Filter) -> Result<(), InstallError>;

    /// Makes every staged filter active, replacing the previous rule-set.
    ///
    /// # Errors
    ///
    /// Returns `InstallError::Commit` if the back end refused the change.
    /// The previously active rule-set is left in place.
    fn commit(self: Box<Self>) -> Result<(), InstallError>;

    /// Discards every staged filter.
    fn abort(self: Box<Self>);

    /// Number of filters staged so far
    fn staged(&self) -> usize;
}
