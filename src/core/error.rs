use crate::core::identity::RuleName;
use thiserror::Error;

/// Core error type for ksfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Predicate input was malformed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A rule name outside the compiled catalog was looked up
    #[error(transparent)]
    UnknownRuleName(#[from] UnknownRuleName),

    /// The packet-filter back end rejected the change
    #[error(transparent)]
    Install(#[from] InstallError),

    /// A rule-set transaction was aborted
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Malformed predicate input. Always a caller bug; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation error in {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Lookup of a name that is not part of the rule catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown rule name: {0}")]
pub struct UnknownRuleName(pub String);

/// Failures reported by an [`Installer`](crate::core::installer::Installer)
/// or one of its sessions.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The engine refused a single filter
    #[error("filter {filter} rejected: {reason}")]
    Rejected { filter: String, reason: String },

    /// A filter key was added twice within one session
    #[error("duplicate filter key {key} ({filter})")]
    DuplicateFilter { filter: String, key: uuid::Uuid },

    /// The engine refused the commit; the previous rule-set stays active
    #[error("commit failed: {message}")]
    Commit {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A session could not be opened
    #[error("session unavailable: {0}")]
    Session(String),

    /// The back-end process could not be started
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A rule-set transaction failed and was aborted as a whole.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A rule could not build a valid predicate from its parameters
    #[error("rule {rule} is invalid: {source}")]
    InvalidRule {
        rule: RuleName,
        #[source]
        source: ValidationError,
    },

    /// The installer refused one of a rule's filters
    #[error("rule {rule} could not be installed: {source}")]
    FilterRejected {
        rule: RuleName,
        #[source]
        source: InstallError,
    },

    /// Opening or committing the session failed
    #[error("transaction failed: {0}")]
    Session(#[from] InstallError),
}

impl ApplyError {
    /// The catalog rule that caused the failure, if one did.
    pub fn rule(&self) -> Option<RuleName> {
        match self {
            ApplyError::InvalidRule { rule, .. } | ApplyError::FilterRejected { rule, .. } => {
                Some(*rule)
            }
            ApplyError::Session(_) => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known nftables failure messages and what to tell the operator about them
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an nft error message against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run ksfw as root or set KSFW_ELEVATION_METHOD")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("The kernel rejected the kill-switch batch")
                .with_suggestion("The previous kill-switch rules are still active")
                .with_suggestion("Run `ksfw show <state> --format json` and check the batch");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)");
        }

        if lower.contains("interface")
            && (lower.contains("invalid") || lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Tunnel interface not found or invalid")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Retry the state change; nothing was applied");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_names_field() {
        let err = ValidationError::new("relay.address", "empty address");
        assert_eq!(
            err.to_string(),
            "Validation error in relay.address: empty address"
        );
    }

    #[test]
    fn test_apply_error_reports_rule() {
        let err = ApplyError::InvalidRule {
            rule: RuleName::PermitVpnRelay,
            source: ValidationError::new("relay.address", "empty address"),
        };
        assert_eq!(err.rule(), Some(RuleName::PermitVpnRelay));
        assert!(err.to_string().contains("permit-vpn-relay"));

        let err = ApplyError::Session(InstallError::Session("busy".into()));
        assert_eq!(err.rule(), None);
    }

    #[test]
    fn test_nftables_missing_command() {
        let translation = NftablesErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_nftables_syntax_error_keeps_previous_rules() {
        let translation = NftablesErrorPattern::match_error("could not process rule: syntax error");
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("still active"))
        );
    }

    #[test]
    fn test_rejected_batch_is_not_missing_binary() {
        let translation = NftablesErrorPattern::match_error(
            "Error: Could not process rule: No such file or directory",
        );
        assert!(translation.user_message.contains("rejected"));

        let translation = NftablesErrorPattern::match_error("No such file or directory (os error 2)");
        assert!(translation.user_message.contains("not installed"));
    }

    #[test]
    fn test_netlink_error() {
        let translation = NftablesErrorPattern::match_error("netlink error occurred");
        assert!(translation.user_message.contains("netlink"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("modprobe"))
        );
    }
}
