//! nftables back end
//!
//! [`NftInstaller`] stages filters in memory and turns a commit into a single
//! `nft --json -f -` batch. The batch recreates the `inet ksfw` table from
//! scratch (add, flush, chains, rules), and nft applies a batch as one kernel
//! transaction, so the previous kill-switch table stays in force until the
//! new one is complete.
//!
//! Filters map onto the `input` and `output` chains in evaluation order
//! (DNS sublayer first, then descending weight). A permit in one direction
//! also admits the conntrack replies of its flow in the other direction,
//! which is what a connection-oriented engine does implicitly.
//!
//! Application conditions cannot be expressed in nftables. A filter carrying
//! one is rejected rather than installed without it, so the session aborts
//! and the previous table stays in force.

use crate::core::error::InstallError;
use crate::core::filter::Filter;
use crate::core::installer::{Installer, Transaction};
use crate::core::predicate::{Action, Address, Condition, Direction, Protocol};
use crate::validators::sanitize_comment;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::process::{Output, Stdio};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const TABLE: &str = "ksfw";
pub const FAMILY: &str = "inet";
const CHAIN_PRIORITY: i32 = -10;
const CHAINS: [&str; 2] = ["input", "output"];

/// Result of an `nft --check` run
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    /// The packet travels in the filter's own direction
    Forward,
    /// Conntrack replies to a permitted flow
    Reply,
}

/// One match expression of an nft rule
#[derive(Debug, Clone, PartialEq, Eq)]
enum Match {
    Established,
    L4proto(&'static str),
    L4protoSet(&'static [&'static str]),
    Addr {
        family: &'static str,
        field: &'static str,
        value: String,
    },
    Port {
        protocol: &'static str,
        field: &'static str,
        port: u16,
    },
    Iface {
        key: &'static str,
        name: String,
    },
}

impl Match {
    fn json(&self) -> Value {
        match self {
            Match::Established => json!({
                "match": {
                    "left": { "ct": { "key": "state" } },
                    "op": "in",
                    "right": { "set": ["established", "related"] }
                }
            }),
            Match::L4proto(proto) => meta_match("l4proto", proto),
            Match::L4protoSet(protos) => meta_match("l4proto", json!({ "set": protos })),
            Match::Addr {
                family,
                field,
                value,
            } => payload_match(family, field, json!(value)),
            Match::Port {
                protocol,
                field,
                port,
            } => payload_match(protocol, field, json!(port)),
            Match::Iface { key, name } => meta_match(key, name),
        }
    }

    fn text(&self) -> String {
        match self {
            Match::Established => "ct state established,related".to_string(),
            Match::L4proto(proto) => format!("meta l4proto {proto}"),
            Match::L4protoSet(protos) => format!("meta l4proto {{ {} }}", protos.join(", ")),
            Match::Addr {
                family,
                field,
                value,
            } => format!("{family} {field} {value}"),
            Match::Port {
                protocol,
                field,
                port,
            } => format!("{protocol} {field} {port}"),
            Match::Iface { key, name } => format!("{key} \"{name}\""),
        }
    }
}

fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn payload_match(protocol: &str, field: &str, value: Value) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": value
        }
    })
}

/// A filter rendered for one chain
#[derive(Debug, Clone)]
struct NftRule {
    chain: &'static str,
    matches: Vec<Match>,
    verdict: &'static str,
    comment: String,
}

impl NftRule {
    fn json(&self) -> Value {
        let mut expr: Vec<Value> = self.matches.iter().map(Match::json).collect();
        expr.push(json!({ (self.verdict): null }));

        json!({
            "add": {
                "rule": {
                    "family": FAMILY,
                    "table": TABLE,
                    "chain": self.chain,
                    "expr": expr,
                    "comment": self.comment
                }
            }
        })
    }

    fn text(&self) -> String {
        let mut parts: Vec<String> = self.matches.iter().map(Match::text).collect();
        parts.push(self.verdict.to_string());
        parts.push(format!("comment \"{}\"", self.comment));
        parts.join(" ")
    }
}

/// Comment attached to every rule of a filter: `ksfw:<key> <name>`
pub fn filter_comment(filter: &Filter) -> String {
    sanitize_comment(&format!("ksfw:{} {}", filter.key(), filter.name()))
}

/// Extracts the filter key from a comment written by [`filter_comment`].
pub fn key_from_comment(comment: &str) -> Option<Uuid> {
    comment
        .strip_prefix("ksfw:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|key| key.parse().ok())
}

/// Checks that nftables can enforce every condition of `filter`.
///
/// # Errors
///
/// Returns `InstallError::Rejected` for an application condition.
pub fn check_expressible(filter: &Filter) -> Result<(), InstallError> {
    match filter
        .conditions
        .iter()
        .find(|c| matches!(c, Condition::Application(_)))
    {
        Some(condition) => Err(InstallError::Rejected {
            filter: filter.name().to_string(),
            reason: format!("application match unsupported by nftables ({condition})"),
        }),
        None => Ok(()),
    }
}

fn placements(filter: &Filter) -> Vec<(&'static str, Orientation)> {
    let reply = filter.action == Action::Permit;
    match filter.direction {
        Direction::Outbound if reply => vec![
            ("output", Orientation::Forward),
            ("input", Orientation::Reply),
        ],
        Direction::Outbound => vec![("output", Orientation::Forward)],
        Direction::Inbound if reply => vec![
            ("input", Orientation::Forward),
            ("output", Orientation::Reply),
        ],
        Direction::Inbound => vec![("input", Orientation::Forward)],
        Direction::Any => vec![
            ("input", Orientation::Forward),
            ("output", Orientation::Forward),
        ],
    }
}

fn render(filter: &Filter, chain: &'static str, orientation: Orientation) -> NftRule {
    let inbound = chain == "input";
    let (remote_addr, remote_port, local_port, iface) = if inbound {
        ("saddr", "sport", "dport", "iifname")
    } else {
        ("daddr", "dport", "sport", "oifname")
    };

    let protocol = filter.protocol();
    let address = filter.remote_address();
    let has_port = filter
        .conditions
        .iter()
        .any(|c| matches!(c, Condition::RemotePort(_) | Condition::LocalPort(_)));

    let mut matches = Vec::with_capacity(filter.conditions.len() + 2);

    if orientation == Orientation::Reply {
        matches.push(Match::Established);
    }

    match protocol {
        Protocol::Tcp | Protocol::Udp => matches.push(Match::L4proto(protocol.as_str())),
        Protocol::Icmp => match address.is_ipv6() {
            Some(true) => matches.push(Match::L4proto("ipv6-icmp")),
            Some(false) => matches.push(Match::L4proto("icmp")),
            None => matches.push(Match::L4protoSet(&["icmp", "ipv6-icmp"])),
        },
        Protocol::Any if has_port => matches.push(Match::L4protoSet(&["tcp", "udp"])),
        Protocol::Any => {}
    }

    let port_protocol = if protocol.is_transport() {
        protocol.as_str()
    } else {
        "th"
    };

    for condition in &filter.conditions {
        match condition {
            Condition::Protocol(_) | Condition::Application(_) => {}
            Condition::RemoteAddress(Address::Unspecified) => {}
            Condition::RemoteAddress(addr) => matches.push(Match::Addr {
                family: if addr.is_ipv6() == Some(true) {
                    "ip6"
                } else {
                    "ip"
                },
                field: remote_addr,
                value: addr.to_string(),
            }),
            Condition::RemotePort(port) => matches.push(Match::Port {
                protocol: port_protocol,
                field: remote_port,
                port: port.get(),
            }),
            Condition::LocalPort(port) => matches.push(Match::Port {
                protocol: port_protocol,
                field: local_port,
                port: port.get(),
            }),
            Condition::Interface(name) => matches.push(Match::Iface {
                key: iface,
                name: name.to_string(),
            }),
        }
    }

    NftRule {
        chain,
        matches,
        verdict: match filter.action {
            Action::Permit => "accept",
            Action::Block => "drop",
        },
        comment: filter_comment(filter),
    }
}

fn rules_in_order(filters: &[Filter]) -> Result<Vec<NftRule>, InstallError> {
    let mut ordered: Vec<&Filter> = filters.iter().collect();
    ordered.sort_by(|a, b| Filter::evaluation_order(a, b));

    let mut rules = Vec::with_capacity(ordered.len() * 2);
    for filter in ordered {
        check_expressible(filter)?;
        rules.extend(
            placements(filter)
                .into_iter()
                .map(|(chain, orientation)| render(filter, chain, orientation)),
        );
    }
    Ok(rules)
}

/// Builds the nftables JSON batch that makes `filters` the whole kill-switch
/// table. An empty filter set removes the table.
///
/// # Errors
///
/// Returns `InstallError::Rejected` if a filter cannot be expressed.
pub fn to_nftables_json(filters: &[Filter]) -> Result<Value, InstallError> {
    let table = json!({ "table": { "family": FAMILY, "name": TABLE } });

    if filters.is_empty() {
        // add-then-delete succeeds whether or not the table exists
        return Ok(json!({ "nftables": [ { "add": table }, { "delete": table } ] }));
    }

    let rules = rules_in_order(filters)?;
    let mut batch = Vec::with_capacity(2 + CHAINS.len() + rules.len());

    batch.push(json!({ "add": table }));
    batch.push(json!({ "flush": table }));

    for chain in CHAINS {
        batch.push(json!({
            "add": {
                "chain": {
                    "family": FAMILY,
                    "table": TABLE,
                    "name": chain,
                    "type": "filter",
                    "hook": chain,
                    "prio": CHAIN_PRIORITY,
                    "policy": "accept"
                }
            }
        }));
    }

    batch.extend(rules.iter().map(NftRule::json));

    Ok(json!({ "nftables": batch }))
}

/// Human-readable nft text of the same table, for previews.
///
/// # Errors
///
/// Returns `InstallError::Rejected` if a filter cannot be expressed.
pub fn to_nft_text(filters: &[Filter]) -> Result<String, InstallError> {
    if filters.is_empty() {
        return Ok(format!("# no kill-switch filters: table {FAMILY} {TABLE} is removed\n"));
    }

    let rules = rules_in_order(filters)?;
    let mut out = String::new();

    let _ = writeln!(out, "table {FAMILY} {TABLE} {{");
    for (i, chain) in CHAINS.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "    chain {chain} {{");
        let _ = writeln!(
            out,
            "        type filter hook {chain} priority {CHAIN_PRIORITY}; policy accept;\n"
        );
        for rule in rules.iter().filter(|r| r.chain == *chain) {
            let _ = writeln!(out, "        {}", rule.text());
        }
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");

    Ok(out)
}

/// Pipes `payload` to an (elevated) `nft` with `args`.
fn run_nft(args: &[&str], payload: &str) -> Result<Output, InstallError> {
    let mut child = crate::elevation::create_elevated_nft_command(args)
        .map_err(|e| InstallError::Spawn {
            program: "nft".to_string(),
            reason: e.to_string(),
        })?
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn nft: {e}");
            InstallError::Spawn {
                program: "nft".to_string(),
                reason: e.to_string(),
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.as_bytes())?;
    }

    Ok(child.wait_with_output()?)
}

/// Verifies a batch without applying it using `nft --json --check`.
///
/// # Errors
///
/// Returns `Err` only if nft could not be run. A rejected batch is reported
/// through `VerifyResult::errors`.
pub fn verify_batch(batch: &Value) -> Result<VerifyResult, InstallError> {
    let payload = serde_json::to_string(batch)?;

    info!("Verifying kill-switch batch via nft --json --check");
    let output = run_nft(&["--json", "--check", "-f", "-"], &payload)?;

    if output.status.success() {
        info!("Batch verification passed");
        Ok(VerifyResult::success())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Batch verification failed: {stderr}");
        Ok(VerifyResult::failure(parse_nft_errors(&stderr)))
    }
}

/// Parses nft error output into one message per error.
///
/// Understands the JSON error format and falls back to one message per
/// non-empty line.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

/// Installs filters as the `inet ksfw` nftables table
#[derive(Debug, Default)]
pub struct NftInstaller {
    verify_before_commit: bool,
    committed: usize,
}

impl NftInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `nft --check` on every batch before applying it.
    pub fn verify_before_commit(mut self, verify: bool) -> Self {
        self.verify_before_commit = verify;
        self
    }

    /// Filters in the last successfully committed batch
    pub fn committed(&self) -> usize {
        self.committed
    }

    fn apply(&mut self, filters: &[Filter]) -> Result<(), InstallError> {
        let batch = to_nftables_json(filters)?;

        if self.verify_before_commit {
            let result = verify_batch(&batch)?;
            if !result.success {
                return Err(InstallError::Commit {
                    message: result.errors.join("; "),
                    stderr: None,
                    exit_code: None,
                });
            }
        }

        let payload = serde_json::to_string(&batch)?;
        info!("Applying kill-switch batch with {} filters", filters.len());

        let output = run_nft(&["--json", "-f", "-"], &payload)?;

        if output.status.success() {
            self.committed = filters.len();
            info!("Kill-switch batch applied");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!("Kill-switch batch rejected: {stderr}");
            Err(InstallError::Commit {
                message: parse_nft_errors(&stderr).join("; "),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

impl Installer for NftInstaller {
    fn begin(&mut self) -> Result<Box<dyn Transaction + '_>, InstallError> {
        debug!("Opening nft session");
        Ok(Box::new(NftSession {
            installer: self,
            staged: Vec::new(),
            keys: HashSet::new(),
        }))
    }

    fn backend(&self) -> &'static str {
        "nftables"
    }
}

struct NftSession<'a> {
    installer: &'a mut NftInstaller,
    staged: Vec<Filter>,
    keys: HashSet<Uuid>,
}

impl Transaction for NftSession<'_> {
    fn add_filter(&mut self, filter: Filter) -> Result<(), InstallError> {
        if !self.keys.insert(filter.key()) {
            return Err(InstallError::DuplicateFilter {
                filter: filter.name().to_string(),
                key: filter.key(),
            });
        }

        if let Err(e) = check_expressible(&filter) {
            warn!("Refusing filter nftables cannot enforce: {e}");
            return Err(e);
        }

        self.staged.push(filter);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), InstallError> {
        let NftSession {
            installer, staged, ..
        } = *self;
        installer.apply(&staged)
    }

    fn abort(self: Box<Self>) {
        debug!("nft session aborted, {} staged filters discarded", self.staged.len());
    }

    fn staged(&self) -> usize {
        self.staged.len()
    }
}
