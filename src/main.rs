//! ksfw - kill-switch firewall
//!
//! Command-line front end for the kill-switch rule engine. Each state change
//! composes the complete rule-set for the requested state and installs it as
//! one nftables transaction.
//!
//! # Usage
//!
//! ```bash
//! ksfw show connecting --relay 185.65.134.1:51820       # Preview nft rules
//! ksfw show blocked --format json                        # Preview the JSON batch
//! ksfw check connected --relay 185.65.134.1:51820 --tunnel wg0
//! ksfw apply connecting --relay 185.65.134.1:51820 --protocol udp
//! ksfw apply connected --relay 185.65.134.1:51820 --tunnel wg0 --tunnel-dns 10.64.0.1
//! ksfw reset                                             # Remove every kill-switch rule
//! ksfw keys                                              # List stable filter keys
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use ksfw::audit;
use ksfw::config::{self, KillSwitchConfig};
use ksfw::core::composer::{self, Params, RelayEndpoint, TargetState, TunnelParams};
use ksfw::core::error::{ApplyError, Error, InstallError, NftablesErrorPattern};
use ksfw::core::identity::{self, Sublayer};
use ksfw::core::killswitch::KillSwitch;
use ksfw::core::nft::{self, NftInstaller};
use ksfw::core::predicate::Protocol;
use std::process::ExitCode;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "ksfw")]
#[command(about = "Kill-switch firewall - atomic VPN blocking rules for nftables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the rules for a state without applying them
    Show {
        #[command(flatten)]
        target: StateArgs,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Nft)]
        format: Format,
    },
    /// Verify the rules for a state with `nft --check`
    Check {
        #[command(flatten)]
        target: StateArgs,
    },
    /// Install the rules for a state
    Apply {
        #[command(flatten)]
        target: StateArgs,
        /// Skip the `nft --check` pass even if the config enables it
        #[arg(long)]
        no_verify: bool,
    },
    /// Remove every kill-switch rule
    Reset,
    /// List the stable keys of every catalog filter
    Keys,
    /// Show the configuration
    Config {
        /// Write the configuration back, filling in defaults
        #[arg(long)]
        save: bool,
    },
    /// Show build information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum StateName {
    Disconnected,
    Blocked,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// nftables text
    Nft,
    /// nftables JSON batch
    Json,
    /// Composed rules, one per line
    Rules,
}

#[derive(Args)]
struct StateArgs {
    /// Target kill-switch state
    #[arg(value_enum)]
    state: StateName,
    /// VPN relay endpoint as `ip:port` (`[v6]:port` for IPv6)
    #[arg(long, value_name = "ADDR:PORT")]
    relay: Option<String>,
    /// Relay transport protocol
    #[arg(long, default_value = "udp")]
    protocol: String,
    /// Application allowed to reach the relay (defaults to the configured client).
    /// nftables cannot match applications, so `check` and `apply` refuse it.
    #[arg(long)]
    client: Option<String>,
    /// Tunnel interface (connected state)
    #[arg(long)]
    tunnel: Option<String>,
    /// Resolver reached through the tunnel; repeatable
    #[arg(long = "tunnel-dns", value_name = "IP")]
    tunnel_dns: Vec<String>,
}

impl StateArgs {
    fn relay(&self, config: &KillSwitchConfig) -> Result<RelayEndpoint, String> {
        let text = self
            .relay
            .as_deref()
            .ok_or("this state needs --relay ADDR:PORT")?;
        let (address, port) = split_endpoint(text)?;
        let protocol = Protocol::parse("--protocol", &self.protocol).map_err(|e| e.to_string())?;

        let mut relay = RelayEndpoint::new(address, port, protocol);
        relay.client = self.client.clone().or_else(|| config.relay_client.clone());
        Ok(relay)
    }

    fn target(&self, config: &KillSwitchConfig) -> Result<TargetState, String> {
        Ok(match self.state {
            StateName::Disconnected => TargetState::Disconnected,
            StateName::Blocked => TargetState::Blocked,
            StateName::Connecting => TargetState::Connecting {
                relay: self.relay(config)?,
            },
            StateName::Connected => TargetState::Connected {
                relay: self.relay(config)?,
                tunnel: TunnelParams {
                    interface: self
                        .tunnel
                        .clone()
                        .ok_or("the connected state needs --tunnel IFACE")?,
                    dns_servers: self.tunnel_dns.clone(),
                },
            },
        })
    }
}

/// Splits `ip:port` or `[ipv6]:port`. The address itself is validated later
/// by the rule that uses it.
fn split_endpoint(text: &str) -> Result<(String, u16), String> {
    let (address, port) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("'{text}' is not ADDR:PORT"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("'{port}' is not a valid port"))?;
    let address = address.trim_start_matches('[').trim_end_matches(']');
    Ok((address.to_string(), port))
}

fn init_logging() {
    if let Some(log_path) = ksfw::utils::log_file()
        && let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
    {
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }
}

fn main() -> ExitCode {
    let _ = ksfw::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Prints operator guidance for nft failures.
fn explain(error: &Error) {
    let message = match error {
        Error::Apply(
            ApplyError::Session(install)
            | ApplyError::FilterRejected {
                source: install, ..
            },
        )
        | Error::Install(install) => match install {
            InstallError::Commit { message, stderr, .. } => {
                stderr.clone().unwrap_or_else(|| message.clone())
            }
            InstallError::Spawn { reason, .. } => reason.clone(),
            _ => return,
        },
        _ => return,
    };

    let translation = NftablesErrorPattern::match_error(&message);
    eprintln!("{}", translation.user_message);
    for suggestion in translation.suggestions {
        eprintln!("  - {suggestion}");
    }
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Show { target, format } => {
            let config = config::load_config().await;
            let state = target.target(&config)?;
            let ruleset = composer::compose(&state, &Params::from(&config));

            match format {
                Format::Rules => {
                    println!("# {state}");
                    for rule in &ruleset.rules {
                        println!("{rule}");
                    }
                }
                Format::Nft => print!("{}", nft::to_nft_text(&ruleset.filters()?)?),
                Format::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&nft::to_nftables_json(&ruleset.filters()?)?)?
                ),
            }
        }
        Commands::Check { target } => {
            let config = config::load_config().await;
            let state = target.target(&config)?;
            let ruleset = composer::compose(&state, &Params::from(&config));
            let batch = nft::to_nftables_json(&ruleset.filters()?)?;

            println!("Verifying rules for {state}...");
            let result = match nft::verify_batch(&batch) {
                Ok(result) => result,
                Err(e) => {
                    let e = Error::from(e);
                    audit::log_verify(false, 0, Some(e.to_string())).await;
                    explain(&e);
                    return Err(e.into());
                }
            };

            audit::log_verify(result.success, result.errors.len(), None).await;
            if !result.success {
                return Err(format!("Verification failed:\n{}", result.errors.join("\n")).into());
            }
            println!("✓ Rules verified.");
        }
        Commands::Apply { target, no_verify } => {
            let config = config::load_config().await;
            let state = target.target(&config)?;
            let params = Params::from(&config);

            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will use run0/sudo/pkexec for nft.");
            }

            let installer =
                NftInstaller::new().verify_before_commit(config.verify_before_commit && !no_verify);
            let mut switch = KillSwitch::new(installer);

            let ruleset = composer::compose(&state, &params);
            let rule_count = ruleset.len();

            match switch.set_state(&state, &params) {
                Ok(active) => {
                    let details = audit::state_details(
                        &state,
                        rule_count,
                        active.filter_count,
                        Some(&active.fingerprint),
                    );
                    println!(
                        "✓ Kill switch is {state} ({} filters).",
                        active.filter_count
                    );
                    audit::log_set_state(details, true, None).await;
                }
                Err(e) => {
                    let details = audit::state_details(&state, rule_count, 0, None);
                    audit::log_set_state(details, false, Some(e.to_string())).await;
                    explain(&e);
                    return Err(e.into());
                }
            }
        }
        Commands::Reset => {
            let mut switch = KillSwitch::new(NftInstaller::new());
            match switch.reset() {
                Ok(_) => {
                    audit::log_reset(true, None).await;
                    println!("✓ Kill-switch rules removed.");
                }
                Err(e) => {
                    audit::log_reset(false, Some(e.to_string())).await;
                    explain(&e);
                    return Err(e.into());
                }
            }
        }
        Commands::Keys => {
            println!("provider            {}", identity::provider_key());
            for sublayer in Sublayer::EVALUATION_ORDER {
                println!("sublayer {:<10} {}", sublayer.as_ref(), sublayer.key());
            }
            for (rule, id) in identity::catalog() {
                println!(
                    "{:<19} {} r{} {}",
                    rule.as_ref(),
                    id.filter_key,
                    rule.revision(),
                    rule.default_sublayer()
                );
            }
        }
        Commands::Config { save } => {
            let config = config::load_config().await;
            if let Some(path) = config::config_path() {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config::save_config(&config).await?;
                println!("✓ Configuration saved.");
            }
        }
        Commands::Version => {
            println!("ksfw {}", build::PKG_VERSION);
            let dirty = if build::GIT_CLEAN { "" } else { "-dirty" };
            println!("commit:  {}{dirty}", build::SHORT_COMMIT);
            println!("branch:  {}", build::BRANCH);
            println!("built:   {}", build::BUILD_TIME);
            println!("rustc:   {}", build::RUST_VERSION);
            println!("nft:     {}", ksfw::elevation::NFT_PROGRAM);
        }
    }
    Ok(())
}
