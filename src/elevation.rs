//! Privilege elevation for `nft`
//!
//! ksfw normally runs unprivileged and only elevates the `nft` invocations
//! that read or replace the kill-switch table. Only the `nft` binary can be
//! elevated, and arguments are passed without shell interpolation.
//!
//! # Elevation Strategy
//!
//! 1. `KSFW_NFT_COMMAND` set: run that program instead of `nft`, unelevated
//! 2. Running as root: run `nft` directly
//! 3. `KSFW_ELEVATION_METHOD` set: `sudo`, `run0` or `pkexec`
//! 4. Otherwise `run0` when available, then `sudo` on a terminal, then `pkexec`
//!
//! # Environment Variables
//!
//! - `KSFW_NFT_COMMAND`: Replaces the nft binary entirely. The test suite
//!   points it at `tests/mock_nft.sh`.
//! - `KSFW_ELEVATION_METHOD`: Force a specific elevation method. Useful with
//!   sudoers `NOPASSWD` rules, e.g. `KSFW_ELEVATION_METHOD=sudo ksfw reset`.
//!
//! # Example
//!
//! ```no_run
//! use ksfw::elevation::create_elevated_nft_command;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let output = create_elevated_nft_command(&["--json", "list", "table", "inet", "ksfw"])?
//!     .output()?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::process::Command;

/// Path of the system nft binary. Distributions can pin it at build time.
pub const NFT_PROGRAM: &str = match option_env!("KSFW_SYSTEM_NFT_PATH") {
    Some(path) => path,
    None => "nft",
};

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `KSFW_ELEVATION_METHOD`
    #[error("Invalid KSFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrapped(method: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if let Ok(replacement) = std::env::var("KSFW_NFT_COMMAND")
        && !replacement.is_empty()
    {
        let mut cmd = Command::new(replacement);
        cmd.args(args);
        return Ok(cmd);
    }

    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if let Ok(method) = std::env::var("KSFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        return Ok(wrapped("sudo", program, args));
    }

    if !binary_exists("pkexec") {
        return Err(ElevationError::PkexecNotFound);
    }
    Ok(wrapped("pkexec", program, args))
}

/// Creates an elevated `nft` command with the specified arguments.
///
/// # Errors
///
/// Returns `ElevationError` if the requested or detected elevation method is
/// unavailable.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(NFT_PROGRAM, args)
}
