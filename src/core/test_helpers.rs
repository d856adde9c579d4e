//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::composer::{Params, RelayEndpoint, TargetState, TunnelParams};
use crate::core::predicate::Protocol;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = env_lock();
/// unsafe {
///     std::env::set_var("KSFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("KSFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Locks [`ENV_VAR_MUTEX`], ignoring poisoning from a failed test.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_VAR_MUTEX.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` with every nft invocation routed to `tests/mock_nft.sh`.
///
/// `env` sets extra variables for the mock (`MOCK_NFT_FAIL`,
/// `MOCK_NFT_CAPTURE`). All of them are removed again afterwards.
pub fn with_mock_nft<T>(env: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    let _guard = env_lock();
    let mock_path = format!("{}/tests/mock_nft.sh", env!("CARGO_MANIFEST_DIR"));

    // SAFETY: every test touching the environment holds ENV_VAR_MUTEX.
    unsafe {
        std::env::set_var("KSFW_NFT_COMMAND", &mock_path);
        for (key, value) in env {
            std::env::set_var(key, value);
        }
    }

    let result = f();

    unsafe {
        std::env::remove_var("KSFW_NFT_COMMAND");
        for (key, _) in env {
            std::env::remove_var(key);
        }
    }

    result
}

/// The relay used throughout the tests: `10.0.0.1:443/tcp` for `app.exe`.
pub fn relay() -> RelayEndpoint {
    RelayEndpoint::new("10.0.0.1", 443, Protocol::Tcp).with_client("app.exe")
}

pub fn connecting_state() -> TargetState {
    TargetState::Connecting { relay: relay() }
}

pub fn connected_state() -> TargetState {
    TargetState::Connected {
        relay: relay(),
        tunnel: TunnelParams {
            interface: "wg0".to_string(),
            dns_servers: vec!["10.64.0.1".to_string()],
        },
    }
}

/// Every optional permit switched on.
pub fn permissive_params() -> Params {
    Params {
        block_when_disconnected: true,
        allow_loopback: true,
        allow_dhcp: true,
        allow_ndp: true,
        allow_lan: true,
        lan_networks: Vec::new(),
        dns_servers: vec!["192.0.2.53".to_string()],
        allowed_endpoint: Some(RelayEndpoint::new("198.51.100.7", 443, Protocol::Tcp)),
    }
}
