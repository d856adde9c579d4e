//! Input validation and sanitization functions for ksfw
//!
//! Everything that ends up in a predicate or an nft batch passes through here
//! first. The checks return plain `String` messages; the predicate layer
//! attaches the offending field name.

/// Maximum accepted length of an application identity (`PATH_MAX`)
pub const MAX_APPLICATION_LEN: usize = 4096;

/// Sanitizes a string for safe use in nftables comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 128 bytes, the nftables comment limit.
///
/// # Examples
///
/// ```
/// use ksfw::validators::sanitize_comment;
///
/// let safe = sanitize_comment("permit-vpn-relay");
/// assert_eq!(safe, "permit-vpn-relay");
///
/// let safe = sanitize_comment("Test\nNewline\"Quote");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: ASCII-only so multi-byte input cannot smuggle past the length cap
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '#' | '/')
        })
        .take(128)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if the name is empty or violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates the identity of an originating application.
///
/// The identity is the executable path (or image name) the kernel reports
/// for the socket owner. It is matched verbatim, so it is not normalised.
///
/// # Errors
///
/// Returns `Err` if the identity is empty, too long, or contains control
/// characters or quotes.
pub fn validate_application(path: &str) -> Result<String, String> {
    if path.trim().is_empty() {
        return Err("Application identity is empty".to_string());
    }

    if path.len() > MAX_APPLICATION_LEN {
        return Err(format!(
            "Application identity too long (max {MAX_APPLICATION_LEN} bytes)"
        ));
    }

    if path.chars().any(|c| c.is_control() || c == '"') {
        return Err("Application identity contains control characters or quotes".to_string());
    }

    Ok(path.to_string())
}

/// Checks if an IP is in a reserved range and returns informational warning.
///
/// Informational only. A relay endpoint in one of these ranges is almost
/// always a configuration mistake, but it is not rejected.
pub fn check_reserved_ip(ip: std::net::IpAddr) -> Option<String> {
    use std::net::IpAddr;

    match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();

            // RFC 1918 private ranges
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return Some("Private IP range (RFC 1918) - relay is on the LAN".to_string());
            }

            if octets[0] == 127 {
                return Some("Loopback range (127.x) - relay is this host".to_string());
            }

            if octets[0] == 169 && octets[1] == 254 {
                return Some("Link-local range (169.254.x.x) - APIPA addresses".to_string());
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1) - relay is this host".to_string());
            }

            if ipv6.segments()[0] & 0xffc0 == 0xfe80 {
                return Some("IPv6 link-local (fe80::/10) - local network only".to_string());
            }

            None
        }
    }
}
