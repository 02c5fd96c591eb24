//! Bind mode resolution (loopback, lan, etc.)
//!
//! Parses `api.bind` config values and resolves to socket addresses:
//! - `loopback` -> 127.0.0.1 (default, safest — local access only)
//! - `lan` -> detect first non-loopback IPv4 address (LAN-accessible)
//! - `auto` -> 0.0.0.0 (all interfaces)
//! - Any explicit IP address or `host:port` -> use as-is

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// Default API port
pub const DEFAULT_PORT: u16 = 8234;

/// Bind mode specifying how to resolve the listen address
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BindMode {
    /// Bind to loopback only (127.0.0.1)
    #[default]
    Loopback,
    /// Bind to detected LAN interface IP
    Lan,
    /// Bind to all interfaces (0.0.0.0)
    Auto,
    /// Bind to all interfaces (0.0.0.0) — alias for Auto
    All,
    /// Custom IP address or hostname
    Custom(String),
}

/// Errors that can occur during bind address resolution
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Failed to detect LAN interface IP")]
    LanDetectionFailed,

    #[error("Invalid IP address or hostname: {0}")]
    InvalidAddress(String),

    #[error("Failed to resolve hostname {host}: {message}")]
    ResolutionFailed { host: String, message: String },
}

/// Parse a bind mode string from config
pub fn parse_bind_mode(value: &str) -> BindMode {
    match value.trim().to_lowercase().as_str() {
        "loopback" | "localhost" | "local" => BindMode::Loopback,
        "lan" | "local-network" => BindMode::Lan,
        "auto" => BindMode::Auto,
        "all" | "0.0.0.0" => BindMode::All,
        other => BindMode::Custom(other.to_string()),
    }
}

/// Resolve a bind mode to a socket address.
///
/// For most modes, the `port` parameter is used directly. For `Custom` mode
/// with a `host:port` string, the embedded port overrides the `port` parameter.
pub fn resolve_bind_address(mode: &BindMode, port: u16) -> Result<SocketAddr, BindError> {
    match mode {
        BindMode::Loopback => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        BindMode::Lan => Ok(SocketAddr::new(detect_lan_ip()?, port)),
        BindMode::Auto | BindMode::All => {
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        }
        BindMode::Custom(addr) => resolve_custom_address(addr, port),
    }
}

/// Detect the primary LAN interface IP by attempting to connect to a public IP
fn detect_lan_ip() -> Result<IpAddr, BindError> {
    use std::net::UdpSocket;

    // Create a UDP socket and "connect" to a public IP (doesn't actually send data)
    // This causes the OS to select the appropriate local interface
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| BindError::LanDetectionFailed)?;

    socket
        .connect("8.8.8.8:80")
        .map_err(|_| BindError::LanDetectionFailed)?;

    let local_addr = socket
        .local_addr()
        .map_err(|_| BindError::LanDetectionFailed)?;

    let ip = local_addr.ip();

    // Verify it's a private IP (not loopback)
    match ip {
        IpAddr::V4(v4) if is_private_ip(v4) => Ok(ip),
        _ => Err(BindError::LanDetectionFailed),
    }
}

/// Resolve a custom IP address, hostname, or `host:port` string.
///
/// If the string contains a colon-separated port (e.g. `"192.168.1.5:9000"`
/// or `"myhost:9000"`), the embedded port is used instead of `default_port`.
/// A bare IP or hostname uses `default_port`.
fn resolve_custom_address(addr: &str, default_port: u16) -> Result<SocketAddr, BindError> {
    if addr.is_empty() {
        return Err(BindError::InvalidAddress(addr.to_string()));
    }

    // Try parsing as a full socket address (e.g. "192.168.1.5:9000")
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok(sock);
    }

    // Try parsing as a bare IP address (no port)
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // Check for host:port format (split on last colon to handle IPv6 correctly)
    if let Some((host, port_str)) = split_host_port(addr) {
        if let Ok(port) = port_str.parse::<u16>() {
            let ip = resolve_hostname(host)?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    // Treat the whole string as a hostname
    let ip = resolve_hostname(addr)?;
    Ok(SocketAddr::new(ip, default_port))
}

/// Split a `host:port` string. Returns `None` if there is no port component.
/// For IPv6 addresses in brackets (e.g. `[::1]:8080`), handles the bracket syntax.
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    // Handle bracketed IPv6: [::1]:port
    if addr.starts_with('[') {
        if let Some(bracket_end) = addr.find(']') {
            if addr.as_bytes().get(bracket_end + 1) == Some(&b':') {
                let host = &addr[1..bracket_end];
                let port = &addr[bracket_end + 2..];
                if !port.is_empty() {
                    return Some((host, port));
                }
            }
        }
        return None;
    }

    // For non-bracketed strings, only split if there's exactly one colon
    // (multiple colons would indicate an IPv6 address without brackets)
    let colon_count = addr.chars().filter(|&c| c == ':').count();
    if colon_count == 1 {
        let idx = addr.rfind(':')?;
        let host = &addr[..idx];
        let port = &addr[idx + 1..];
        if !host.is_empty() && !port.is_empty() {
            return Some((host, port));
        }
    }

    None
}

/// Resolve a hostname to an IP address, preferring IPv4.
fn resolve_hostname(host: &str) -> Result<IpAddr, BindError> {
    let socket_addr = format!("{}:0", host);
    match socket_addr.to_socket_addrs() {
        Ok(addrs) => {
            let mut ipv6 = None;
            for addr in addrs {
                match addr.ip() {
                    IpAddr::V4(_) => return Ok(addr.ip()),
                    IpAddr::V6(_) => {
                        if ipv6.is_none() {
                            ipv6 = Some(addr.ip());
                        }
                    }
                }
            }

            ipv6.ok_or_else(|| BindError::ResolutionFailed {
                host: host.to_string(),
                message: "No addresses found".to_string(),
            })
        }
        Err(e) => Err(BindError::ResolutionFailed {
            host: host.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Check if an IPv4 address is in a private range (RFC 1918)
fn is_private_ip(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 10.0.0.0/8
    octets[0] == 10 ||
    // 172.16.0.0/12
    (octets[0] == 172 && (16..=31).contains(&octets[1])) ||
    // 192.168.0.0/16
    (octets[0] == 192 && octets[1] == 168)
}

/// Get the display name for a bind mode
pub fn bind_mode_display_name(mode: &BindMode) -> &'static str {
    match mode {
        BindMode::Loopback => "loopback",
        BindMode::Lan => "lan",
        BindMode::Auto => "auto",
        BindMode::All => "all",
        BindMode::Custom(_) => "custom",
    }
}

/// Result of bind address resolution with additional metadata
#[derive(Debug)]
pub struct ResolvedBind {
    /// The resolved socket address
    pub address: SocketAddr,
    /// The bind mode that was used
    pub mode: BindMode,
    /// Human-readable description
    pub description: String,
    /// Whether this address is accessible from other machines
    pub externally_accessible: bool,
}

/// Resolve bind address with full metadata
pub fn resolve_bind_with_metadata(mode: &BindMode, port: u16) -> Result<ResolvedBind, BindError> {
    let address = resolve_bind_address(mode, port)?;

    let (description, externally_accessible) = match mode {
        BindMode::Loopback => (format!("localhost only ({})", address), false),
        BindMode::Lan => (format!("local network ({})", address), true),
        BindMode::Auto => (format!("all interfaces ({})", address), true),
        BindMode::All => (format!("all interfaces ({})", address), true),
        BindMode::Custom(addr) => (
            format!("custom ({} -> {})", addr, address),
            !address.ip().is_loopback(),
        ),
    };

    Ok(ResolvedBind {
        address,
        mode: mode.clone(),
        description,
        externally_accessible,
    })
}
