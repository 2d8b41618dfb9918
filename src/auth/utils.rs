use axum::{extract::ConnectInfo, extract::Request, http::HeaderMap};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

// Shared helpers for the auth, monitor and gateway modules.

// =============================================================================
// CRYPTOGRAPHIC UTILITIES
// =============================================================================

/// Generate SHA256 hash from string input
///
/// # Arguments
/// * `input` - String to hash
///
/// # Returns
/// Hexadecimal hash string
pub fn sha256_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate secure random token
///
/// # Arguments
/// * `length` - Length of the token in bytes
///
/// # Returns
/// URL-safe base64 token without padding, suitable for a cookie value
pub fn generate_secure_token(length: usize) -> String {
    use base64::{engine::general_purpose, Engine as _};
    use rand::RngCore;

    let mut rng = rand::thread_rng();
    let mut token = vec![0u8; length];
    rng.fill_bytes(&mut token);
    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

// =============================================================================
// IP ADDRESS UTILITIES
// =============================================================================

/// Peers whose forwarding headers are believed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies(Vec<IpNet>);

impl TrustedProxies {
    /// Comma-separated CIDRs or bare addresses, e.g. `10.0.0.0/8, 192.168.1.10`
    pub fn parse_list(raw: &str) -> std::result::Result<Self, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .ok()
                    .or_else(|| {
                        let ip = entry.parse::<IpAddr>().ok()?;
                        IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok()
                    })
                    .ok_or_else(|| format!("'{}' is not an address or CIDR", entry))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Client address for a connection.
    ///
    /// The socket peer is used as is unless it is a trusted proxy. Behind a
    /// trusted proxy the right-most `X-Forwarded-For` hop that is not itself
    /// trusted is the client; entries left of it are client-supplied.
    pub fn client_ip(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> IpAddr {
        let Some(peer) = peer else {
            return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        };
        if !self.contains(&peer) {
            return peer;
        }

        let chain: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .collect();

        let mut leftmost_trusted = None;
        for hop in chain.iter().rev() {
            let Ok(ip) = hop.parse::<IpAddr>() else {
                // A malformed hop ends the verifiable part of the chain
                return leftmost_trusted.unwrap_or(peer);
            };
            if !self.contains(&ip) {
                return ip;
            }
            leftmost_trusted = Some(ip);
        }
        if let Some(ip) = leftmost_trusted {
            return ip;
        }

        headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
            .unwrap_or(peer)
    }
}

/// Client address for a request, from the socket peer and trusted forwarding headers
pub fn extract_client_ip(request: &Request, trusted: &TrustedProxies) -> IpAddr {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    trusted.client_ip(peer, request.headers())
}

// =============================================================================
// STRING UTILITIES
// =============================================================================

/// Extract User-Agent from headers
///
/// # Arguments
/// * `headers` - HTTP headers
///
/// # Returns
/// User-Agent string or "Unknown"
pub fn extract_user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|hv| hv.to_str().ok())
        .unwrap_or("Unknown")
        .to_string()
}

/// Client-supplied device fingerprint, if any
pub fn extract_device_fingerprint(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-device-fingerprint")
        .and_then(|hv| hv.to_str().ok())
        .map(str::trim)
        .filter(|fp| !fp.is_empty())
        .map(str::to_string)
}

/// Sanitize string for logging
///
/// # Arguments
/// * `input` - String to sanitize
///
/// # Returns
/// Input without control characters, capped at 200 characters
pub fn sanitize_for_logging(input: &str) -> String {
    input.chars().filter(|c| !c.is_control()).take(200).collect()
}

const AUTOMATION_SIGNATURES: &[&str] = &[
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "go-http-client",
    "okhttp",
    "libwww-perl",
    "httpclient",
    "headlesschrome",
    "phantomjs",
    "selenium",
    "puppeteer",
    "playwright",
    "scrapy",
    "sqlmap",
    "nikto",
    "hydra",
];

/// True when the user agent matches a known automation/tooling signature
pub fn is_automation_user_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua.trim().is_empty() || AUTOMATION_SIGNATURES.iter().any(|sig| ua.contains(sig))
}

/// User-facing retry message with a concrete wait
pub fn format_retry_message(retry_after_seconds: u64) -> String {
    if retry_after_seconds >= 120 {
        let minutes = retry_after_seconds.div_ceil(60);
        format!("Too many requests. Please try again in {} minutes.", minutes)
    } else if retry_after_seconds == 1 {
        "Too many requests. Please try again in 1 second.".to_string()
    } else {
        format!("Too many requests. Please try again in {} seconds.", retry_after_seconds)
    }
}
