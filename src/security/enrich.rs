//! Client metadata for audit records.
//!
//! Device and location snapshots only enrich sessions and attempt-log
//! entries. Lookups return `Option` and never fail a request.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr, SocketAddr};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Device {
    pub browser: String,
    pub os: String,
    pub device_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
    /// Loopback, private or link-local address.
    pub is_private: bool,
}

/// Geolocation and user-agent lookup.
pub trait ClientEnricher: Send + Sync {
    fn location(&self, ip: &str) -> Option<Location>;
    fn device(&self, user_agent: &str) -> Option<Device>;
}

/// Offline enricher: classifies private addresses and sniffs common
/// user-agent tokens. Public addresses get no country or city.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEnricher;

impl ClientEnricher for BasicEnricher {
    fn location(&self, ip: &str) -> Option<Location> {
        let addr: IpAddr = ip.parse().ok()?;
        let is_private = is_private_addr(&addr);
        Some(Location {
            country: None,
            city: is_private.then(|| "local".to_string()),
            is_private,
        })
    }

    fn device(&self, user_agent: &str) -> Option<Device> {
        if user_agent.trim().is_empty() {
            return None;
        }
        let ua = user_agent.to_ascii_lowercase();

        let browser = if ua.contains("edg/") {
            "Edge"
        } else if ua.contains("opr/") || ua.contains("opera") {
            "Opera"
        } else if ua.contains("firefox/") {
            "Firefox"
        } else if ua.contains("chrome/") {
            "Chrome"
        } else if ua.contains("safari/") {
            "Safari"
        } else if ua.contains("okhttp") || ua.contains("dart") {
            "App"
        } else {
            "Unknown"
        };

        let os = if ua.contains("android") {
            "Android"
        } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
            "iOS"
        } else if ua.contains("windows") {
            "Windows"
        } else if ua.contains("mac os") || ua.contains("macintosh") {
            "macOS"
        } else if ua.contains("linux") {
            "Linux"
        } else {
            "Unknown"
        };

        let device_type = if ua.contains("ipad") || ua.contains("tablet") {
            "tablet"
        } else if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone") {
            "mobile"
        } else {
            "desktop"
        };

        Some(Device {
            browser: browser.to_string(),
            os: os.to_string(),
            device_type: device_type.to_string(),
        })
    }
}

fn is_private_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.is_loopback() || v4.is_private() || v4.is_link_local();
            }
            // fc00::/7 unique local, fe80::/10 link local
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
///
/// Empty by default: the socket peer is the client and `X-Forwarded-For`
/// or `X-Real-IP` from the outside world is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies {
    addrs: Vec<IpAddr>,
}

impl TrustedProxies {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AddrParseError> {
        let addrs = entries
            .iter()
            .map(|e| e.as_ref().trim().parse::<IpAddr>().map(canonical))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { addrs })
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.addrs.contains(&canonical(addr))
    }
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Who is calling, resolved once per request by the client-context middleware.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: Option<String>,
    pub device: Option<Device>,
    pub location: Option<Location>,
}

impl ClientInfo {
    pub fn resolve(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        proxies: &TrustedProxies,
        enricher: &dyn ClientEnricher,
    ) -> Self {
        let ip = client_ip(headers, peer, proxies);
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let device = user_agent.as_deref().and_then(|ua| enricher.device(ua));
        let location = enricher.location(&ip);
        Self {
            ip,
            user_agent,
            device,
            location,
        }
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .map(canonical)
}

/// The socket peer, unless the peer is a trusted proxy: then the first
/// `X-Forwarded-For` hop, then `X-Real-IP`. Unparseable header values fall
/// back to the peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    proxies: &TrustedProxies,
) -> String {
    let peer = peer.map(|addr| canonical(addr.ip()));

    if let Some(proxy) = peer.filter(|ip| proxies.contains(*ip)) {
        let forwarded = header_ip(headers, "x-forwarded-for")
            .or_else(|| header_ip(headers, "x-real-ip"));
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
        return proxy.to_string();
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
