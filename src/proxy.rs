use std::net::IpAddr;
use std::time::Duration;

use base64::Engine as _;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{Error, Result};

/// Default port for HTTP proxies given without one
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 80;

/// Default port for SOCKS5 proxies given without one
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Direct connection
    None,
    /// HTTP proxy (CONNECT tunnel for secure targets, absolute-form otherwise)
    Http,
    /// SOCKS5 proxy; `remote_dns` lets the proxy resolve target names (`socks5h`)
    Socks5 { remote_dns: bool },
}

impl ProxyKind {
    /// Get the scheme for this proxy type
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::None => "direct",
            ProxyKind::Http => "http",
            ProxyKind::Socks5 { remote_dns: false } => "socks5",
            ProxyKind::Socks5 { remote_dns: true } => "socks5h",
        }
    }
}

/// Proxy authentication
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl ProxyAuth {
    /// Create a new proxy authentication
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Get the username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the password
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Value for a `Proxy-Authorization` header
    pub fn basic_header(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }
}

impl std::fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"REDACTED")
            .finish()
    }
}

/// Where and how to proxy connections for one execution.
///
/// Stateless after construction; a target can be shared by any number of
/// concurrent dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    kind: ProxyKind,
    /// `host:port` of the proxy
    address: String,
    auth: Option<ProxyAuth>,
    no_proxy: Vec<String>,
    timeout: Option<Duration>,
}

impl ProxyTarget {
    /// A target that always dials directly
    pub fn none() -> Self {
        Self {
            kind: ProxyKind::None,
            address: String::new(),
            auth: None,
            no_proxy: Vec::new(),
            timeout: None,
        }
    }

    /// Parse a proxy URL such as `http://user:pw@proxy:3128` or `socks5h://proxy`.
    ///
    /// A URL without a scheme is taken as an HTTP proxy. An empty string means
    /// no proxy. A SOCKS5 URL without a host is a configuration error.
    pub fn from_url(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::none());
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| Error::config(format!("Invalid proxy URL: {}", e)))?;

        let (kind, default_port) = match url.scheme() {
            "http" => (ProxyKind::Http, DEFAULT_HTTP_PROXY_PORT),
            "socks5" => (ProxyKind::Socks5 { remote_dns: false }, DEFAULT_SOCKS5_PORT),
            "socks5h" => (ProxyKind::Socks5 { remote_dns: true }, DEFAULT_SOCKS5_PORT),
            other => {
                return Err(Error::config(format!(
                    "Unsupported proxy scheme '{}' (expected http, socks5 or socks5h)",
                    other
                )))
            }
        };

        let host = url.host_str().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::config(format!(
                "{} proxy address is empty",
                kind.scheme()
            )));
        }
        let port = url.port().unwrap_or(default_port);
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let auth = if url.username().is_empty() {
            None
        } else {
            Some(ProxyAuth::new(
                &percent_decode_str(url.username()).decode_utf8_lossy(),
                &percent_decode_str(url.password().unwrap_or_default()).decode_utf8_lossy(),
            ))
        };

        Ok(Self {
            kind,
            address,
            auth,
            no_proxy: Vec::new(),
            timeout: None,
        })
    }

    /// Proxy for `target_scheme` from `HTTPS_PROXY`/`HTTP_PROXY`/`ALL_PROXY`
    /// and `NO_PROXY` (upper or lower case)
    pub fn from_env(target_scheme: &str) -> Result<Self> {
        Self::from_env_with(target_scheme, |key| std::env::var(key).ok())
    }

    pub(crate) fn from_env_with<F>(target_scheme: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .or_else(|| lookup(&name.to_ascii_lowercase()))
                .filter(|v| !v.trim().is_empty())
        };
        let scheme_var = if target_scheme.eq_ignore_ascii_case("https") {
            "HTTPS_PROXY"
        } else {
            "HTTP_PROXY"
        };
        let target = match var(scheme_var).or_else(|| var("ALL_PROXY")) {
            Some(url) => Self::from_url(&url)?,
            None => return Ok(Self::none()),
        };
        let no_proxy = var("NO_PROXY")
            .map(|v| parse_no_proxy_list(&v))
            .unwrap_or_default();
        Ok(target.no_proxy(no_proxy))
    }

    /// Set the bypass patterns
    pub fn no_proxy(mut self, patterns: Vec<String>) -> Self {
        self.no_proxy = patterns;
        self
    }

    /// Set credentials, replacing any taken from the URL
    pub fn auth(mut self, auth: ProxyAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the dial timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get the proxy kind
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Get the proxy `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the proxy authentication
    pub fn get_auth(&self) -> Option<&ProxyAuth> {
        self.auth.as_ref()
    }

    /// Get the bypass patterns
    pub fn get_no_proxy(&self) -> &[String] {
        &self.no_proxy
    }

    /// Get the dial timeout
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check if a proxy is configured
    pub fn is_none(&self) -> bool {
        self.kind == ProxyKind::None
    }

    /// Check if a connection to `host_port` should skip the proxy
    pub fn should_bypass(&self, host_port: &str) -> bool {
        should_bypass(host_port, &self.no_proxy)
    }
}

impl Default for ProxyTarget {
    fn default() -> Self {
        Self::none()
    }
}

/// Split a comma separated no-proxy list
pub fn parse_no_proxy_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Decide whether `host_port` bypasses the proxy under `patterns`.
///
/// Rules, any match bypasses:
/// * `*` matches everything
/// * `host:port` (or `[v6]:port`) matches that host on that port only
/// * an IP or CIDR matches literal IP targets inside it
/// * `.example.com` or `*.example.com` matches subdomains only
/// * `example.com` matches itself and every subdomain
///
/// Matching is case-insensitive and ignores trailing dots.
pub fn should_bypass<S: AsRef<str>>(host_port: &str, patterns: &[S]) -> bool {
    let (host, port) = split_host_port(host_port);
    let host = normalize_host(&host);
    let host_ip = host.parse::<IpAddr>().ok();

    patterns.iter().any(|pattern| {
        match Pattern::parse(pattern.as_ref()) {
            Some(p) => p.matches(&host, host_ip, port),
            None => false,
        }
    })
}

#[derive(Debug, PartialEq)]
enum Pattern {
    Any,
    HostPort(String, u16),
    Network(IpAddr, u8),
    Subdomains(String),
    Domain(String),
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(Pattern::Any);
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (ip, suffix) = rest.split_once(']')?;
            let ip: IpAddr = ip.parse().ok()?;
            return match suffix.strip_prefix(':') {
                Some(port) => Some(Pattern::HostPort(ip.to_string(), port.parse().ok()?)),
                None if suffix.is_empty() => Some(Pattern::Network(ip, max_prefix(ip))),
                None => None,
            };
        }

        if let Some(network) = parse_network(raw) {
            return Some(network);
        }

        if let Some((host, port)) = raw.rsplit_once(':') {
            let port = port.parse().ok()?;
            return Some(Pattern::HostPort(normalize_host(host), port));
        }

        let lower = normalize_host(raw);
        if let Some(suffix) = lower.strip_prefix("*.") {
            return Some(Pattern::Subdomains(format!(".{}", suffix)));
        }
        if lower.starts_with('.') {
            return Some(Pattern::Subdomains(lower));
        }
        Some(Pattern::Domain(lower))
    }

    fn matches(&self, host: &str, host_ip: Option<IpAddr>, port: Option<u16>) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::HostPort(h, p) => {
                let same_host = match (h.parse::<IpAddr>(), host_ip) {
                    (Ok(a), Some(b)) => a == b,
                    _ => h == host,
                };
                same_host && port == Some(*p)
            }
            Pattern::Network(net, prefix) => match host_ip {
                Some(ip) => ip_in_network(ip, *net, *prefix),
                None => false,
            },
            Pattern::Subdomains(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
            Pattern::Domain(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
        }
    }
}

fn parse_network(raw: &str) -> Option<Pattern> {
    match raw.split_once('/') {
        Some((ip, prefix)) => {
            let ip: IpAddr = ip.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            if prefix > max_prefix(ip) {
                return None;
            }
            Some(Pattern::Network(ip, prefix))
        }
        None => {
            let ip: IpAddr = raw.parse().ok()?;
            Some(Pattern::Network(ip, max_prefix(ip)))
        }
    }
}

fn max_prefix(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn ip_in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V4(_)) => match ip.to_ipv4_mapped() {
            Some(v4) => ip_in_network(IpAddr::V4(v4), net, prefix),
            None => false,
        },
        (IpAddr::V4(_), IpAddr::V6(_)) => false,
    }
}

fn split_host_port(host_port: &str) -> (String, Option<u16>) {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some((host, suffix)) = rest.split_once(']') {
            let port = suffix.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    if host_port.parse::<IpAddr>().is_ok() {
        return (host_port.to_string(), None);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (host_port.to_string(), None),
        },
        None => (host_port.to_string(), None),
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
