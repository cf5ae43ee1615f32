//! Outbound URL validation (SSRF defense).
//!
//! Every URL the harvester fetches, including each redirect hop, passes
//! through [`UrlValidator::validate`] first. Validation fails closed: a
//! malformed URL, an unsupported scheme, a host outside the allowlist, a DNS
//! failure, or any resolved address in a non-public range all yield
//! `allowed = false`.
//!
//! Checks run in order:
//!
//! 1. scheme is `http` or `https`, and the URL carries no userinfo
//! 2. host is allowlisted, exactly or as a subdomain (strict mode only)
//! 3. every resolved address is publicly routable
//!
//! Validation resolves the host once; the HTTP client resolves it again when
//! it connects. [`PublicOnlyResolver`] is installed as the client's resolver
//! so that second answer is filtered too, and a host that rebinds to a
//! private address between the two lookups is still unreachable.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;
use url::{Host, Url};

use crate::config::{SafetyConfig, ValidationMode};

/// Verdict for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: String,
}

impl ValidationResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Host name resolution, abstracted so tests can pin answers.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver via `tokio::net::lookup_host`.
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connection-time resolver for the shared `reqwest::Client`. Non-public
/// answers are dropped; a host with nothing public left fails to resolve.
#[derive(Clone)]
pub struct PublicOnlyResolver {
    inner: Arc<dyn Resolve>,
}

impl PublicOnlyResolver {
    pub fn new(inner: Arc<dyn Resolve>) -> Self {
        Self { inner }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver))
    }

    /// Resolve `host` and keep only publicly routable addresses.
    pub async fn public_addrs(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        public_addrs(self.inner.as_ref(), host).await
    }
}

async fn public_addrs(resolver: &dyn Resolve, host: &str) -> std::io::Result<Vec<IpAddr>> {
    let answers = resolver.resolve(host, 0).await?;
    let total = answers.len();
    let public: Vec<IpAddr> = answers.into_iter().filter(|ip| !is_blocked_ip(ip)).collect();
    if public.len() < total {
        warn!(
            target: "security",
            host,
            dropped = total - public.len(),
            "non-public addresses dropped at connect time"
        );
    }
    if public.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("'{}' has no public addresses", host),
        ));
    }
    Ok(public)
}

impl reqwest::dns::Resolve for PublicOnlyResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let inner = self.inner.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = public_addrs(inner.as_ref(), &host).await?;
            // the connector fills in the port
            let addrs: reqwest::dns::Addrs =
                Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, BoxError>(addrs)
        })
    }
}

pub struct UrlValidator {
    mode: ValidationMode,
    allowed_hosts: RwLock<BTreeSet<String>>,
    resolver: Box<dyn Resolve>,
}

impl UrlValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        Self::with_resolver(config, Box::new(SystemResolver))
    }

    pub fn with_resolver(config: &SafetyConfig, resolver: Box<dyn Resolve>) -> Self {
        let allowed_hosts = config
            .allowed_hosts
            .iter()
            .map(|h| normalize_host(h))
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            mode: config.mode,
            allowed_hosts: RwLock::new(allowed_hosts),
            resolver,
        }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Add a host to the allowlist at runtime.
    pub fn allow_host(&self, host: &str) {
        let host = normalize_host(host);
        if host.is_empty() {
            return;
        }
        if let Ok(mut hosts) = self.allowed_hosts.write() {
            hosts.insert(host);
        }
    }

    pub fn allowed_hosts(&self) -> Vec<String> {
        self.allowed_hosts
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn validate(&self, url: &str) -> ValidationResult {
        let result = self.check(url).await;
        if !result.allowed {
            warn!(target: "security", url, reason = %result.reason, "outbound url rejected");
        }
        result
    }

    /// Validate an already-parsed URL (used for redirect hops).
    pub async fn validate_url(&self, url: &Url) -> ValidationResult {
        self.validate(url.as_str()).await
    }

    async fn check(&self, raw: &str) -> ValidationResult {
        let url = match Url::parse(raw.trim()) {
            Ok(u) => u,
            Err(e) => return ValidationResult::deny(format!("malformed url: {}", e)),
        };

        match url.scheme() {
            "http" | "https" => {}
            other => return ValidationResult::deny(format!("scheme '{}' not allowed", other)),
        }

        if !url.username().is_empty() || url.password().is_some() {
            return ValidationResult::deny("credentials in url");
        }

        let host = match url.host() {
            Some(h) => h,
            None => return ValidationResult::deny("url has no host"),
        };

        let host_name = match &host {
            Host::Domain(d) => normalize_host(d),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };

        if self.mode == ValidationMode::Strict && !self.host_allowed(&host_name) {
            return ValidationResult::deny(format!("host '{}' not in allowlist", host_name));
        }

        let addrs = match host {
            Host::Ipv4(ip) => vec![IpAddr::V4(ip)],
            Host::Ipv6(ip) => vec![IpAddr::V6(ip)],
            Host::Domain(_) => {
                let port = url.port_or_known_default().unwrap_or(443);
                match self.resolver.resolve(&host_name, port).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        return ValidationResult::deny(format!(
                            "dns resolution failed for '{}': {}",
                            host_name, e
                        ))
                    }
                }
            }
        };

        if addrs.is_empty() {
            return ValidationResult::deny(format!("'{}' resolved to no addresses", host_name));
        }
        if let Some(bad) = addrs.iter().find(|ip| is_blocked_ip(ip)) {
            return ValidationResult::deny(format!(
                "'{}' resolves to non-public address {}",
                host_name, bad
            ));
        }

        ValidationResult::allow()
    }

    fn host_allowed(&self, host: &str) -> bool {
        let hosts = match self.allowed_hosts.read() {
            Ok(h) => h,
            Err(_) => return false,
        };
        hosts.iter().any(|allowed| {
            host == allowed
                || (host.len() > allowed.len()
                    && host.ends_with(allowed.as_str())
                    && host.as_bytes()[host.len() - allowed.len() - 1] == b'.')
        })
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// True when `ip` is anything other than a publicly routable unicast address.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local() // 169.254/16, cloud metadata
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        || a == 0
        || (a == 100 && (64..=127).contains(&b)) // carrier-grade NAT
        || (a == 192 && b == 0 && c == 0) // IETF protocol assignments
        || (a == 198 && (18..=19).contains(&b)) // benchmarking
        || a >= 240 // reserved
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = embedded_v4(ip) {
        return is_blocked_v4(&v4);
    }
    let seg = ip.segments();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        || (seg[0] & 0xfe00) == 0xfc00 // unique local
        || (seg[0] & 0xffc0) == 0xfe80 // link local
        || (seg[0] & 0xffc0) == 0xfec0 // site local
        || (seg[0] == 0x2001 && seg[1] == 0x0db8) // documentation
}

/// IPv4 address carried inside an IPv4-mapped (`::ffff:a.b.c.d`) or NAT64
/// (`64:ff9b::a.b.c.d`) IPv6 address.
fn embedded_v4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let seg = ip.segments();
    if seg[0] == 0x64 && seg[1] == 0xff9b && seg[2..6].iter().all(|s| *s == 0) {
        let [.., a, b, c, d] = ip.octets();
        return Some(Ipv4Addr::new(a, b, c, d));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Resolver with fixed answers; unknown hosts fail resolution.
    struct StaticResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait]
    impl Resolve for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            self.0.get(host).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such host")
            })
        }
    }

    fn validator(mode: ValidationMode, answers: &[(&str, &str)]) -> UrlValidator {
        let mut map: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for (host, ip) in answers {
            map.entry(host.to_string())
                .or_default()
                .push(ip.parse().unwrap());
        }
        let cfg = SafetyConfig {
            mode,
            allowed_hosts: vec!["zillow.com".into(), "zillowstatic.com".into()],
        };
        UrlValidator::with_resolver(&cfg, Box::new(StaticResolver(map)))
    }

    #[tokio::test]
    async fn connect_resolver_drops_private_answers() {
        let mut map: HashMap<String, Vec<IpAddr>> = HashMap::new();
        map.insert(
            "rebind.example.com".into(),
            vec!["93.184.216.34".parse().unwrap(), "169.254.169.254".parse().unwrap()],
        );
        map.insert(
            "internal.example.com".into(),
            vec!["10.0.0.5".parse().unwrap(), "::1".parse().unwrap()],
        );
        let resolver = PublicOnlyResolver::new(Arc::new(StaticResolver(map)));

        let addrs = resolver.public_addrs("rebind.example.com").await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);

        let err = resolver
            .public_addrs("internal.example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

        assert!(resolver.public_addrs("unknown.example.com").await.is_err());
    }

    #[tokio::test]
    async fn allows_public_allowlisted_host() {
        let v = validator(
            ValidationMode::Strict,
            &[("photos.zillowstatic.com", "52.84.12.7")],
        );
        let r = v
            .validate("https://photos.zillowstatic.com/fp/abc-cc_ft_960.jpg")
            .await;
        assert!(r.allowed, "{}", r.reason);
    }

    #[tokio::test]
    async fn rejects_bad_schemes() {
        let v = validator(ValidationMode::Permissive, &[]);
        for url in [
            "file:///etc/passwd",
            "ftp://zillow.com/a.jpg",
            "javascript:alert(1)",
            "data:image/png;base64,AAAA",
            "not a url",
        ] {
            assert!(!v.validate(url).await.allowed, "{} should be rejected", url);
        }
    }

    #[tokio::test]
    async fn rejects_typosquats_and_prepending_tricks() {
        let v = validator(
            ValidationMode::Strict,
            &[
                ("evil.com", "93.184.216.34"),
                ("zillow.com.evil.com", "93.184.216.34"),
                ("notzillow.com", "93.184.216.34"),
                ("zi11ow.com", "93.184.216.34"),
            ],
        );
        for url in [
            "https://evil.com/zillow.com",
            "https://evil.com/?next=https://zillow.com",
            "https://zillow.com.evil.com/a.jpg",
            "https://notzillow.com/a.jpg",
            "https://zi11ow.com/a.jpg",
            "https://zillow.com@evil.com/a.jpg",
        ] {
            let r = v.validate(url).await;
            assert!(!r.allowed, "{} should be rejected", url);
        }
    }

    #[tokio::test]
    async fn strict_rejects_private_resolutions() {
        let private = [
            "127.0.0.1",
            "127.8.8.8",
            "10.0.0.5",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.10",
            "169.254.169.254",
            "169.254.0.1",
        ];
        for ip in private {
            let v = validator(ValidationMode::Strict, &[("photos.zillowstatic.com", ip)]);
            let r = v.validate("https://photos.zillowstatic.com/a.jpg").await;
            assert!(!r.allowed, "{} should be blocked", ip);
            assert!(r.reason.contains("non-public"), "{}", r.reason);
        }
    }

    #[tokio::test]
    async fn any_private_answer_rejects() {
        let v = validator(
            ValidationMode::Strict,
            &[
                ("www.zillow.com", "52.84.12.7"),
                ("www.zillow.com", "10.1.2.3"),
            ],
        );
        assert!(!v.validate("https://www.zillow.com/").await.allowed);
    }

    #[tokio::test]
    async fn dns_failure_fails_closed() {
        let v = validator(ValidationMode::Strict, &[]);
        let r = v.validate("https://www.zillow.com/").await;
        assert!(!r.allowed);
        assert!(r.reason.contains("dns"));
    }

    #[tokio::test]
    async fn permissive_skips_allowlist_but_blocks_private() {
        let v = validator(
            ValidationMode::Permissive,
            &[("cdn.example.org", "151.101.1.1"), ("internal.example.org", "192.168.0.4")],
        );
        assert!(v.validate("https://cdn.example.org/a.jpg").await.allowed);
        assert!(!v.validate("https://internal.example.org/a.jpg").await.allowed);
        assert!(!v.validate("http://169.254.169.254/latest/meta-data/").await.allowed);
        assert!(!v.validate("http://[::1]/").await.allowed);
    }

    #[tokio::test]
    async fn runtime_allow_host() {
        let v = validator(ValidationMode::Strict, &[("ssl.cdn-redfin.com", "23.45.67.89")]);
        assert!(!v.validate("https://ssl.cdn-redfin.com/p.jpg").await.allowed);
        v.allow_host("CDN-Redfin.com.");
        assert!(v.validate("https://ssl.cdn-redfin.com/p.jpg").await.allowed);
    }

    #[test]
    fn blocked_ranges() {
        for ip in [
            "0.0.0.0",
            "100.64.0.1",
            "100.127.255.255",
            "192.0.0.8",
            "192.0.2.1",
            "198.18.0.1",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
            "::",
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "fec0::1",
            "ff02::1",
            "2001:db8::1",
            "::ffff:127.0.0.1",
            "::ffff:169.254.169.254",
            "64:ff9b::a9fe:a9fe",
        ] {
            let parsed: IpAddr = ip.parse().unwrap();
            assert!(is_blocked_ip(&parsed), "{} should be blocked", ip);
        }
        for ip in ["8.8.8.8", "100.63.255.255", "100.128.0.1", "2606:4700::1111", "::ffff:8.8.8.8"] {
            let parsed: IpAddr = ip.parse().unwrap();
            assert!(!is_blocked_ip(&parsed), "{} should be allowed", ip);
        }
    }
}
