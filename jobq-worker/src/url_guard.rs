//! 回调 URL 安全检查
//! Callback URL safety checks.
//!
//! 仅当协议为 `http`/`https`、主机不是已知回环别名且解析出的每个地址都不在私有、回环、链路本地、文档和保留范围内时，URL 才被接受。
//! A URL passes only when its scheme is `http`/`https`, its host is not a known
//! loopback alias, and every address the host resolves to lies outside the
//! private, loopback, link-local, documentation and reserved ranges.

use async_trait::async_trait;
use reqwest::Url;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

const BLOCKED_HOSTS: &[&str] = &[
  "localhost",
  "127.0.0.1",
  "::1",
  "0.0.0.0",
  "[::1]",
  "[::0]",
];

const BLOCKED_NETWORKS: &[&str] = &[
  "10.0.0.0/8",
  "172.16.0.0/12",
  "192.168.0.0/16",
  "127.0.0.0/8",
  "0.0.0.0/8",
  "169.254.0.0/16",
  "192.0.0.0/24",
  "192.0.2.0/24",
  "198.51.100.0/24",
  "203.0.113.0/24",
  "224.0.0.0/4",
  "240.0.0.0/4",
  "100.64.0.0/10",
  "198.18.0.0/15",
  "::1/128",
  "::/128",
  "fe80::/10",
  "fc00::/7",
  "ff00::/8",
  "2001:db8::/32",
];

/// URL 被拒绝的原因
/// Why a URL was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlRejection {
  #[error("invalid URL format: {0}")]
  InvalidUrl(String),

  #[error("URL scheme not allowed: {0}")]
  SchemeNotAllowed(String),

  #[error("URL has no host")]
  MissingHost,

  #[error("hostname not allowed: {0}")]
  HostnameNotAllowed(String),

  #[error("failed to resolve hostname {host}: {reason}")]
  ResolutionFailed { host: String, reason: String },

  #[error("hostname {0} resolved to no addresses")]
  NoAddresses(String),

  #[error("IP address in forbidden range: {0}")]
  ForbiddenAddress(IpAddr),
}

/// CIDR 表示的地址块
/// An address block in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
  base: IpAddr,
  prefix: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid network: {0}")]
pub struct ParseNetworkError(String);

impl IpNetwork {
  pub fn new(base: IpAddr, prefix: u8) -> Result<Self, ParseNetworkError> {
    let max = if base.is_ipv4() { 32 } else { 128 };
    if prefix > max {
      return Err(ParseNetworkError(format!("{base}/{prefix}")));
    }
    Ok(Self { base, prefix })
  }

  pub fn contains(&self, addr: IpAddr) -> bool {
    match (self.base, addr) {
      (IpAddr::V4(base), IpAddr::V4(addr)) => {
        same_prefix(u32::from(base).into(), u32::from(addr).into(), self.prefix, 32)
      }
      (IpAddr::V6(base), IpAddr::V6(addr)) => {
        same_prefix(u128::from(base), u128::from(addr), self.prefix, 128)
      }
      _ => false,
    }
  }
}

fn same_prefix(a: u128, b: u128, prefix: u8, bits: u32) -> bool {
  let shift = bits - u32::from(prefix);
  a.checked_shr(shift).unwrap_or(0) == b.checked_shr(shift).unwrap_or(0)
}

impl FromStr for IpNetwork {
  type Err = ParseNetworkError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || ParseNetworkError(s.to_string());
    match s.split_once('/') {
      Some((addr, prefix)) => {
        let addr = addr.parse::<IpAddr>().map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
      }
      None => {
        let addr = s.parse::<IpAddr>().map_err(|_| invalid())?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self::new(addr, prefix)
      }
    }
  }
}

impl fmt::Display for IpNetwork {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.base, self.prefix)
  }
}

/// [`UrlGuard`] 使用的主机名解析
/// Hostname resolution used by [`UrlGuard`].
#[async_trait]
pub trait Resolver: Send + Sync {
  async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// 通过操作系统解析
/// Resolves through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
  async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host, 0)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
  }
}

/// 固定的主机表，用于测试和固定部署
/// Fixed host table, for tests and pinned deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
  entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
    self.entries.insert(host.to_ascii_lowercase(), addrs.to_vec());
    self
  }
}

#[async_trait]
impl Resolver for StaticResolver {
  async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
    self
      .entries
      .get(&host.to_ascii_lowercase())
      .cloned()
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
  }
}

/// 在保存回调 URL 之前以及每次投递之前校验它
/// Validates callback URLs before they are stored and again before each delivery.
#[derive(Clone)]
pub struct UrlGuard {
  blocked_hosts: Vec<String>,
  blocked_networks: Vec<IpNetwork>,
  exempt_networks: Vec<IpNetwork>,
  resolver: Arc<dyn Resolver>,
}

impl Default for UrlGuard {
  fn default() -> Self {
    Self::new()
  }
}

impl UrlGuard {
  pub fn new() -> Self {
    Self {
      blocked_hosts: BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
      blocked_networks: BLOCKED_NETWORKS
        .iter()
        .filter_map(|n| n.parse().ok())
        .collect(),
      exempt_networks: Vec::new(),
      resolver: Arc::new(SystemResolver),
    }
  }

  pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
    self.resolver = resolver;
    self
  }

  /// 允许一个与封禁范围重叠的地址块
  /// Allow one block even though it overlaps a blocked range.
  ///
  /// Only for local test receivers; production guards carry no exemptions.
  pub fn exempt(mut self, network: IpNetwork) -> Self {
    self.exempt_networks.push(network);
    self
  }

  /// `addr` 是否落在封禁范围内
  /// Whether `addr` falls in a blocked range.
  pub fn is_blocked(&self, addr: IpAddr) -> bool {
    let addr = canonical(addr);
    if self.exempt_networks.iter().any(|n| n.contains(addr)) {
      return false;
    }
    self.blocked_networks.iter().any(|n| n.contains(addr))
  }

  /// 校验 `url` 并解析其主机
  /// Check `url`, resolving its host.
  pub async fn validate(&self, url: &str) -> Result<(), UrlRejection> {
    let parsed = Url::parse(url).map_err(|e| UrlRejection::InvalidUrl(e.to_string()))?;

    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
      return Err(UrlRejection::SchemeNotAllowed(parsed.scheme().to_string()));
    }

    let raw_host = parsed.host_str().ok_or(UrlRejection::MissingHost)?;
    let host = raw_host.trim_start_matches('[').trim_end_matches(']');
    let literal = host.parse::<IpAddr>().ok();

    let exempt = literal.is_some_and(|ip| self.exempt_networks.iter().any(|n| n.contains(ip)));
    if !exempt {
      let lowered = raw_host.to_ascii_lowercase();
      let stripped = host.to_ascii_lowercase();
      if self
        .blocked_hosts
        .iter()
        .any(|blocked| *blocked == lowered || *blocked == stripped)
      {
        return Err(UrlRejection::HostnameNotAllowed(host.to_string()));
      }
    }

    let addrs = match literal {
      Some(ip) => vec![ip],
      None => self
        .resolver
        .resolve(host)
        .await
        .map_err(|e| UrlRejection::ResolutionFailed {
          host: host.to_string(),
          reason: e.to_string(),
        })?,
    };
    if addrs.is_empty() {
      return Err(UrlRejection::NoAddresses(host.to_string()));
    }

    match addrs.into_iter().find(|ip| self.is_blocked(*ip)) {
      Some(ip) => Err(UrlRejection::ForbiddenAddress(ip)),
      None => Ok(()),
    }
  }
}

// IPv4-mapped IPv6 addresses are checked as IPv4.
fn canonical(addr: IpAddr) -> IpAddr {
  match addr {
    IpAddr::V6(v6) => v6
      .to_ipv4_mapped()
      .map(IpAddr::V4)
      .unwrap_or(IpAddr::V6(v6)),
    v4 => v4,
  }
}

/// 用于豁免本地测试接收端的回环地址块
/// Loopback block for exempting local test receivers.
pub fn loopback_v4() -> IpNetwork {
  IpNetwork {
    base: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 0)),
    prefix: 8,
  }
}
