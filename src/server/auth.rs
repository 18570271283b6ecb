//! HTTP bridge 访问控制：网段白名单、回环免认证、Bearer token

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::HttpConfig;
use crate::error::ProtocolError;

/// 一个网段（`10.0.0.0/8`、`fd00::/8`，或单个地址）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (raw, None),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        (prefix <= max).then_some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// IPv4 映射的 IPv6 地址按 IPv4 处理
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    canonical(ip).is_loopback()
}

/// 访问策略
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    token: Option<String>,
    cidrs: Vec<Cidr>,
    allow_loopback_unauth: bool,
}

impl AuthPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        let cidrs = config
            .allow_cidrs
            .iter()
            .filter_map(|raw| {
                let parsed = Cidr::parse(raw);
                if parsed.is_none() {
                    warn!(cidr = %raw, "Ignoring invalid CIDR");
                }
                parsed
            })
            .collect();
        Self {
            token: config.token.clone(),
            cidrs,
            allow_loopback_unauth: config.allow_loopback_unauth,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// 免认证的本机来源
    pub fn trusts(&self, ip: IpAddr) -> bool {
        self.allow_loopback_unauth && is_loopback(ip)
    }

    /// 检查请求来源与凭据
    pub fn check(&self, ip: IpAddr, headers: &HeaderMap) -> Result<(), ProtocolError> {
        if !self.cidrs.is_empty() && !self.cidrs.iter().any(|c| c.contains(ip)) {
            return Err(ProtocolError::Forbidden);
        }
        if self.trusts(ip) {
            return Ok(());
        }
        let Some(token) = self.token.as_deref() else {
            return Err(ProtocolError::Unauthorized);
        };

        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| headers.get("x-statusd-token").and_then(|v| v.to_str().ok()))
            .map(str::trim);

        if presented == Some(token) {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized)
        }
    }
}
