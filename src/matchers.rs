//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 匹配器模块
//!
//! 实现请求上下文、IP名单匹配和客户端IP解析。
//!
//! # IP名单匹配
//!
//! 名单条目支持三种形式：
//! - 字面IP (`203.0.113.7`)
//! - CIDR块 (`192.168.1.0/24`、`2001:db8::/32`)
//! - 通配符 (`*`，用于受信任代理配置)
//!
//! 按名单顺序首个命中即返回。
//!
//! # 客户端IP解析
//!
//! 只有当直连地址本身在受信任代理名单中时才采信转发头，
//! 否则不可信对端伪造的 `X-Forwarded-For` 会被原样忽略。

use crate::constants::UNKNOWN_IP;
use ahash::AHashMap as HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::warn;

// ============================================================================
// 请求上下文
// ============================================================================

/// HTTP请求上下文
///
/// 简化的HTTP请求表示，包含防火墙评估所需的信息。
#[derive(Clone, Default)]
pub struct RequestContext {
    /// 原始连接地址
    pub remote_addr: String,
    /// HTTP头（键为小写）
    pub headers: HashMap<String, String>,
    /// 查询参数
    pub query_params: HashMap<String, String>,
    /// 请求体参数
    pub body_params: HashMap<String, String>,
    /// 原始请求体
    pub body: String,
    /// 原始URI
    pub uri: String,
    /// 请求方法
    pub method: String,
    /// 是否存在已认证主体
    pub authenticated: bool,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 脱敏 headers
        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let v = if k.contains("auth") || k.contains("cookie") || k.contains("key") {
                    "***".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();

        f.debug_struct("RequestContext")
            .field("remote_addr", &self.remote_addr)
            .field("headers", &headers)
            .field("uri", &self.uri)
            .field("method", &self.method)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new(remote_addr: &str) -> Self {
        Self {
            remote_addr: remote_addr.to_string(),
            ..Default::default()
        }
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 添加查询参数
    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.insert(key.to_string(), value.to_string());
        self
    }

    /// 添加请求体参数
    pub fn with_body_param(mut self, key: &str, value: &str) -> Self {
        self.body_params.insert(key.to_string(), value.to_string());
        self
    }

    /// 设置原始请求体
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// 设置请求URI
    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = uri.to_string();
        self
    }

    /// 设置请求方法
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// 标记存在已认证主体
    pub fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_lowercase())
    }
}

// ============================================================================
// IP范围
// ============================================================================

/// IP范围
#[derive(Debug, Clone)]
pub enum IpRange {
    /// 单个IP
    Single(IpAddr),
    /// IPv4 CIDR
    Ipv4Cidr { addr: Ipv4Addr, prefix: u8 },
    /// IPv6 CIDR
    Ipv6Cidr { addr: Ipv6Addr, prefix: u8 },
    /// 通配符，匹配所有地址
    Wildcard,
}

impl IpRange {
    /// 检查IP是否在范围内
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            IpRange::Single(addr) => addr == ip,
            IpRange::Ipv4Cidr { addr, prefix } => {
                if let IpAddr::V4(ipv4) = ip {
                    ipv4_in_cidr(ipv4, addr, *prefix)
                } else {
                    false
                }
            }
            IpRange::Ipv6Cidr { addr, prefix } => {
                if let IpAddr::V6(ipv6) = ip {
                    ipv6_in_cidr(ipv6, addr, *prefix)
                } else {
                    false
                }
            }
            IpRange::Wildcard => true,
        }
    }
}

/// 检查IPv4是否在CIDR范围内
fn ipv4_in_cidr(ip: &Ipv4Addr, network: &Ipv4Addr, prefix: u8) -> bool {
    let ip_u32 = u32::from(*ip);
    let network_u32 = u32::from(*network);
    let mask = if prefix == 0 {
        0
    } else {
        0xFFFFFFFFu32 << (32 - prefix)
    };

    (ip_u32 & mask) == (network_u32 & mask)
}

/// 检查IPv6是否在CIDR范围内
fn ipv6_in_cidr(ip: &Ipv6Addr, network: &Ipv6Addr, prefix: u8) -> bool {
    let ip_segments = ip.segments();
    let network_segments = network.segments();

    let full_segments = (prefix / 16) as usize;
    let remaining_bits = prefix % 16;

    // 检查完整的段
    for i in 0..full_segments {
        if ip_segments[i] != network_segments[i] {
            return false;
        }
    }

    // 检查剩余的位
    if remaining_bits > 0 && full_segments < 8 {
        let mask = 0xFFFFu16 << (16 - remaining_bits);
        if (ip_segments[full_segments] & mask) != (network_segments[full_segments] & mask) {
            return false;
        }
    }

    true
}

impl FromStr for IpRange {
    type Err = String;

    /// 从字符串解析IP范围
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(IpRange::Wildcard);
        }

        if s.contains('/') {
            // CIDR格式
            let parts: Vec<&str> = s.split('/').collect();
            if parts.len() != 2 {
                return Err(format!("无效的CIDR格式: {}", s));
            }

            let addr: IpAddr = parts[0]
                .parse()
                .map_err(|_| format!("无效的IP地址: {}", parts[0]))?;
            let prefix: u8 = parts[1]
                .parse()
                .map_err(|_| format!("无效的前缀: {}", parts[1]))?;

            match addr {
                IpAddr::V4(ipv4) => {
                    if prefix > 32 {
                        return Err(format!("IPv4前缀不能超过32: {}", prefix));
                    }
                    Ok(IpRange::Ipv4Cidr { addr: ipv4, prefix })
                }
                IpAddr::V6(ipv6) => {
                    if prefix > 128 {
                        return Err(format!("IPv6前缀不能超过128: {}", prefix));
                    }
                    Ok(IpRange::Ipv6Cidr { addr: ipv6, prefix })
                }
            }
        } else {
            // 单个IP
            let addr: IpAddr = s.parse().map_err(|_| format!("无效的IP地址: {}", s))?;
            Ok(IpRange::Single(addr))
        }
    }
}

// ============================================================================
// IP名单匹配器
// ============================================================================

/// IP名单匹配器
///
/// 持有一个已解析的名单，按顺序做首个命中匹配。
#[derive(Debug, Clone, Default)]
pub struct IpListMatcher {
    ranges: Vec<IpRange>,
}

impl IpListMatcher {
    /// 从配置条目构建匹配器
    ///
    /// 无法解析的条目记录警告后跳过，名单加载永不失败。
    pub fn from_patterns(patterns: &[String]) -> Self {
        let mut ranges = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match pattern.parse::<IpRange>() {
                Ok(range) => ranges.push(range),
                Err(e) => {
                    warn!(entry = %pattern, "Skipping unparseable IP list entry: {}", e);
                }
            }
        }
        Self { ranges }
    }

    /// 检查IP是否命中名单
    ///
    /// 无法解析的IP只能被通配符条目命中。
    pub fn matches(&self, ip: &str) -> bool {
        let parsed: Option<IpAddr> = ip.parse().ok();
        self.ranges.iter().any(|range| match (&parsed, range) {
            (_, IpRange::Wildcard) => true,
            (Some(addr), range) => range.contains(addr),
            (None, _) => false,
        })
    }

    /// 名单是否为空
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// ============================================================================
// 客户端IP解析器
// ============================================================================

/// 客户端IP解析器
///
/// 根据直连地址和可选的转发头得出有效客户端IP。
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted_proxies: IpListMatcher,
}

impl ClientIpResolver {
    /// 创建解析器
    pub fn new(trusted_proxies: &[String]) -> Self {
        Self {
            trusted_proxies: IpListMatcher::from_patterns(trusted_proxies),
        }
    }

    /// 解析有效客户端IP
    ///
    /// 直连地址不在受信任代理名单中时原样返回，转发头一律不采信。
    /// 受信任时依次取 `X-Forwarded-For` 首个合法IP、`X-Real-Ip`、
    /// 直连地址本身，最终兜底为 `0.0.0.0`。此函数不会失败。
    pub fn resolve(&self, remote_addr: &str, headers: &HashMap<String, String>) -> String {
        if !self.trusted_proxies.matches(remote_addr) {
            return remote_addr.to_string();
        }

        if let Some(forwarded) = headers.get("x-forwarded-for") {
            for candidate in forwarded.split(',') {
                let candidate = candidate.trim();
                if candidate.parse::<IpAddr>().is_ok() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip") {
            let real_ip = real_ip.trim();
            if real_ip.parse::<IpAddr>().is_ok() {
                return real_ip.to_string();
            }
        }

        if remote_addr.parse::<IpAddr>().is_ok() {
            return remote_addr.to_string();
        }

        UNKNOWN_IP.to_string()
    }
}
