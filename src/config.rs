//! 配置模块
//!
//! 定义防火墙引擎的配置结构。

use crate::constants::{
    DEFAULT_BLOCKED_STATUS, DEFAULT_BLOCK_TTL_SECS, DEFAULT_NOT_FOUND_PER_MINUTE,
    DEFAULT_REQUESTS_PER_MINUTE, DEFAULT_STATE_PATH, DEFAULT_UNAUTHORIZED_PER_MINUTE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 防火墙配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// 是否启用防火墙
    pub enabled: bool,
    /// 拒绝请求时返回的HTTP状态码
    pub blocked_status: u16,
    /// 封禁时长（秒），创建封禁时应用最低60秒的下限
    pub block_ttl_secs: i64,
    /// 各规则的静态默认配置
    pub rules: RuleDefaults,
    /// 受信任的代理（IP、CIDR或"*"）
    pub trusted_proxies: Vec<String>,
    /// 手动白名单（IP或CIDR），优先级绝对最高
    pub allow_list: Vec<String>,
    /// 手动黑名单（IP或CIDR），命中即封禁
    pub deny_list: Vec<String>,
    /// 静态忽略名单：计数但不评估任何规则
    pub ignore_list: Vec<String>,
    /// 载荷规则的URI排除子串
    pub payload_exclusions: Vec<String>,
    /// 载荷正则是否区分大小写
    pub case_sensitive_patterns: bool,
    /// 共享状态文件路径
    pub state_path: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_status: DEFAULT_BLOCKED_STATUS,
            block_ttl_secs: DEFAULT_BLOCK_TTL_SECS,
            rules: RuleDefaults::default(),
            trusted_proxies: Vec::new(),
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            ignore_list: Vec::new(),
            payload_exclusions: Vec::new(),
            case_sensitive_patterns: false,
            state_path: DEFAULT_STATE_PATH.to_string(),
        }
    }
}

impl FirewallConfig {
    /// 校验配置
    ///
    /// 启动时调用一次，配置问题在这里暴露而不是在请求路径上。
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=599).contains(&self.blocked_status) {
            return Err(format!("无效的HTTP状态码: {}", self.blocked_status));
        }

        if self.block_ttl_secs <= 0 {
            return Err(format!("封禁时长必须为正数: {}", self.block_ttl_secs));
        }

        if self.state_path.is_empty() {
            return Err("状态文件路径不能为空".to_string());
        }

        self.rules.validate()?;

        Ok(())
    }

    /// 从YAML字符串加载配置
    pub fn from_yaml_str(yaml: &str) -> Result<Self, crate::error::IpGuardError> {
        let config: FirewallConfig = serde_yaml::from_str(yaml)?;
        config
            .validate()
            .map_err(crate::error::IpGuardError::ConfigError)?;
        Ok(config)
    }

    /// 从YAML文件加载配置
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, crate::error::IpGuardError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// 单条规则的静态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    /// 是否启用
    pub enabled: bool,
    /// 阈值（每分钟）
    pub limit: u64,
    /// 正则模式列表（仅载荷规则使用）
    pub patterns: Vec<String>,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 0,
            patterns: Vec::new(),
        }
    }
}

/// 各规则的静态默认值
///
/// 运行时覆盖层（PersistedState.rules）在此基础上深度合并。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefaults {
    /// 每分钟请求数规则
    pub requests_per_minute: RuleSettings,
    /// 每分钟404规则
    pub not_found_per_minute: RuleSettings,
    /// 每分钟401/403规则
    pub unauthorized_per_minute: RuleSettings,
    /// 可疑载荷规则
    pub suspicious_payload: RuleSettings,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            requests_per_minute: RuleSettings {
                enabled: true,
                limit: DEFAULT_REQUESTS_PER_MINUTE,
                patterns: Vec::new(),
            },
            not_found_per_minute: RuleSettings {
                enabled: true,
                limit: DEFAULT_NOT_FOUND_PER_MINUTE,
                patterns: Vec::new(),
            },
            unauthorized_per_minute: RuleSettings {
                enabled: true,
                limit: DEFAULT_UNAUTHORIZED_PER_MINUTE,
                patterns: Vec::new(),
            },
            suspicious_payload: RuleSettings {
                enabled: true,
                limit: 0,
                patterns: Vec::new(),
            },
        }
    }
}

impl RuleDefaults {
    /// 校验规则默认值
    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_minute.enabled && self.requests_per_minute.limit == 0 {
            return Err("requests_per_minute 阈值不能为0".to_string());
        }
        if self.not_found_per_minute.enabled && self.not_found_per_minute.limit == 0 {
            return Err("not_found_per_minute 阈值不能为0".to_string());
        }
        if self.unauthorized_per_minute.enabled && self.unauthorized_per_minute.limit == 0 {
            return Err("unauthorized_per_minute 阈值不能为0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试默认配置通过校验
    #[test]
    fn test_default_config_is_valid() {
        let config = FirewallConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert_eq!(config.blocked_status, 403);
        assert_eq!(config.block_ttl_secs, 3600);
        assert_eq!(config.rules.requests_per_minute.limit, 100);
        assert_eq!(config.rules.not_found_per_minute.limit, 10);
        assert_eq!(config.rules.unauthorized_per_minute.limit, 5);
    }

    /// 测试无效状态码被拒绝
    #[test]
    fn test_invalid_status_rejected() {
        let config = FirewallConfig {
            blocked_status: 42,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    /// 测试启用规则的零阈值被拒绝
    #[test]
    fn test_zero_limit_rejected() {
        let mut config = FirewallConfig::default();
        config.rules.requests_per_minute.limit = 0;
        assert!(config.validate().is_err());

        // 禁用后零阈值是允许的
        config.rules.requests_per_minute.enabled = false;
        assert!(config.validate().is_ok());
    }

    /// 测试YAML加载与部分字段覆盖
    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
enabled: true
blocked_status: 429
block_ttl_secs: 600
trusted_proxies:
  - "10.0.0.0/8"
deny_list:
  - "203.0.113.7"
rules:
  requests_per_minute:
    enabled: true
    limit: 30
  suspicious_payload:
    enabled: true
    patterns:
      - "union select"
"#;
        let config = FirewallConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.blocked_status, 429);
        assert_eq!(config.block_ttl_secs, 600);
        assert_eq!(config.rules.requests_per_minute.limit, 30);
        assert_eq!(
            config.rules.suspicious_payload.patterns,
            vec!["union select".to_string()]
        );
        // 未出现的字段保持默认值
        assert_eq!(config.rules.not_found_per_minute.limit, 10);
        assert_eq!(config.state_path, DEFAULT_STATE_PATH);
    }

    /// 测试无效YAML返回错误
    #[test]
    fn test_from_yaml_invalid() {
        assert!(FirewallConfig::from_yaml_str("blocked_status: [nope").is_err());
    }
}
