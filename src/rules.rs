//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 规则引擎
//!
//! 对当前计数窗口和请求载荷评估已配置的规则，决定是否触发封禁。
//!
//! 规则相互独立、互不排斥：
//! - `requests_per_minute`: 每分钟请求数超限
//! - `not_found_per_minute`: 每分钟404超限（仅404响应评估）
//! - `unauthorized_per_minute`: 每分钟401/403超限（仅无认证主体时评估）
//! - `suspicious_payload`: 请求载荷命中配置的正则
//! - `manual_block`: 仅代表操作员直接调用，不参与自动评估
//!
//! 生效配置 = 静态默认值 ⊕ 持久化状态中的运行时覆盖层。

use crate::config::{FirewallConfig, RuleSettings};
use crate::matchers::RequestContext;
use crate::state::MetricsWindow;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::warn;

/// 规则种类
///
/// 带类型的规则枚举替代字符串键分发；载荷规则额外携带自由形式的正则列表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// 每分钟请求数
    RequestsPerMinute,
    /// 每分钟404数
    NotFoundPerMinute,
    /// 每分钟401/403数
    UnauthorizedPerMinute,
    /// 可疑载荷
    SuspiciousPayload,
    /// 手动封禁
    ManualBlock,
}

impl RuleKind {
    /// 规则ID，用作封禁原因和覆盖层的键
    pub fn id(&self) -> &'static str {
        match self {
            RuleKind::RequestsPerMinute => "requests_per_minute",
            RuleKind::NotFoundPerMinute => "not_found_per_minute",
            RuleKind::UnauthorizedPerMinute => "unauthorized_per_minute",
            RuleKind::SuspiciousPayload => "suspicious_payload",
            RuleKind::ManualBlock => "manual_block",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// 规则触发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breach {
    /// 触发的规则
    pub kind: RuleKind,
    /// 描述（计数规则为 "<count>/<limit> per minute"，载荷规则为命中的模式）
    pub description: String,
}

/// 深度合并规则覆盖层
///
/// `null` 值删除对应的键而不是被存储；对象递归合并；其余直接替换。
pub fn merge_overrides(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                base.remove(key);
            }
            Value::Object(patch_obj) => {
                if let Some(Value::Object(base_obj)) = base.get_mut(key) {
                    merge_overrides(base_obj, patch_obj);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// 规则引擎
pub struct RuleEngine {
    config: FirewallConfig,
    /// 已编译正则缓存；`None` 表示编译失败，跳过且不再重试
    regex_cache: DashMap<String, Option<Regex>>,
}

impl RuleEngine {
    /// 创建规则引擎
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            config,
            regex_cache: DashMap::new(),
        }
    }

    /// 计算规则的生效配置（静态默认值加运行时覆盖）
    pub fn effective(&self, kind: RuleKind, overrides: &Map<String, Value>) -> RuleSettings {
        let mut settings = match kind {
            RuleKind::RequestsPerMinute => self.config.rules.requests_per_minute.clone(),
            RuleKind::NotFoundPerMinute => self.config.rules.not_found_per_minute.clone(),
            RuleKind::UnauthorizedPerMinute => self.config.rules.unauthorized_per_minute.clone(),
            RuleKind::SuspiciousPayload => self.config.rules.suspicious_payload.clone(),
            RuleKind::ManualBlock => RuleSettings {
                enabled: true,
                limit: 0,
                patterns: Vec::new(),
            },
        };

        if let Some(Value::Object(patch)) = overrides.get(kind.id()) {
            if let Some(enabled) = patch.get("enabled").and_then(Value::as_bool) {
                settings.enabled = enabled;
            }
            if let Some(limit) = patch.get("limit").and_then(Value::as_u64) {
                settings.limit = limit;
            }
            if let Some(Value::Array(patterns)) = patch.get("patterns") {
                settings.patterns = patterns
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
            }
        }

        settings
    }

    /// 评估计数规则
    ///
    /// 规则禁用时直接跳过（计数仍然照常累加，由调用方负责）。
    pub fn check_counter(
        &self,
        kind: RuleKind,
        window: &MetricsWindow,
        overrides: &Map<String, Value>,
    ) -> Option<Breach> {
        let settings = self.effective(kind, overrides);
        if !settings.enabled {
            return None;
        }

        let count = match kind {
            RuleKind::RequestsPerMinute => window.requests,
            RuleKind::NotFoundPerMinute => window.not_found,
            RuleKind::UnauthorizedPerMinute => window.unauthorized,
            _ => return None,
        };

        if count > settings.limit {
            Some(Breach {
                kind,
                description: format!("{}/{} per minute", count, settings.limit),
            })
        } else {
            None
        }
    }

    /// 评估可疑载荷规则
    ///
    /// URI包含任一排除子串时整体跳过。检查对象为换行拼接的
    /// JSON化查询参数、JSON化请求体参数、原始请求体、原始URI。
    /// 按配置顺序迭代正则，首个命中即触发。
    pub fn check_payload(
        &self,
        ctx: &RequestContext,
        overrides: &Map<String, Value>,
    ) -> Option<Breach> {
        let settings = self.effective(RuleKind::SuspiciousPayload, overrides);
        if !settings.enabled || settings.patterns.is_empty() {
            return None;
        }

        if self
            .config
            .payload_exclusions
            .iter()
            .any(|excl| !excl.is_empty() && ctx.uri.contains(excl.as_str()))
        {
            return None;
        }

        let subject = [
            serde_json::to_string(&ctx.query_params).unwrap_or_default(),
            serde_json::to_string(&ctx.body_params).unwrap_or_default(),
            ctx.body.clone(),
            ctx.uri.clone(),
        ]
        .join("\n");

        for pattern in &settings.patterns {
            if let Some(regex) = self.compiled(pattern) {
                if regex.is_match(&subject) {
                    return Some(Breach {
                        kind: RuleKind::SuspiciousPayload,
                        description: format!("pattern: {}", pattern),
                    });
                }
            }
        }

        None
    }

    /// 取缓存的已编译正则
    ///
    /// 编译失败记录警告后缓存为 `None`：该模式被跳过，
    /// 其余模式照常评估，永不致命。
    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.regex_cache.get(pattern) {
            return cached.clone();
        }

        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(!self.config.case_sensitive_patterns)
            .build();
        let compiled = match compiled {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(pattern, "Skipping uncompilable payload pattern: {}", e);
                None
            }
        };

        self.regex_cache
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }
}
