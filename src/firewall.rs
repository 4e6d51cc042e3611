//! Firewall 主控制器
//!
//! 防火墙引擎的编排入口：每个请求按 解析IP → 封禁检查 → 计数更新 →
//! 规则评估 的顺序执行；响应完成后按状态码再评估一轮。
//!
//! 引擎自身不启动任何后台并发，每个请求在其所属的处理单元内同步完成
//! 整个序列；跨进程共享只通过 `StateStore` 发生。
//!
//! 所有内部失败都降级为放行（fail open）：保护层绝不能成为新的
//! 拒绝服务来源。

use crate::config::FirewallConfig;
use crate::error::{Decision, IpGuardError};
use crate::matchers::{ClientIpResolver, IpListMatcher, RequestContext};
use crate::metrics::MetricsTracker;
use crate::registry::{BlockRegistry, NotificationSink, TracingSink};
use crate::rules::{Breach, RuleEngine, RuleKind};
use crate::state::{BlockSource, FileStateStore, StateStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Firewall 主控制器
pub struct Firewall {
    config: FirewallConfig,
    resolver: ClientIpResolver,
    allow_list: IpListMatcher,
    ignore_list: IpListMatcher,
    tracker: MetricsTracker,
    engine: RuleEngine,
    registry: BlockRegistry,
}

impl Firewall {
    /// 创建Firewall实例
    ///
    /// 配置问题在这里一次性暴露；`sink` 为空时使用默认的tracing接收器。
    pub fn new(
        config: FirewallConfig,
        store: Arc<dyn StateStore>,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self, IpGuardError> {
        config.validate().map_err(IpGuardError::ConfigError)?;

        let sink = sink.unwrap_or_else(|| Arc::new(TracingSink));
        let registry = BlockRegistry::new(
            store.clone(),
            IpListMatcher::from_patterns(&config.allow_list),
            IpListMatcher::from_patterns(&config.deny_list),
            config.block_ttl_secs,
            sink,
        );

        Ok(Self {
            resolver: ClientIpResolver::new(&config.trusted_proxies),
            allow_list: IpListMatcher::from_patterns(&config.allow_list),
            ignore_list: IpListMatcher::from_patterns(&config.ignore_list),
            tracker: MetricsTracker::new(store.clone()),
            engine: RuleEngine::new(config.clone()),
            registry,
            config,
        })
    }

    /// 使用配置中的状态文件路径创建文件存储后端的实例
    pub fn with_file_store(
        config: FirewallConfig,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self, IpGuardError> {
        let store = Arc::new(FileStateStore::new(&config.state_path));
        Self::new(config, store, sink)
    }

    /// 封禁登记处（操作员接口：列表、手动封禁/解封、强制清理、规则读写）
    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// 解析本次请求的有效客户端IP
    pub fn resolve_ip(&self, ctx: &RequestContext) -> String {
        self.resolver.resolve(&ctx.remote_addr, &ctx.headers)
    }

    /// 处理入站请求
    ///
    /// 黑名单和已有封禁直接拒绝；白名单/忽略名单的IP照常计数但
    /// 跳过所有规则评估；其余IP先累加请求计数，再依次评估
    /// `requests_per_minute` 和 `suspicious_payload`。
    pub async fn handle_request(&self, ctx: &RequestContext) -> Decision {
        if !self.config.enabled {
            return Decision::Allowed;
        }

        let ip = self.resolve_ip(ctx);

        match self.registry.is_blocked(&ip).await {
            Ok(true) => {
                debug!(ip, "Request denied by existing block");
                return self.blocked("blocked");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(ip, "Block check failed, allowing request: {}", e);
                return Decision::Allowed;
            }
        }

        let window = match self.tracker.increment_requests(&ip).await {
            Ok(window) => window,
            Err(e) => {
                warn!(ip, "Metrics update failed, allowing request: {}", e);
                return Decision::Allowed;
            }
        };

        if self.is_exempt(&ip) {
            return Decision::Allowed;
        }

        let overrides = self.rule_overrides().await;

        if let Some(breach) =
            self.engine
                .check_counter(RuleKind::RequestsPerMinute, &window, &overrides)
        {
            return self.apply_breach(&ip, breach).await;
        }

        if let Some(breach) = self.engine.check_payload(ctx, &overrides) {
            return self.apply_breach(&ip, breach).await;
        }

        Decision::Allowed
    }

    /// 处理响应完成
    ///
    /// 404累加not_found计数并评估 `not_found_per_minute`；
    /// 401/403且无认证主体时累加unauthorized计数并评估
    /// `unauthorized_per_minute`；其余状态码不做任何事。
    pub async fn handle_response(&self, ctx: &RequestContext, status: u16) -> Decision {
        if !self.config.enabled {
            return Decision::Allowed;
        }

        let kind = match status {
            404 => RuleKind::NotFoundPerMinute,
            401 | 403 if !ctx.authenticated => RuleKind::UnauthorizedPerMinute,
            _ => return Decision::Allowed,
        };

        let ip = self.resolve_ip(ctx);

        let result = match kind {
            RuleKind::NotFoundPerMinute => self.tracker.increment_not_found(&ip).await,
            _ => self.tracker.increment_unauthorized(&ip).await,
        };
        let window = match result {
            Ok(window) => window,
            Err(e) => {
                warn!(ip, "Metrics update failed: {}", e);
                return Decision::Allowed;
            }
        };

        if self.is_exempt(&ip) {
            return Decision::Allowed;
        }

        let overrides = self.rule_overrides().await;
        if let Some(breach) = self.engine.check_counter(kind, &window, &overrides) {
            return self.apply_breach(&ip, breach).await;
        }

        Decision::Allowed
    }

    /// 白名单或静态忽略名单的IP跳过规则评估（计数不受影响）
    fn is_exempt(&self, ip: &str) -> bool {
        self.allow_list.matches(ip) || self.ignore_list.matches(ip)
    }

    /// 读取运行时规则覆盖层，失败时退回空覆盖
    async fn rule_overrides(&self) -> Map<String, Value> {
        match self.registry.get_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Rule overrides unavailable, using defaults: {}", e);
                Map::new()
            }
        }
    }

    /// 规则触发后创建封禁并返回拒绝决策
    async fn apply_breach(&self, ip: &str, breach: Breach) -> Decision {
        if let Err(e) = self
            .registry
            .block(ip, breach.kind.id(), BlockSource::Auto, &breach.description)
            .await
        {
            warn!(ip, rule = breach.kind.id(), "Auto-block failed: {}", e);
        }
        self.blocked(breach.kind.id())
    }

    fn blocked(&self, reason: &str) -> Decision {
        Decision::Blocked {
            status: self.config.blocked_status,
            reason: reason.to_string(),
        }
    }
}
