//! 封禁登记处
//!
//! 封禁记录的权威CRUD：自动/手动封禁、白名单优先级、过期清理、
//! 规则覆盖层读写。构建在 `StateStore` 之上。
//!
//! 单IP状态机：未封禁 →（规则触发或手动调用）→ 已封禁(expires_at)
//! →（下一次 `is_blocked`/`cleanup_expired` 观察到过期）→ 未封禁。
//! 没有中间的"警告"状态，触发即封禁。

use crate::constants::MIN_BLOCK_TTL_SECS;
use crate::error::IpGuardError;
use crate::matchers::IpListMatcher;
use crate::rules::merge_overrides;
use crate::state::{unix_now, BlockEntry, BlockSource, StateStore};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 封禁事件
///
/// 每次创建封禁时发往通知接收器，用于日志或告警。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    /// 被封禁的IP
    pub ip: String,
    /// 规则ID或"manual_block"
    pub reason: String,
    /// 封禁来源
    pub source: BlockSource,
    /// 描述
    pub description: String,
}

/// 封禁事件接收器
///
/// 外部协作方；默认实现写tracing日志，宿主可注入自定义实现对接告警。
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// 接收一次封禁事件
    async fn notify(&self, event: &BlockEvent);
}

/// 默认的tracing日志接收器
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, event: &BlockEvent) {
        warn!(
            ip = %event.ip,
            reason = %event.reason,
            source = %event.source,
            description = %event.description,
            "IP blocked"
        );
    }
}

/// 封禁登记处
pub struct BlockRegistry {
    store: Arc<dyn StateStore>,
    allow_list: IpListMatcher,
    deny_list: IpListMatcher,
    /// 封禁时长（秒），创建时应用60秒下限
    block_ttl_secs: i64,
    sink: Arc<dyn NotificationSink>,
}

impl BlockRegistry {
    /// 创建封禁登记处
    pub fn new(
        store: Arc<dyn StateStore>,
        allow_list: IpListMatcher,
        deny_list: IpListMatcher,
        block_ttl_secs: i64,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            allow_list,
            deny_list,
            block_ttl_secs,
            sink,
        }
    }

    /// 检查IP当前是否被拒绝
    ///
    /// 白名单优先级绝对最高：命中即返回false，黑名单和未过期的
    /// 封禁记录都被压过。先触发一次过期清理。
    pub async fn is_blocked(&self, ip: &str) -> Result<bool, IpGuardError> {
        if self.allow_list.matches(ip) {
            return Ok(false);
        }

        self.cleanup_expired().await?;

        // 黑名单短路，不经过计数
        if self.deny_list.matches(ip) {
            return Ok(true);
        }

        let state = self.store.load().await?;
        let now = unix_now();
        Ok(state
            .blocked
            .get(ip)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false))
    }

    /// 创建或更新封禁记录
    ///
    /// 白名单IP拒绝封禁。写入失败记录后放行（封禁层自身不能成为
    /// 新的故障源），事件仍然发出。
    pub async fn block(
        &self,
        ip: &str,
        reason: &str,
        source: BlockSource,
        description: &str,
    ) -> Result<BlockEntry, IpGuardError> {
        if self.allow_list.matches(ip) {
            return Err(IpGuardError::ValidationError(format!(
                "IP在白名单中，拒绝封禁: {}",
                ip
            )));
        }

        let now = unix_now();
        let ttl = self.block_ttl_secs.max(MIN_BLOCK_TTL_SECS);
        let entry = BlockEntry {
            ip: ip.to_string(),
            reason: reason.to_string(),
            source,
            description: description.to_string(),
            blocked_at: now,
            expires_at: now + ttl,
        };

        let mut state = self.store.load().await?;
        state.blocked.insert(ip.to_string(), entry.clone());
        if let Err(e) = self.store.save(&state, true).await {
            warn!(ip, "Block write skipped: {}", e);
        }

        info!(ip, reason, %source, "Block entry created (ttl: {}s)", ttl);
        self.sink
            .notify(&BlockEvent {
                ip: entry.ip.clone(),
                reason: entry.reason.clone(),
                source: entry.source,
                description: entry.description.clone(),
            })
            .await;

        Ok(entry)
    }

    /// 移除封禁记录及其计数窗口
    ///
    /// 返回是否存在被移除的记录。
    pub async fn unblock(&self, ip: &str) -> Result<bool, IpGuardError> {
        let mut state = self.store.load().await?;
        let existed = state.blocked.remove(ip).is_some();
        state.metrics.remove(ip);

        if existed {
            self.store.save(&state, true).await?;
            info!(ip, "Block entry removed");
        }

        Ok(existed)
    }

    /// 清理所有过期记录（连同计数窗口）
    ///
    /// 仅在有变化时持久化，返回移除数量。
    pub async fn cleanup_expired(&self) -> Result<u64, IpGuardError> {
        let mut state = self.store.load().await?;
        let now = unix_now();

        let expired: Vec<String> = state
            .blocked
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(ip, _)| ip.clone())
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        for ip in &expired {
            state.blocked.remove(ip);
            state.metrics.remove(ip);
        }

        if let Err(e) = self.store.save(&state, true).await {
            warn!("Cleanup write skipped: {}", e);
        } else {
            debug!(count = expired.len(), "Expired block entries removed");
        }

        Ok(expired.len() as u64)
    }

    /// 列出当前所有封禁记录（先清理过期）
    pub async fn list_blocked(&self) -> Result<Vec<BlockEntry>, IpGuardError> {
        self.cleanup_expired().await?;
        let state = self.store.load().await?;
        let mut entries: Vec<BlockEntry> = state.blocked.into_values().collect();
        entries.sort_by(|a, b| a.ip.cmp(&b.ip));
        Ok(entries)
    }

    /// 读取规则覆盖层
    pub async fn get_rules(&self) -> Result<Map<String, Value>, IpGuardError> {
        Ok(self.store.load().await?.rules)
    }

    /// 深度合并写入规则覆盖层
    ///
    /// 部分更新中的 `null` 值删除对应的键。返回合并后的覆盖层。
    pub async fn update_rules(
        &self,
        patch: &Map<String, Value>,
    ) -> Result<Map<String, Value>, IpGuardError> {
        let mut state = self.store.load().await?;
        merge_overrides(&mut state.rules, patch);
        // 规则本身就是本次写入的对象，不走preserve_rules
        self.store.save(&state, false).await?;
        info!("Rule overrides updated");
        Ok(state.rules)
    }
}
