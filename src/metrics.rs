//! 指标跟踪器
//!
//! 维护每IP的滚动计数窗口，构建在 `StateStore` 之上。
//!
//! 计数器跨进程不做原子化：两个进程在彼此写入前读到同一窗口会丢失
//! 一次自增。阈值只需近似执行，这是接受的取舍而不是待修复的缺陷。

use crate::error::IpGuardError;
use crate::state::{unix_now, MetricsWindow, PersistedState, StateStore};
use std::sync::Arc;
use tracing::warn;

/// 指标跟踪器
pub struct MetricsTracker {
    store: Arc<dyn StateStore>,
}

/// 三类被跟踪的计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Requests,
    NotFound,
    Unauthorized,
}

impl MetricsTracker {
    /// 创建跟踪器
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// 执行60秒滚动检查并返回当前窗口
    ///
    /// 只读操作，本身不持久化。
    pub async fn touch(&self, ip: &str) -> Result<MetricsWindow, IpGuardError> {
        let state = self.store.load().await?;
        let now = unix_now();
        Ok(Self::touched(&state, ip, now))
    }

    /// 自增请求计数并持久化，返回更新后的窗口
    pub async fn increment_requests(&self, ip: &str) -> Result<MetricsWindow, IpGuardError> {
        self.increment(ip, Counter::Requests).await
    }

    /// 自增404计数并持久化，返回更新后的窗口
    pub async fn increment_not_found(&self, ip: &str) -> Result<MetricsWindow, IpGuardError> {
        self.increment(ip, Counter::NotFound).await
    }

    /// 自增401/403计数并持久化，返回更新后的窗口
    pub async fn increment_unauthorized(&self, ip: &str) -> Result<MetricsWindow, IpGuardError> {
        self.increment(ip, Counter::Unauthorized).await
    }

    /// 读-改-写一次计数自增
    ///
    /// 写入失败（含锁超时）记录后吞掉：丢一次计数换请求路径不被阻塞。
    async fn increment(&self, ip: &str, counter: Counter) -> Result<MetricsWindow, IpGuardError> {
        let mut state = self.store.load().await?;
        let now = unix_now();

        let window = state
            .metrics
            .entry(ip.to_string())
            .or_insert_with(|| MetricsWindow::new(now));
        if window.is_elapsed(now) {
            window.reset(now);
        }
        match counter {
            Counter::Requests => window.requests += 1,
            Counter::NotFound => window.not_found += 1,
            Counter::Unauthorized => window.unauthorized += 1,
        }
        let updated = window.clone();

        if let Err(e) = self.store.save(&state, true).await {
            warn!(ip, "Metrics write skipped: {}", e);
        }

        Ok(updated)
    }

    /// 在给定状态上执行滚动检查（不落库）
    fn touched(state: &PersistedState, ip: &str, now: i64) -> MetricsWindow {
        match state.metrics.get(ip) {
            Some(window) if !window.is_elapsed(now) => window.clone(),
            _ => MetricsWindow::new(now),
        }
    }
}
