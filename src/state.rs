//! 状态存储层
//!
//! 定义持久化状态模型和存储接口。
//!
//! `PersistedState` 是跨进程共享的唯一事实来源，由 `StateStore` 独占持有；
//! 其他组件不跨请求保留状态副本，每次操作重新读取最新版本，
//! 以便观察到其他进程的写入。

use crate::constants::{LOCK_RETRY_ATTEMPTS, LOCK_RETRY_DELAY_MS, LOCK_STALE_SECS, WINDOW_SECS};
use crate::error::StorageError;
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 获取当前unix秒
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 封禁来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSource {
    /// 规则触发的自动封禁
    Auto,
    /// 操作员手动封禁
    Manual,
}

impl std::fmt::Display for BlockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockSource::Auto => write!(f, "auto"),
            BlockSource::Manual => write!(f, "manual"),
        }
    }
}

/// 封禁记录
///
/// 不变量：`expires_at > blocked_at`。到期后由下一次
/// `is_blocked`/`cleanup_expired` 惰性移除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// 被封禁的IP
    pub ip: String,
    /// 规则ID或"manual_block"
    pub reason: String,
    /// 封禁来源
    pub source: BlockSource,
    /// 描述（如 "105/100 per minute" 或命中的模式）
    pub description: String,
    /// 封禁时间（unix秒）
    pub blocked_at: i64,
    /// 过期时间（unix秒）
    pub expires_at: i64,
}

impl BlockEntry {
    /// 是否已过期
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// 单IP的计数窗口
///
/// 固定60秒的滚动窗口：一旦完整走完，整体清零并以当前时间重新开窗。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsWindow {
    /// 窗口起始时间（unix秒）
    pub window_started_at: i64,
    /// 请求计数
    pub requests: u64,
    /// 404计数
    pub not_found: u64,
    /// 401/403计数
    pub unauthorized: u64,
}

impl MetricsWindow {
    /// 以当前时间开启新窗口
    pub fn new(now: i64) -> Self {
        Self {
            window_started_at: now,
            requests: 0,
            not_found: 0,
            unauthorized: 0,
        }
    }

    /// 窗口是否已走完
    pub fn is_elapsed(&self, now: i64) -> bool {
        now - self.window_started_at >= WINDOW_SECS
    }

    /// 清零并重新开窗
    pub fn reset(&mut self, now: i64) {
        *self = MetricsWindow::new(now);
    }
}

/// 持久化状态
///
/// 每个字段都带 `#[serde(default)]`，缺失的键解码为空映射，
/// 损坏的文件由存储层整体降级为空状态，二者都不会抛错。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// 封禁记录，按IP索引
    #[serde(default)]
    pub blocked: HashMap<String, BlockEntry>,
    /// 计数窗口，按IP索引
    #[serde(default)]
    pub metrics: HashMap<String, MetricsWindow>,
    /// 规则运行时覆盖层
    #[serde(default)]
    pub rules: Map<String, Value>,
}

/// 状态存储接口
///
/// 可替换后端：文件（多进程共享）、内存（测试/单进程）、
/// 或网络KV存储（多主机部署，替换时无需改动上层组件契约）。
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 加载最新状态
    ///
    /// 文件缺失或损坏降级为空状态，永不向请求路径传播失败。
    async fn load(&self) -> Result<PersistedState, StorageError>;

    /// 写入完整状态
    ///
    /// `preserve_rules` 为真时，写入前用存储中最新的 `rules` 子映射
    /// 替换内存副本，避免并发的规则配置更新被覆盖。
    async fn save(&self, state: &PersistedState, preserve_rules: bool)
        -> Result<(), StorageError>;
}

// ============================================================================
// 内存存储实现
// ============================================================================

/// 内存存储实现
///
/// 用于测试和单进程嵌入，遵守与文件存储相同的 `preserve_rules` 契约。
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: parking_lot::RwLock<PersistedState>,
}

impl MemoryStateStore {
    /// 创建空的内存存储
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<PersistedState, StorageError> {
        Ok(self.inner.read().clone())
    }

    async fn save(
        &self,
        state: &PersistedState,
        preserve_rules: bool,
    ) -> Result<(), StorageError> {
        let mut current = self.inner.write();
        let rules = if preserve_rules {
            current.rules.clone()
        } else {
            state.rules.clone()
        };
        *current = PersistedState {
            blocked: state.blocked.clone(),
            metrics: state.metrics.clone(),
            rules,
        };
        Ok(())
    }
}

// ============================================================================
// 文件存储实现
// ============================================================================

/// 持有期间排他的锁文件，drop时释放
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// 文件存储实现
///
/// 单个JSON文件承载全部共享状态，所有共享同一文件系统的worker读写同一份。
/// 写入流程：获取旁路锁文件（有限次重试，失败即放弃本次写入）、
/// 写临时文件、fsync、原子rename覆盖目标。
pub struct FileStateStore {
    path: PathBuf,
    /// 进程内写串行化；跨进程互斥由锁文件承担
    write_serial: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    /// 创建文件存储
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// 状态文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// 同步读取当前磁盘状态，任何失败都降级为空状态
    fn read_state(&self) -> PersistedState {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return PersistedState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "State file unreadable, treating as empty: {}", e);
                return PersistedState::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), "State file corrupt, treating as empty: {}", e);
                PersistedState::default()
            }
        }
    }

    /// 获取排他锁文件
    ///
    /// 重试耗尽返回 `TimeoutError`，调用方跳过本次写入。
    /// 崩溃进程残留的锁文件超过时限后视为失效并移除。
    async fn acquire_lock(&self) -> Result<LockFile, StorageError> {
        let lock_path = self.lock_path();

        for _ in 0..LOCK_RETRY_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(LockFile {
                        path: lock_path,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = std::fs::metadata(&lock_path)
                        .and_then(|meta| meta.modified())
                        .ok()
                        .and_then(|modified| modified.elapsed().ok())
                        .map(|age| age.as_secs() >= LOCK_STALE_SECS)
                        .unwrap_or(false);

                    if stale {
                        warn!(path = %lock_path.display(), "Removing stale lock file");
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }

                    tokio::time::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(StorageError::IoError(e.to_string())),
            }
        }

        Err(StorageError::TimeoutError(
            lock_path.display().to_string(),
        ))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PersistedState, StorageError> {
        Ok(self.read_state())
    }

    async fn save(
        &self,
        state: &PersistedState,
        preserve_rules: bool,
    ) -> Result<(), StorageError> {
        let _serial = self.write_serial.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::IoError(e.to_string()))?;
            }
        }

        let _lock = self.acquire_lock().await?;

        let mut to_write = state.clone();
        if preserve_rules {
            // 以磁盘上最新的规则覆盖层为准
            to_write.rules = self.read_state().rules;
        }

        let json = serde_json::to_vec_pretty(&to_write)
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;

        let tmp_path = self.tmp_path();
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)
                .map_err(|e| StorageError::IoError(e.to_string()))?;
            file.write_all(&json)
                .map_err(|e| StorageError::IoError(e.to_string()))?;
            file.sync_all()
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StorageError::IoError(e.to_string()))?;

        debug!(path = %self.path.display(), "State file written");
        Ok(())
    }
}
