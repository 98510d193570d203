use crate::pacing::PacingStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 会话状态; 不在注册表中即为空闲 (未运行)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// 占位帧已写入, 编码器已启动, 渲染源启动中
    Starting,
    /// 已抓到第一帧真实画面
    Live,
    /// 正在释放资源
    Stopping,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Starting,
            1 => SessionState::Live,
            _ => SessionState::Stopping,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Starting => 0,
            SessionState::Live => 1,
            SessionState::Stopping => 2,
        }
    }
}

/// 运行时的会话实例
///
/// 状态迁移只由 [`crate::registry::SessionRegistry`] 发起
pub struct Session {
    slug: String,
    state: AtomicU8,
    started_at: Instant,
    /// 最后一次活跃时间, 相对 `started_at` 的毫秒数, 只增不减
    last_activity_ms: AtomicU64,
    /// 协作式停止信号, 抓帧循环每轮检查
    pub(crate) cancel: CancellationToken,
    /// 会话任务退出 (渲染源与编码器均已释放) 时触发
    pub(crate) released: CancellationToken,
    pub(crate) pacing: PacingStats,
    /// 编码进程连续重启次数, 稳定运行后清零
    pub(crate) encoder_restarts: Arc<AtomicU32>,
}

/// 状态接口输出
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(skip)]
    pub slug: String,
    pub state: SessionState,
    pub idle_seconds: u64,
    pub uptime_seconds: u64,
    /// 连续抓帧失败次数
    pub capture_errors: u32,
    /// 连续重启次数
    pub encoder_restarts: u32,
    pub frames_written: u64,
    pub frames_skipped: u64,
}

impl Session {
    pub(crate) fn new(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            state: AtomicU8::new(SessionState::Starting.as_u8()),
            started_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            released: CancellationToken::new(),
            pacing: PacingStats::default(),
            encoder_restarts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn last_activity(&self) -> Instant {
        self.started_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// 刷新活跃时间 (并发调用下保持单调)
    pub(crate) fn touch(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// STARTING -> LIVE, 仅第一次成功
    pub(crate) fn promote_live(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Starting.as_u8(),
                SessionState::Live.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 进入 STOPPING; 已经在停止中时返回 false
    pub(crate) fn begin_stopping(&self) -> bool {
        self.state.swap(SessionState::Stopping.as_u8(), Ordering::AcqRel)
            != SessionState::Stopping.as_u8()
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            slug: self.slug.clone(),
            state: self.state(),
            idle_seconds: self.idle_for(now).as_secs(),
            uptime_seconds: now.saturating_duration_since(self.started_at).as_secs(),
            capture_errors: self.pacing.capture_errors.load(Ordering::Relaxed),
            encoder_restarts: self.encoder_restarts.load(Ordering::Relaxed),
            frames_written: self.pacing.frames_written.load(Ordering::Relaxed),
            frames_skipped: self.pacing.frames_skipped.load(Ordering::Relaxed),
        }
    }
}
