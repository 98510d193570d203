use crate::config::AppConfig;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Instant;

/// 全局应用上下文
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// 会话注册表 (唯一的会话表)
    pub registry: Arc<SessionRegistry>,
    /// 进程启动时间
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;
