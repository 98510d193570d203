use crate::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// 启动后台空闲回收任务, 定期停止长时间无人观看的会话
///
/// # 任务流程：
/// - 每隔 `interval` 扫描一次注册表
/// - 空闲时间达到 `idle_timeout` 的 STARTING / LIVE 会话被停止
/// - 各会话的停止互不阻塞, 慢速停止不会拖延下一轮扫描
pub async fn start_reaper(registry: Arc<SessionRegistry>, interval: Duration, idle_timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await; // 等待指定的时间间隔
        let reaped = sweep(&registry, Instant::now(), idle_timeout);
        if !reaped.is_empty() {
            debug!("Reaper scheduled {} idle session(s)", reaped.len());
        }
    }
}

/// 单轮扫描: 为每个空闲会话安排停止, 返回被安排停止的 slug
pub fn sweep(registry: &Arc<SessionRegistry>, now: Instant, idle_timeout: Duration) -> Vec<String> {
    let idle = registry.idle_slugs(now, idle_timeout);
    for slug in &idle {
        info!(
            "Session [{}] idle for {}s. Scheduling stop.",
            slug,
            idle_timeout.as_secs()
        );
        let registry = registry.clone();
        let slug = slug.clone();
        tokio::spawn(async move {
            registry.stop(&slug).await;
        });
    }
    idle
}
