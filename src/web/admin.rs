use crate::registry::TouchOutcome;
use crate::session::SessionState;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info};

/// 服务发现入口
pub async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "scorestream",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "status": "/status",
            "reload": "/reload",
            "health": "/health",
            "playlist": "/hls/{slug}.m3u8",
        }
    }))
}

/// 健康检查
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// 获取系统状态 API
/// 该处理函数返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.list().len(),
    }))
}

/// 会话状态 API
/// 返回 slug -> {state, idleSeconds, ...}
pub async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let sessions: BTreeMap<String, _> = state
        .registry
        .list()
        .into_iter()
        .map(|snapshot| (snapshot.slug.clone(), snapshot))
        .collect();
    Json(json!(sessions))
}

/// 目录重载 API
/// 立即返回, 在后台停止目录中已不存在的会话
pub async fn reload(State(state): State<SharedState>) -> (StatusCode, Json<serde_json::Value>) {
    let registry = state.registry.clone();
    tokio::spawn(async move {
        match registry.reconcile().await {
            Ok(orphans) if orphans.is_empty() => info!("Reload: no orphaned sessions"),
            Ok(orphans) => info!("Reload: stopped {:?}", orphans),
            Err(e) => error!("Reload failed, keeping all sessions: {:#}", e),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "reloading" })))
}

/// 手动启动 (或保活) 会话 API
pub async fn handle_touch(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> (StatusCode, String) {
    match state.registry.touch(&slug).await {
        TouchOutcome::Started => (StatusCode::ACCEPTED, format!("Stream [{}] starting", slug)),
        TouchOutcome::Refreshed(s) => (
            StatusCode::OK,
            format!("Stream [{}] is active ({:?})", slug, s),
        ),
        TouchOutcome::Unknown => (StatusCode::NOT_FOUND, format!("Unknown stream [{}]", slug)),
    }
}

/// 手动停止会话 API
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> (StatusCode, String) {
    if state.registry.stop(&slug).await {
        return (StatusCode::OK, format!("Stream [{}] stopped", slug));
    }
    match state.registry.state(&slug) {
        Some(SessionState::Stopping) => (StatusCode::OK, format!("Stream [{}] already stopping", slug)),
        _ => (StatusCode::OK, format!("Stream [{}] was not running", slug)),
    }
}
