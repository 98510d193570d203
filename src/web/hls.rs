use crate::registry::TouchOutcome;
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::{Path as FsPath, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

const PLAYLIST_NAME: &str = "index.m3u8";
const RETRY_AFTER_SECS: &str = "2";

type HlsResult = Result<Response<Body>, (StatusCode, String)>;

/// `GET /hls/{slug}.m3u8`
///
/// 刷新 (必要时启动) 会话, 然后在限定时间内等待编码器生成第一个播放列表
pub async fn serve_playlist(
    State(state): State<SharedState>,
    Path(playlist): Path<String>,
) -> HlsResult {
    let slug = playlist
        .strip_suffix(".m3u8")
        .ok_or((StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 1. Touch the session; unknown slugs never start anything
    if state.registry.touch(slug).await == TouchOutcome::Unknown {
        return Err((StatusCode::NOT_FOUND, format!("Unknown stream [{}]", slug)));
    }

    // 2. Wait for the playlist, re-touching so a session that was mid-teardown
    //    gets recreated instead of leaving the viewer hanging
    let file_path = state.registry.output_dir(slug).join(PLAYLIST_NAME);
    let session_cfg = &state.config.session;
    let deadline = Instant::now() + Duration::from_millis(session_cfg.playlist_wait_ms);
    let poll = Duration::from_millis(session_cfg.playlist_poll_ms.max(1));
    let mut logged = false;

    while !tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
        if Instant::now() >= deadline {
            warn!("Playlist for [{}] not ready in time", slug);
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(header::RETRY_AFTER, RETRY_AFTER_SECS)
                .body(Body::from("Stream starting, retry shortly"))
                .map_err(internal)?);
        }
        if !logged {
            info!("Waiting for HLS generation: {:?}", file_path);
            logged = true;
        }
        tokio::time::sleep(poll).await;
        state.registry.touch(slug).await;
    }

    stream_file(&file_path, true).await
}

/// `GET /hls/{slug}/{file}`
///
/// 刷新会话活跃时间并返回切片
pub async fn serve_segment(
    State(state): State<SharedState>,
    Path((slug, file_name)): Path<(String, String)>,
) -> HlsResult {
    if !is_safe_file_name(&file_name) {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }
    if state.registry.refresh(&slug).is_none() {
        return Err((StatusCode::NOT_FOUND, "Stream not running".to_string()));
    }

    let mut file_path = PathBuf::from(&state.config.server.hls_root);
    file_path.push(&slug);
    file_path.push(&file_name);

    stream_file(&file_path, file_name.ends_with(".m3u8")).await
}

async fn stream_file(file_path: &FsPath, playlist: bool) -> HlsResult {
    let file = File::open(file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    let content_type = content_type(file_path);
    let cache_control = if playlist { "no-cache" } else { "max-age=60" };

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(internal)
}

fn content_type(path: &FsPath) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string(),
    }
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
