pub mod admin;
pub mod hls;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(admin::index_handler)) // 首页
        .route("/health", get(admin::health)) // 健康检查
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/status", get(admin::status)) // 会话状态
        .route("/reload", post(admin::reload)) // 目录重载
        .route("/sessions/:slug/touch", post(admin::handle_touch)) // 启动/保活
        .route("/sessions/:slug/stop", post(admin::handle_stop)) // 停止
        .route("/hls/:playlist", get(hls::serve_playlist)) // 播放列表
        .route("/hls/:slug/:file_name", get(hls::serve_segment)) // 切片
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::session::SessionState;
    use crate::state::AppState;
    use crate::testing::{
        alive, recorded_pid, test_config, FakeSourceFactory, SourceStats, StaticDirectory,
        ENCODER_PID_FILE,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        _dir: TempDir,
        state: SharedState,
        directory: Arc<StaticDirectory>,
        sources: Arc<SourceStats>,
    }

    fn harness(factory: FakeSourceFactory) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let directory = Arc::new(StaticDirectory::with(&["nfl", "nba"]));
        let sources = factory.stats.clone();
        let registry = SessionRegistry::new(config.clone(), directory.clone(), Arc::new(factory));
        let state = Arc::new(AppState {
            config,
            registry,
            started_at: Instant::now(),
        });
        Harness {
            _dir: dir,
            state,
            directory,
            sources,
        }
    }

    async fn send(state: &SharedState, method: &str, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    async fn wait_for_state(state: &SharedState, slug: &str, want: SessionState) -> bool {
        for _ in 0..250 {
            if state.registry.state(slug) == Some(want) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn wait_gone(state: &SharedState, slug: &str) -> bool {
        for _ in 0..250 {
            if state.registry.state(slug).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(FakeSourceFactory::default());
        let (status, _, body) = send(&h.state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_playlist_is_not_found() {
        let h = harness(FakeSourceFactory::default());
        let (status, _, _) = send(&h.state, "GET", "/hls/curling.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&h.state, "GET", "/hls/nfl.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.state.registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_playlist_served_from_preroll() {
        // the real source would take far longer than the request
        let h = harness(FakeSourceFactory::default().open_delay(Duration::from_secs(30)));

        let started = Instant::now();
        let (status, headers, body) = send(&h.state, "GET", "/hls/nfl.m3u8").await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(body.starts_with(b"#EXTM3U"));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");

        h.state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_playlist_times_out_with_retry_later() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.encoder.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        config.session.playlist_wait_ms = 300;
        let config = Arc::new(config);
        let registry = SessionRegistry::new(
            config.clone(),
            Arc::new(StaticDirectory::with(&["nfl"])),
            Arc::new(FakeSourceFactory::default()),
        );
        let state = Arc::new(AppState {
            config,
            registry,
            started_at: Instant::now(),
        });

        let (status, headers, _) = send(&state, "GET", "/hls/nfl.m3u8").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(headers[header::RETRY_AFTER], "2");

        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_segment_requires_running_session() {
        let h = harness(FakeSourceFactory::default());
        let (status, _, _) = send(&h.state, "GET", "/hls/nfl/seg_00001.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&h.state, "GET", "/hls/nfl.m3u8").await;
        let segment = h.state.registry.output_dir("nfl").join("seg_00001.ts");
        std::fs::write(&segment, b"segment-bytes").unwrap();

        let (status, headers, body) = send(&h.state, "GET", "/hls/nfl/seg_00001.ts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"segment-bytes");
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");

        let (status, _, _) = send(&h.state, "GET", "/hls/nfl/seg_09999.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_reports_sessions() {
        let h = harness(FakeSourceFactory::default());
        let (status, _, _) = send(&h.state, "POST", "/sessions/nba/touch").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _, body) = send(&h.state, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let nba = &json["nba"];
        assert!(["STARTING", "LIVE"].contains(&nba["state"].as_str().unwrap()));
        assert!(nba["idleSeconds"].as_u64().is_some());

        let (status, _, _) = send(&h.state, "POST", "/sessions/nba/stop").await;
        assert_eq!(status, StatusCode::OK);
        let (_, _, body) = send(&h.state, "GET", "/status").await;
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_reload_stops_removed_slugs() {
        let h = harness(FakeSourceFactory::default());
        send(&h.state, "POST", "/sessions/nfl/touch").await;
        let (status, _, _) = send(&h.state, "GET", "/hls/nba.m3u8").await;
        assert_eq!(status, StatusCode::OK);
        let nba_sink = h.state.registry.sink_path("nba");
        let nba_pid = recorded_pid(&h.state.registry.output_dir("nba").join(ENCODER_PID_FILE))
            .expect("encoder pid recorded before the playlist");
        assert!(alive(nba_pid));
        for slug in ["nfl", "nba"] {
            assert!(wait_for_state(&h.state, slug, SessionState::Live).await);
        }

        h.directory.remove("nba");
        let (status, _, _) = send(&h.state, "POST", "/reload").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        assert!(wait_gone(&h.state, "nba").await);
        assert!(!nba_sink.exists());
        assert!(!alive(nba_pid));
        assert_eq!(h.sources.closes(), 1);
        assert!(h.state.registry.state("nfl").is_some());

        // the removed slug is now unknown
        let (status, _, _) = send(&h.state, "GET", "/hls/nba.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.state.registry.shutdown().await;
    }
}
