use crate::config::AppConfig;
use crate::directory::{is_valid_slug, Directory};
use crate::encoder::{self, EncoderJob, EncoderSupervisor};
use crate::pacing::{self, PacingExit};
use crate::placeholder;
use crate::session::{Session, SessionSnapshot, SessionState};
use crate::sink::FrameSink;
use crate::source::{self, FrameSourceFactory};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// `touch` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// 会话已存在, 刷新了活跃时间
    Refreshed(SessionState),
    /// 新建了会话, 启动流程在后台进行
    Started,
    /// slug 非法或不在目录中
    Unknown,
}

/// 会话注册表: slug -> 会话的唯一权威映射
pub struct SessionRegistry {
    config: Arc<AppConfig>,
    directory: Arc<dyn Directory>,
    sources: Arc<dyn FrameSourceFactory>,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<AppConfig>,
        directory: Arc<dyn Directory>,
        sources: Arc<dyn FrameSourceFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            sources,
            sessions: DashMap::new(),
        })
    }

    /// 观众请求信号
    ///
    /// 会话存在时只刷新活跃时间; 不存在时校验 slug 并原子地创建会话,
    /// 启动流程在后台执行, 调用方不会等待
    pub async fn touch(self: &Arc<Self>, slug: &str) -> TouchOutcome {
        if !is_valid_slug(slug) {
            return TouchOutcome::Unknown;
        }
        if let Some(state) = self.refresh(slug) {
            return TouchOutcome::Refreshed(state);
        }

        match self.directory.exists(slug).await {
            Ok(true) => {}
            Ok(false) => return TouchOutcome::Unknown,
            Err(e) => {
                warn!("Directory lookup for [{}] failed: {:#}", slug, e);
                return TouchOutcome::Unknown;
            }
        }

        let session = match self.sessions.entry(slug.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get();
                session.touch();
                return TouchOutcome::Refreshed(session.state());
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(slug));
                entry.insert(session.clone());
                session
            }
        };

        info!("Starting session [{}]", slug);
        tokio::spawn(self.clone().drive(session));
        TouchOutcome::Started
    }

    /// 只刷新已有会话的活跃时间, 不会创建会话
    pub fn refresh(&self, slug: &str) -> Option<SessionState> {
        self.sessions.get(slug).map(|session| {
            session.touch();
            session.state()
        })
    }

    pub fn state(&self, slug: &str) -> Option<SessionState> {
        self.sessions.get(slug).map(|session| session.state())
    }

    /// 停止会话并等待资源释放
    ///
    /// 幂等: 会话不存在或已在停止中时立即返回 false
    pub async fn stop(&self, slug: &str) -> bool {
        let Some(session) = self.sessions.get(slug).map(|s| s.value().clone()) else {
            return false;
        };
        if !session.begin_stopping() {
            debug!("Session [{}] already stopping", slug);
            return false;
        }

        info!("Stopping session [{}]", slug);
        session.cancel.cancel();
        session.released.cancelled().await;
        self.sessions
            .remove_if(slug, |_, current| Arc::ptr_eq(current, &session));
        info!("Session [{}] stopped.", slug);
        true
    }

    /// 所有会话的快照
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot(now))
            .collect();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        out
    }

    /// 空闲时间达到 `threshold` 的 STARTING / LIVE 会话
    pub fn idle_slugs(&self, now: Instant, threshold: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.state() != SessionState::Stopping && session.idle_for(now) >= threshold
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 重新读取目录, 停止目录中已不存在的会话, 返回被停止的 slug
    ///
    /// 目录读取失败时不停止任何会话
    pub async fn reconcile(self: &Arc<Self>) -> anyhow::Result<Vec<String>> {
        let known: BTreeSet<String> = self.directory.list_all().await?;
        let orphans: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|slug| !known.contains(slug))
            .collect();

        for slug in &orphans {
            info!("Session [{}] no longer listed upstream", slug);
        }
        self.stop_all(orphans.clone()).await;
        Ok(orphans)
    }

    /// 停止全部会话 (进程退出前调用)
    pub async fn shutdown(self: &Arc<Self>) {
        let all: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        self.stop_all(all).await;
    }

    async fn stop_all(self: &Arc<Self>, slugs: Vec<String>) {
        let mut tasks = JoinSet::new();
        for slug in slugs {
            let registry = self.clone();
            tasks.spawn(async move { registry.stop(&slug).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Stop task failed: {}", e);
            }
        }
    }

    /// 帧交接文件路径
    pub fn sink_path(&self, slug: &str) -> PathBuf {
        self.config.server.frame_root.join(format!("{}.jpg", slug))
    }

    /// HLS 输出目录
    pub fn output_dir(&self, slug: &str) -> PathBuf {
        encoder::output_dir(&self.config.server.hls_root, slug)
    }

    /// 会话任务: 持有渲染源与编码器, 退出时二者都已释放
    async fn drive(self: Arc<Self>, session: Arc<Session>) {
        let _released = session.released.clone().drop_guard();
        let slug = session.slug().to_string();

        let sink = FrameSink::new(self.sink_path(&slug));
        let output_dir = self.output_dir(&slug);
        let outcome = self.run_pipeline(&session, &sink, &output_dir).await;

        if let Err(e) = sink.remove().await {
            warn!("Failed to remove frame for [{}]: {:#}", slug, e);
        }
        match tokio::fs::remove_dir_all(&output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove output for [{}]: {}", slug, e),
        }

        match outcome {
            Ok(PacingExit::Cancelled) => debug!("Session [{}] pipeline released", slug),
            Ok(PacingExit::Fatal { consecutive_errors }) => warn!(
                "Session [{}] stopping after {} consecutive capture errors",
                slug, consecutive_errors
            ),
            Err(e) => error!("Session [{}] start aborted: {:#}", slug, e),
        }

        // 自行退出 (致命错误 / 启动失败): 从注册表移除, 下一次 touch 可重新启动
        if !session.cancel.is_cancelled() {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.stop(&slug).await;
            });
        }
    }

    async fn run_pipeline(
        &self,
        session: &Session,
        sink: &FrameSink,
        output_dir: &Path,
    ) -> anyhow::Result<PacingExit> {
        let slug = session.slug();
        if session.cancel.is_cancelled() {
            return Ok(PacingExit::Cancelled);
        }

        check_memory(self.config.server.min_free_memory_kb)?;

        // 清理并创建 HLS 输出目录
        if tokio::fs::try_exists(output_dir).await.unwrap_or(false) {
            let _ = tokio::fs::remove_dir_all(output_dir).await;
        }
        tokio::fs::create_dir_all(output_dir).await?;

        // 占位帧先行, 编码器无需等待渲染源
        let (width, height) = (self.config.placeholder.width, self.config.placeholder.height);
        let owned = slug.to_string();
        let image =
            tokio::task::spawn_blocking(move || placeholder::render(&owned, width, height))
                .await??;
        sink.write(&image).await?;

        let job = EncoderJob {
            slug: slug.to_string(),
            input: sink.path().to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            fps: self.config.session.frame_rate,
        };
        info!("Session [{}] encoder starting. HLS Output: {:?}", slug, output_dir);
        let encoder = EncoderSupervisor::start(
            &self.config.encoder,
            job,
            sink.readiness(),
            session.encoder_restarts.clone(),
        );

        let result = self.feed(session, sink).await;
        encoder.stop(self.config.encoder.grace_period()).await;
        result
    }

    async fn feed(&self, session: &Session, sink: &FrameSink) -> anyhow::Result<PacingExit> {
        let slug = session.slug();
        let target = source::target_url(&self.config.source.target_url, slug);
        let launched = source::launch(
            self.sources.as_ref(),
            slug,
            &target,
            &self.config.source.launch,
            &session.cancel,
        )
        .await?;
        let Some(mut frame_source) = launched else {
            return Ok(PacingExit::Cancelled);
        };
        info!("Session [{}] source ready: {}", slug, target);

        let exit = pacing::run(
            slug,
            frame_source.as_mut(),
            sink,
            self.config.session.frame_period(),
            &self.config.capture,
            &session.pacing,
            &session.cancel,
            || mark_live(session),
        )
        .await;

        frame_source.close().await;
        Ok(exit)
    }
}

fn mark_live(session: &Session) {
    if session.promote_live() {
        // 启动耗时不计入空闲时间
        session.touch();
        info!("Session [{}] is live", session.slug());
    }
}

/// 可用内存过低时拒绝启动
fn check_memory(min_free_kb: u64) -> anyhow::Result<()> {
    if min_free_kb == 0 {
        return Ok(());
    }
    match sys_info::mem_info() {
        Ok(mem) => {
            if mem.avail < min_free_kb {
                return Err(anyhow::anyhow!(
                    "Insufficient system memory ({} KB available)",
                    mem.avail
                ));
            }
        }
        Err(e) => {
            // 无法获取内存信息时只记录警告, 不阻断流程
            warn!("Failed to check memory usage: {}", e);
        }
    }
    Ok(())
}
