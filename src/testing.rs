//! 单元测试共用的外部依赖替身 (目录, 渲染源, 编码脚本)

use crate::config::{AppConfig, RetryPolicy};
use crate::directory::Directory;
use crate::source::{FrameSource, FrameSourceFactory};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct StaticDirectory {
    slugs: Mutex<BTreeSet<String>>,
    broken: AtomicBool,
}

impl StaticDirectory {
    pub fn with(slugs: &[&str]) -> Self {
        let dir = Self::default();
        for slug in slugs {
            dir.insert(slug);
        }
        dir
    }

    pub fn insert(&self, slug: &str) {
        self.slugs.lock().unwrap().insert(slug.to_string());
    }

    pub fn remove(&self, slug: &str) {
        self.slugs.lock().unwrap().remove(slug);
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_all(&self) -> anyhow::Result<BTreeSet<String>> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("directory store unavailable");
        }
        Ok(self.slugs.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct SourceStats {
    opens: AtomicU32,
    captures: AtomicU32,
    resets: AtomicU32,
    closes: AtomicU32,
}

impl SourceStats {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum CaptureMode {
    Succeed,
    FailFirst(u32),
    AlwaysFail,
}

pub struct FakeSource {
    stats: Arc<SourceStats>,
    mode: CaptureMode,
    delay: Duration,
    /// 只作用于第一次抓帧
    first_delay: Option<Duration>,
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn capture(&mut self) -> anyhow::Result<Bytes> {
        let delay = self.first_delay.take().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let n = self.stats.captures.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            CaptureMode::AlwaysFail => bail!("page crashed"),
            CaptureMode::FailFirst(k) if n <= k => bail!("page crashed"),
            _ => Ok(Bytes::from(format!("frame-{}", n))),
        }
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSourceFactory {
    pub stats: Arc<SourceStats>,
    failing_opens: AtomicU32,
    open_delay: Duration,
    capture_delay: Duration,
    first_capture_delay: Option<Duration>,
    mode: CaptureMode,
}

impl Default for FakeSourceFactory {
    fn default() -> Self {
        Self {
            stats: Arc::default(),
            failing_opens: AtomicU32::new(0),
            open_delay: Duration::ZERO,
            capture_delay: Duration::ZERO,
            first_capture_delay: None,
            mode: CaptureMode::Succeed,
        }
    }
}

impl FakeSourceFactory {
    pub fn fail_opens(self, n: u32) -> Self {
        self.failing_opens.store(n, Ordering::SeqCst);
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// 只有第一次抓帧慢, 之后立即返回
    pub fn first_capture_delay(mut self, delay: Duration) -> Self {
        self.first_capture_delay = Some(delay);
        self
    }

    pub fn fail_first_captures(mut self, n: u32) -> Self {
        self.mode = CaptureMode::FailFirst(n);
        self
    }

    pub fn always_fail(mut self) -> Self {
        self.mode = CaptureMode::AlwaysFail;
        self
    }

    pub fn source(&self) -> FakeSource {
        FakeSource {
            stats: self.stats.clone(),
            mode: self.mode,
            delay: self.capture_delay,
            first_delay: self.first_capture_delay,
        }
    }
}

#[async_trait]
impl FrameSourceFactory for FakeSourceFactory {
    async fn open(&self, _slug: &str, _target_url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            bail!("browser failed to launch");
        }
        Ok(Box::new(self.source()))
    }
}

/// 编码器脚本写入的 pid 文件名 (位于输出目录)
pub const ENCODER_PID_FILE: &str = "pid";

/// 编码器替身: 记录 pid, 写出播放列表, 然后一直运行到被终止
pub fn encoder_script(prelude: &str) -> Vec<String> {
    vec![
        "-c".to_string(),
        format!(
            "{}mkdir -p {{output_dir}} && echo $$ > {{output_dir}}/{} && printf '#EXTM3U\\n' > {{output_dir}}/index.m3u8 && exec sleep 30",
            prelude, ENCODER_PID_FILE
        ),
    ]
}

/// 读取脚本用 `echo $$` 记录的 pid
pub fn recorded_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
pub fn alive(pid: u32) -> bool {
    // SAFETY: signal 0 只做存在性检查
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// 所有输出都落在 `root` 下的测试配置, 编码器为 [`encoder_script`]
pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.hls_root = root.join("hls");
    config.server.frame_root = root.join("frames");
    config.server.min_free_memory_kb = 0;
    config.session.playlist_wait_ms = 3000;
    config.session.playlist_poll_ms = 20;
    config.source.launch = RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 20,
        max_backoff_ms: 20,
    };
    config.encoder.binary = "sh".to_string();
    config.encoder.args = encoder_script("");
    config.encoder.grace_period_ms = 1000;
    config.encoder.restart = RetryPolicy {
        max_attempts: 0,
        initial_backoff_ms: 50,
        max_backoff_ms: 50,
    };
    config.placeholder.width = 160;
    config.placeholder.height = 90;
    config
}
