use crate::config::EncoderConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 编码进程的启动参数
#[derive(Debug, Clone)]
pub struct EncoderJob {
    pub slug: String,
    /// 帧交接文件
    pub input: PathBuf,
    /// HLS 输出目录
    pub output_dir: PathBuf,
    pub fps: u32,
}

/// 单个会话的编码进程监管任务句柄
pub struct EncoderHandle {
    slug: String,
    stop_tx: oneshot::Sender<Duration>,
    task: JoinHandle<()>,
}

pub struct EncoderSupervisor;

impl EncoderSupervisor {
    /// 启动编码进程并在后台监管
    ///
    /// # 行为
    /// - 进程运行期间 `readiness` 为 true
    /// - 进程意外退出后按 `config.restart` 退避重启, 输出目录保持不变
    /// - `restarts` 为连续重启次数, 进程稳定运行 `stable_after_secs` 后清零
    /// - 只有 [`EncoderHandle::stop`] 才会结束监管
    pub fn start(
        config: &EncoderConfig,
        job: EncoderJob,
        readiness: Arc<AtomicBool>,
        restarts: Arc<AtomicU32>,
    ) -> EncoderHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let slug = job.slug.clone();
        let task = tokio::spawn(supervise(
            config.clone(),
            job,
            readiness,
            restarts,
            stop_rx,
        ));

        EncoderHandle {
            slug,
            stop_tx,
            task,
        }
    }
}

impl EncoderHandle {
    /// 发送 SIGTERM, 最多等待 `grace`, 超时后强制结束
    ///
    /// 返回时进程一定已经退出
    pub async fn stop(self, grace: Duration) {
        let EncoderHandle {
            slug,
            stop_tx,
            task,
        } = self;
        let _ = stop_tx.send(grace);
        if let Err(e) = task.await {
            error!("Encoder supervisor for [{}] failed: {}", slug, e);
        }
    }
}

/// 构建编码命令, 替换参数模板中的占位符
pub fn build_command(config: &EncoderConfig, job: &EncoderJob) -> Command {
    let input = job.input.to_string_lossy();
    let output_dir = job.output_dir.to_string_lossy();
    let fps = job.fps.to_string();

    let mut cmd = Command::new(&config.binary);
    for arg in &config.args {
        let final_arg = arg
            .replace("{input}", &input)
            .replace("{output_dir}", &output_dir)
            .replace("{fps}", &fps)
            .replace("{slug}", &job.slug);
        cmd.arg(final_arg);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

async fn supervise(
    config: EncoderConfig,
    job: EncoderJob,
    readiness: Arc<AtomicBool>,
    restarts: Arc<AtomicU32>,
    mut stop_rx: oneshot::Receiver<Duration>,
) {
    let slug = job.slug.as_str();
    let stable_after = Duration::from_secs(config.stable_after_secs);
    let mut failures = 0u32;

    loop {
        let started = Instant::now();
        match spawn(&config, &job) {
            Ok(mut child) => {
                readiness.store(true, Ordering::Release);
                info!("Encoder for [{}] running (pid {:?})", slug, child.id());

                tokio::select! {
                    grace = &mut stop_rx => {
                        readiness.store(false, Ordering::Release);
                        terminate(slug, &mut child, grace.unwrap_or(config.grace_period())).await;
                        return;
                    }
                    status = child.wait() => {
                        readiness.store(false, Ordering::Release);
                        match status {
                            Ok(status) => warn!("Encoder for [{}] exited unexpectedly with: {}", slug, status),
                            Err(e) => error!("Encoder monitor error [{}]: {}", slug, e),
                        }
                    }
                }

                if started.elapsed() >= stable_after {
                    failures = 0;
                    restarts.store(0, Ordering::Relaxed);
                }
            }
            Err(e) => error!("Failed to spawn encoder for [{}]: {:#}", slug, e),
        }

        if config.restart.exhausted(failures + 1) {
            error!(
                "Encoder for [{}] reached max restart attempts ({}). Waiting for stop.",
                slug, config.restart.max_attempts
            );
            let _ = (&mut stop_rx).await;
            return;
        }

        let delay = config.restart.backoff(failures);
        failures += 1;
        restarts.store(failures, Ordering::Relaxed);
        warn!(
            "Encoder for [{}] restart {} in {:?}",
            slug, failures, delay
        );

        tokio::select! {
            _ = &mut stop_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn spawn(config: &EncoderConfig, job: &EncoderJob) -> anyhow::Result<Child> {
    let mut child = build_command(config, job).spawn()?;

    // 转发 stderr, 防止管道写满阻塞编码进程
    if let Some(stderr) = child.stderr.take() {
        let slug = job.slug.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[{}] encoder: {}", slug, line);
            }
        });
    }

    Ok(child)
}

async fn terminate(slug: &str, child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    if !send_sigterm(child) {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!("Encoder for [{}] stopped: {}", slug, status),
        Ok(Err(e)) => error!("Encoder wait failed [{}]: {}", slug, e),
        Err(_) => {
            warn!(
                "Encoder for [{}] ignored SIGTERM for {:?}, killing.",
                slug, grace
            );
            if let Err(e) = child.kill().await {
                error!("Failed to kill encoder [{}]: {}", slug, e);
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    match child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// 每个 slug 的输出目录
pub fn output_dir(hls_root: &Path, slug: &str) -> PathBuf {
    hls_root.join(slug)
}
