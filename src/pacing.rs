//! 每个会话的抓帧循环: 抓帧 -> 交接 -> 睡到下一个截止时间

use crate::config::CapturePolicy;
use crate::sink::FrameSink;
use crate::source::FrameSource;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 截止时间与漂移校正
///
/// 落后超过两个周期时按整周期快进, 不补发积压的帧
#[derive(Debug)]
pub struct Pacer {
    next: Instant,
    period: Duration,
}

impl Pacer {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self { next: start, period }
    }

    /// 结束本轮, 返回下一个截止时间以及为消化积压而丢弃的帧位数
    pub fn advance(&mut self, now: Instant) -> (Instant, u32) {
        let mut skipped = 0;
        let lag = now.saturating_duration_since(self.next);
        if lag > self.period * 2 {
            skipped = (lag.as_nanos() / self.period.as_nanos().max(1)) as u32;
            self.next += self.period * skipped;
        }
        self.next += self.period;
        (self.next, skipped)
    }
}

/// 抓帧循环的实时计数, 供状态接口读取
#[derive(Debug, Default)]
pub struct PacingStats {
    /// 连续失败次数, 每成功发布一帧清零
    pub capture_errors: AtomicU32,
    pub frames_written: AtomicU64,
    pub frames_skipped: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PacingExit {
    Cancelled,
    Fatal { consecutive_errors: u32 },
}

/// 运行直到 `cancel` 触发, 或连续失败达到 `policy.fatal_after`
///
/// 观察到取消后不再发起抓帧; 取消触发时正在进行的抓帧直接放弃
pub async fn run<F>(
    slug: &str,
    source: &mut dyn FrameSource,
    sink: &FrameSink,
    period: Duration,
    policy: &CapturePolicy,
    stats: &PacingStats,
    cancel: &CancellationToken,
    on_frame: F,
) -> PacingExit
where
    F: Fn() + Send + Sync,
{
    let mut pacer = Pacer::new(Instant::now(), period);

    loop {
        if cancel.is_cancelled() {
            return PacingExit::Cancelled;
        }

        if !sink.is_accepting() {
            // 编码器暂不可读: 丢帧而不是缓存
            stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            let captured = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PacingExit::Cancelled,
                r = source.capture() => r,
            };
            let published = match captured {
                Ok(image) => sink.write(&image).await,
                Err(e) => Err(e),
            };

            match published {
                Ok(()) => {
                    stats.capture_errors.store(0, Ordering::Relaxed);
                    stats.frames_written.fetch_add(1, Ordering::Relaxed);
                    on_frame();
                }
                Err(e) => {
                    let errors = stats.capture_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors >= policy.fatal_after {
                        error!(
                            "Capture for [{}] failed {} times in a row, giving up: {:#}",
                            slug, errors, e
                        );
                        return PacingExit::Fatal {
                            consecutive_errors: errors,
                        };
                    }
                    if policy.reset_after > 0 && errors % policy.reset_after == 0 {
                        warn!(
                            "Capture for [{}] failed {} times in a row, resetting source: {:#}",
                            slug, errors, e
                        );
                        if let Err(e) = source.reset().await {
                            warn!("Source reset for [{}] failed: {:#}", slug, e);
                        }
                    } else {
                        debug!("Capture for [{}] failed ({}): {:#}", slug, errors, e);
                    }
                }
            }
        }

        let (deadline, skipped) = pacer.advance(Instant::now());
        if skipped > 0 {
            stats
                .frames_skipped
                .fetch_add(skipped as u64, Ordering::Relaxed);
            debug!("[{}] fell behind, skipped {} frame slots", slug, skipped);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PacingExit::Cancelled,
            _ = sleep_until(deadline) => {}
        }
    }
}
