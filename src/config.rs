use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub capture: CapturePolicy,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub placeholder: PlaceholderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// HLS 切片存储根目录 (每个 slug 一个子目录)
    /// 建议配置为 /dev/shm/scorestream/hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: PathBuf,

    /// 帧交接文件根目录 (每个 slug 一个 JPEG)
    #[serde(default = "default_frame_root")]
    pub frame_root: PathBuf,

    /// 可用内存低于该值 (KB) 时拒绝启动新会话
    #[serde(default = "default_min_free_memory_kb")]
    pub min_free_memory_kb: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    /// slug 目录文件, 由外部进程刷新
    #[serde(default = "default_directory_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// 目标帧率 (每秒抓帧次数)
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// 无观众多久后回收会话
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 空闲回收扫描间隔
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// 播放列表首次生成的最长等待时间
    #[serde(default = "default_playlist_wait_ms")]
    pub playlist_wait_ms: u64,
    #[serde(default = "default_playlist_poll_ms")]
    pub playlist_poll_ms: u64,
}

/// 抓帧错误阈值
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CapturePolicy {
    /// 连续失败达到该次数时重置渲染源
    pub reset_after: u32,
    /// 连续失败达到该次数时终止会话
    pub fatal_after: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// 无头渲染服务地址
    #[serde(default = "default_render_url")]
    pub render_url: String,
    /// 被渲染页面地址模板, `{slug}` 会被替换
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
    /// 渲染源启动重试策略
    #[serde(default = "default_launch_policy")]
    pub launch: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// 参数模板, 支持 `{input}` `{fps}` `{output_dir}` `{slug}`
    #[serde(default = "default_encoder_args")]
    pub args: Vec<String>,
    /// SIGTERM 之后等待进程自行退出的时间
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// 进程意外退出后的重启策略
    #[serde(default = "default_restart_policy")]
    pub restart: RetryPolicy,
    /// 进程稳定运行超过该时长后清零重启计数
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlaceholderConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大重试次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (毫秒)
    pub initial_backoff_ms: u64,
    /// 最大退避时间 (毫秒), 与初始值相同时即为固定退避
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// 第 `attempt` 次 (从 0 开始) 失败之后的等待时间, 指数增长并封顶
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    /// 已失败 `attempts` 次后是否应当放弃
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 2000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            reset_after: 30,
            fatal_after: 100,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hls_root: default_hls_root(),
            frame_root: default_frame_root(),
            min_free_memory_kb: default_min_free_memory_kb(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_directory_path(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            playlist_wait_ms: default_playlist_wait_ms(),
            playlist_poll_ms: default_playlist_poll_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            render_url: default_render_url(),
            target_url: default_target_url(),
            width: default_width(),
            height: default_height(),
            quality: default_quality(),
            timeout_ms: default_source_timeout_ms(),
            launch: default_launch_policy(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            args: default_encoder_args(),
            grace_period_ms: default_grace_period_ms(),
            restart: default_restart_policy(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

impl SessionConfig {
    /// 帧间隔
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

impl EncoderConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_hls_root() -> PathBuf {
    PathBuf::from("./static/hls")
}

fn default_frame_root() -> PathBuf {
    PathBuf::from("./static/frames")
}

fn default_min_free_memory_kb() -> u64 {
    5120
}

fn default_directory_path() -> PathBuf {
    PathBuf::from("/config/streams.json")
}

fn default_frame_rate() -> u32 {
    4
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_reaper_interval_secs() -> u64 {
    5
}

fn default_playlist_wait_ms() -> u64 {
    15_000
}

fn default_playlist_poll_ms() -> u64 {
    200
}

fn default_render_url() -> String {
    "http://127.0.0.1:3000/screenshot".to_string()
}

fn default_target_url() -> String {
    "http://127.0.0.1:8080/display/{slug}".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_quality() -> u8 {
    80
}

fn default_source_timeout_ms() -> u64 {
    10_000
}

fn default_launch_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 2000,
        max_backoff_ms: 8000,
    }
}

fn default_restart_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 0,
        initial_backoff_ms: 2500,
        max_backoff_ms: 2500,
    }
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_stable_after_secs() -> u64 {
    30
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_encoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-re",
        "-f",
        "image2",
        "-loop",
        "1",
        "-framerate",
        "{fps}",
        "-i",
        "{input}",
        "-f",
        "lavfi",
        "-i",
        "anullsrc=channel_layout=stereo:sample_rate=44100",
        "-map",
        "0:v",
        "-map",
        "1:a",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-tune",
        "stillimage",
        "-pix_fmt",
        "yuv420p",
        "-force_key_frames",
        "expr:gte(t,n_forced*2)",
        "-c:a",
        "aac",
        "-b:a",
        "64k",
        "-f",
        "hls",
        "-hls_time",
        "2",
        "-hls_list_size",
        "6",
        "-hls_flags",
        "delete_segments+temp_file+omit_endlist",
        "-hls_base_url",
        "{slug}/",
        "-hls_segment_filename",
        "{output_dir}/seg_%05d.ts",
        "{output_dir}/index.m3u8",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
