//! 渲染源: 把页面渲染成静态图片

use crate::config::{RetryPolicy, SourceConfig};
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单个渲染实例, 由一个会话独占
#[async_trait]
pub trait FrameSource: Send {
    async fn capture(&mut self) -> anyhow::Result<Bytes>;

    /// 连续抓帧失败后重置
    async fn reset(&mut self) -> anyhow::Result<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait FrameSourceFactory: Send + Sync {
    async fn open(&self, slug: &str, target_url: &str) -> anyhow::Result<Box<dyn FrameSource>>;
}

#[derive(Serialize)]
struct ScreenshotRequest<'a> {
    url: &'a str,
    width: u32,
    height: u32,
    quality: u8,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// 基于无头渲染服务的渲染源: POST 请求返回 `url` 的 JPEG 截图
pub struct HttpFrameSource {
    slug: String,
    target_url: String,
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpFrameSource {
    fn build_client(config: &SourceConfig) -> anyhow::Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?)
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn capture(&mut self) -> anyhow::Result<Bytes> {
        let request = ScreenshotRequest {
            url: &self.target_url,
            width: self.config.width,
            height: self.config.height,
            quality: self.config.quality,
            kind: "jpeg",
        };
        let response = self
            .client
            .post(&self.config.render_url)
            .json(&request)
            .send()
            .await
            .context("render service unreachable")?;

        let status = response.status();
        if !status.is_success() {
            bail!("render service returned {}", status);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            bail!("render service returned an empty image");
        }
        Ok(body)
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        info!("Resetting render client for [{}]", self.slug);
        self.client = Self::build_client(&self.config)?;
        Ok(())
    }

    async fn close(&mut self) {
        debug!("Render source for [{}] closed", self.slug);
    }
}

pub struct HttpFrameSourceFactory {
    config: SourceConfig,
}

impl HttpFrameSourceFactory {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FrameSourceFactory for HttpFrameSourceFactory {
    async fn open(&self, slug: &str, target_url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
        let mut source = HttpFrameSource {
            slug: slug.to_string(),
            target_url: target_url.to_string(),
            client: HttpFrameSource::build_client(&self.config)?,
            config: self.config.clone(),
        };
        // 预热: 确认渲染服务能出图
        source
            .capture()
            .await
            .with_context(|| format!("warm-up capture for [{}] failed", slug))?;
        Ok(Box::new(source))
    }
}

/// 按 `policy` 启动渲染源, 失败后退避重试
///
/// `cancel` 先触发时返回 `Ok(None)`
pub async fn launch(
    factory: &dyn FrameSourceFactory,
    slug: &str,
    target_url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<Box<dyn FrameSource>>> {
    let mut failures = 0;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            r = factory.open(slug, target_url) => r,
        };
        match attempt {
            Ok(source) => return Ok(Some(source)),
            Err(e) => {
                failures += 1;
                if policy.exhausted(failures) {
                    return Err(e.context(format!("source launch gave up after {} attempts", failures)));
                }
                let delay = policy.backoff(failures - 1);
                warn!(
                    "Source launch for [{}] failed ({}), retrying in {:?}: {:#}",
                    slug, failures, delay, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// 替换目标地址模板中的 `{slug}`
pub fn target_url(template: &str, slug: &str) -> String {
    template.replace("{slug}", slug)
}
