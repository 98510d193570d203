use anyhow::Context;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 帧交接点: 抓帧循环写, 编码进程读
///
/// 正式路径要么不存在, 要么是完整图片: 每次写入先落到同目录的临时文件, 再重命名覆盖
pub struct FrameSink {
    path: PathBuf,
    tmp_path: PathBuf,
    accepting: Arc<AtomicBool>,
}

impl FrameSink {
    pub fn new(path: PathBuf) -> Self {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 共享就绪标志, 编码进程运行期间由监管任务置为 true
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.accepting.clone()
    }

    /// false 表示下游暂时无法接收新帧
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub async fn write(&self, image: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.tmp_path, image)
            .await
            .with_context(|| format!("failed to write {}", self.tmp_path.display()))?;
        tokio::fs::rename(&self.tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to publish {}", self.path.display()))?;
        Ok(())
    }

    /// 删除正式图片及残留的临时文件 (幂等)
    pub async fn remove(&self) -> anyhow::Result<()> {
        for path in [&self.tmp_path, &self.path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
            }
        }
        Ok(())
    }
}
