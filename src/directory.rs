//! 只读的 slug 目录
//!
//! 目录文件由外部进程维护, 每次查询都重新读取, 重载总能看到最新内容

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

const MAX_SLUG_LEN: usize = 64;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn exists(&self, slug: &str) -> anyhow::Result<bool> {
        Ok(self.list_all().await?.contains(slug))
    }

    async fn list_all(&self) -> anyhow::Result<BTreeSet<String>>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    slugs: Vec<String>,
}

/// 基于 JSON 文件的目录, 格式为 `{"slugs": ["NFL", "nba"]}`
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn list_all(&self) -> anyhow::Result<BTreeSet<String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read directory {}", self.path.display()))?;
        let doc: DirectoryFile = serde_json::from_str(&content)
            .with_context(|| format!("malformed directory {}", self.path.display()))?;

        Ok(doc
            .slugs
            .iter()
            .map(|name| slugify(name))
            .filter(|slug| is_valid_slug(slug))
            .collect())
    }
}

/// "NCAA Basketball" -> "ncaa-basketball"
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// slug 同时用作路径组件, 只接受 `[a-z0-9_-]`
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}
