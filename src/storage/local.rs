use super::{BoxedReader, BoxedWriter, FileFingerprint, LocalEntry, LocalFileSystem};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use walkdir::WalkDir;

/// 本地磁盘
#[derive(Debug, Default, Clone)]
pub struct DiskFileSystem;

impl DiskFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    fn to_utc(time: SystemTime) -> DateTime<Utc> {
        DateTime::<Utc>::from(time)
    }
}

#[async_trait]
impl LocalFileSystem for DiskFileSystem {
    async fn list_files(&self, root: &Path) -> Result<Vec<LocalEntry>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let base: PathBuf = root.to_path_buf();

        // 使用 spawn_blocking 避免阻塞 async runtime；任何条目读取失败都中止整个列举
        tokio::task::spawn_blocking(move || -> Result<Vec<LocalEntry>> {
            let mut files = Vec::new();

            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(|e| {
                    SyncError::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                    )
                })?;

                if !entry.file_type().is_file() {
                    continue;
                }

                let metadata = entry.metadata().map_err(|e| {
                    SyncError::Io(
                        e.into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("metadata read failed")),
                    )
                })?;

                let relative = entry
                    .path()
                    .strip_prefix(&base)
                    .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

                files.push(LocalEntry {
                    relative_path: Self::normalize_path(&relative.to_string_lossy()),
                    path: entry.path().to_path_buf(),
                    fingerprint: FileFingerprint::new(
                        metadata.len(),
                        Self::to_utc(metadata.modified()?),
                    ),
                });
            }

            Ok(files)
        })
        .await?
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileFingerprint>> {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileFingerprint::new(
                metadata.len(),
                Self::to_utc(metadata.modified()?),
            ))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn open_read(&self, path: &Path) -> Result<(BoxedReader, u64)> {
        let file = fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }

    async fn create_file(&self, path: &Path) -> Result<BoxedWriter> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()> {
        let path = path.to_path_buf();
        let time: SystemTime = modified.into();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_modified(time)?;
            Ok(())
        })
        .await?
    }
}
