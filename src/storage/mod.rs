pub mod local;
#[cfg(test)]
pub mod memory;
pub mod sftp;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use local::DiskFileSystem;
pub use sftp::{SftpConnector, SftpRemote};

// ============ 公共常量 ============

/// 建立连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 15;
/// 单个远程操作超时（秒）- stat, list, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// 传输分块大小，每块结束时检查取消并上报进度
pub const COPY_CHUNK_SIZE: usize = 32 * 1024;

/// 文件指纹：大小 + 修改时间，不做内容哈希
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    pub size: u64,
    pub modified_at_utc: DateTime<Utc>,
}

impl FileFingerprint {
    pub fn new(size: u64, modified_at_utc: DateTime<Utc>) -> Self {
        Self {
            size,
            modified_at_utc,
        }
    }
}

/// 远程目录项
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    /// 完整远程路径（以 / 开头）
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at_utc: DateTime<Utc>,
}

impl RemoteEntry {
    /// `.` 和 `..` 不参与遍历
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    pub fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint::new(self.size, self.modified_at_utc)
    }
}

/// 本地文件（仅文件，不含目录）
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// 相对根目录的路径，统一使用 `/` 分隔
    pub relative_path: String,
    pub path: PathBuf,
    pub fingerprint: FileFingerprint,
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// 远程登录凭据
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// 传输进度回调：参数为已传输字节数，返回 `Break` 表示在当前分块边界中止
pub type OnProgress<'a> = &'a mut (dyn FnMut(u64) -> ControlFlow<()> + Send);

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// 远程文件系统（已连接的会话）
#[async_trait]
pub trait RemoteFileSystem: Send + Sync {
    /// 按协议返回的顺序列出目录内容
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// 获取文件属性
    async fn get_attributes(&self, path: &str) -> Result<FileFingerprint>;

    /// 检查路径是否存在
    async fn exists(&self, path: &str) -> Result<bool>;

    /// 上传：从 reader 读取并写入远程路径（覆盖），返回字节数
    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        remote_path: &str,
        on_progress: OnProgress<'_>,
    ) -> Result<u64>;

    /// 下载：读取远程文件写入 writer，返回字节数
    async fn download_file(
        &self,
        remote_path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
        on_progress: OnProgress<'_>,
    ) -> Result<u64>;

    /// 创建目录，自动创建中间各级，已存在时不报错
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    /// 删除空目录（子项由调用方先行删除）
    async fn delete_directory(&self, path: &str) -> Result<()>;

    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// 设置修改时间，不支持的实现可以忽略
    async fn set_modified(&self, _path: &str, _modified: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()>;

    /// 名称（用于日志）
    fn name(&self) -> &str;
}

/// 远程连接工厂
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteFileSystem>>;
}

/// 本地文件系统
#[async_trait]
pub trait LocalFileSystem: Send + Sync {
    /// 递归列出 root 下所有文件；root 不存在时返回空列表
    async fn list_files(&self, root: &Path) -> Result<Vec<LocalEntry>>;

    /// 文件不存在时返回 None
    async fn stat(&self, path: &Path) -> Result<Option<FileFingerprint>>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// 打开文件读取，同时返回文件长度
    async fn open_read(&self, path: &Path) -> Result<(BoxedReader, u64)>;

    /// 创建（或截断）文件用于写入
    async fn create_file(&self, path: &Path) -> Result<BoxedWriter>;

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()>;
}

/// 分块复制。`direction` 决定读写两端的错误归类：
/// 下载时读端是远程（协议错误），写端是本地（IO 错误），上传相反。
pub async fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: TransferDirection,
    on_progress: OnProgress<'_>,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let remote_reads = direction == TransferDirection::Download;
    let classify = |e: std::io::Error, remote_side: bool| {
        if remote_side {
            SyncError::protocol("transfer", e)
        } else {
            SyncError::Io(e)
        }
    };

    if on_progress(0).is_break() {
        return Err(SyncError::Cancelled);
    }

    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(|e| classify(e, remote_reads))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| classify(e, !remote_reads))?;
        total += n as u64;

        if on_progress(total).is_break() {
            return Err(SyncError::Cancelled);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| classify(e, !remote_reads))?;
    Ok(total)
}

/// 拼接远程路径
pub fn join_remote_path(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() || dir == "/" {
        format!("/{}", name)
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// 远程路径的父目录，根目录的父目录仍是根目录
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if idx > 0 => trimmed[..idx].to_string(),
        _ => "/".to_string(),
    }
}

/// 远程路径的最后一段
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// 递归删除远程目录。使用显式栈后序删除，不受目录深度限制。
pub async fn delete_remote_tree(
    remote: &dyn RemoteFileSystem,
    root: &str,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut stack: Vec<(String, bool)> = vec![(root.to_string(), false)];
    let mut deleted = 0u64;

    while let Some((dir, expanded)) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if expanded {
            remote.delete_directory(&dir).await?;
            deleted += 1;
            continue;
        }

        // 先压入自身，子目录后压入，保证子目录先于父目录删除
        stack.push((dir.clone(), true));

        for entry in remote.list_directory(&dir).await? {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if entry.is_dot_entry() {
                continue;
            }
            if entry.is_dir {
                stack.push((entry.path, false));
            } else {
                debug!("删除远程文件: {}", entry.path);
                remote.delete_file(&entry.path).await?;
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}
