//! 单文件传输
//!
//! 在远程和本地协作者之间分块复制文件，每个分块边界检查取消并上报进度比例。
//! 传输完成后把目标端的修改时间对齐到源端，避免下一轮比较再次判定为更新。

use crate::error::{Result, SyncError};
use crate::storage::{remote_parent, LocalFileSystem, RemoteFileSystem};
use std::ops::ControlFlow;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 进度比例回调（0.0 ~ 1.0）
pub type FractionFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    }
}

/// 下载单个文件，返回传输字节数
pub async fn download_file(
    remote: &dyn RemoteFileSystem,
    local: &dyn LocalFileSystem,
    remote_path: &str,
    local_path: &Path,
    cancel: &CancellationToken,
    progress: FractionFn<'_>,
) -> Result<u64> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let attrs = remote.get_attributes(remote_path).await?;
    if let Some(parent) = local_path.parent() {
        local.create_dir_all(parent).await?;
    }
    let mut writer = local.create_file(local_path).await?;

    let total = attrs.size;
    let mut on_progress = |bytes: u64| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        progress(fraction(bytes, total));
        ControlFlow::Continue(())
    };

    let bytes = remote
        .download_file(remote_path, &mut *writer, &mut on_progress)
        .await?;
    writer.shutdown().await?;
    drop(writer);

    local.set_modified(local_path, attrs.modified_at_utc).await?;
    progress(1.0);

    debug!("下载完成: {} -> {:?} ({} bytes)", remote_path, local_path, bytes);
    Ok(bytes)
}

/// 上传单个文件，远程父目录不存在时自动创建
pub async fn upload_file(
    remote: &dyn RemoteFileSystem,
    local: &dyn LocalFileSystem,
    local_path: &Path,
    remote_path: &str,
    cancel: &CancellationToken,
    progress: FractionFn<'_>,
) -> Result<u64> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let (mut reader, total) = local.open_read(local_path).await?;

    let parent = remote_parent(remote_path);
    if parent != "/" {
        remote.create_directory(&parent).await?;
    }

    let mut on_progress = |bytes: u64| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        progress(fraction(bytes, total));
        ControlFlow::Continue(())
    };

    let bytes = remote
        .upload_file(&mut *reader, remote_path, &mut on_progress)
        .await?;

    // 部分服务器不允许 setstat，失败不影响上传结果
    if let Some(fingerprint) = local.stat(local_path).await? {
        if let Err(e) = remote
            .set_modified(remote_path, fingerprint.modified_at_utc)
            .await
        {
            warn!("设置远程修改时间失败: {}: {}", remote_path, e);
        }
    }
    progress(1.0);

    debug!("上传完成: {:?} -> {} ({} bytes)", local_path, remote_path, bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRemote;
    use crate::storage::DiskFileSystem;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_download_creates_parents_and_copies_mtime() {
        let remote = MemoryRemote::new();
        remote.add_file("/docs/deep/a.bin", &[3u8; 1000], 1_500_000_000);
        let dir = tempdir().unwrap();
        let local = DiskFileSystem::new();
        let target = dir.path().join("deep").join("a.bin");
        let seen = Mutex::new(Vec::new());

        let bytes = download_file(
            &remote,
            &local,
            "/docs/deep/a.bin",
            &target,
            &CancellationToken::new(),
            &|f| seen.lock().unwrap().push(f),
        )
        .await
        .unwrap();

        assert_eq!(bytes, 1000);
        assert_eq!(std::fs::read(&target).unwrap(), vec![3u8; 1000]);
        let fp = local.stat(&target).await.unwrap().unwrap();
        assert_eq!(fp.modified_at_utc.timestamp(), 1_500_000_000);
        assert_eq!(seen.lock().unwrap().last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_upload_creates_remote_parent() {
        let remote = MemoryRemote::new();
        let dir = tempdir().unwrap();
        let source = dir.path().join("up.txt");
        std::fs::write(&source, b"payload").unwrap();
        let local = DiskFileSystem::new();

        let bytes = upload_file(
            &remote,
            &local,
            &source,
            "/in/box/up.txt",
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .unwrap();

        assert_eq!(bytes, 7);
        assert!(remote.exists("/in/box").await.unwrap());
        assert_eq!(remote.file_data("/in/box/up.txt").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_cancelled_transfer_reports_cancelled() {
        let remote = MemoryRemote::new();
        remote.add_file("/a.bin", &[0u8; 10], 10);
        let dir = tempdir().unwrap();
        let local = DiskFileSystem::new();
        let token = CancellationToken::new();
        token.cancel();

        let result = download_file(
            &remote,
            &local,
            "/a.bin",
            &dir.path().join("a.bin"),
            &token,
            &|_| {},
        )
        .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
