//! 交互式同步
//!
//! 把规划结果转换成传输作业交给调度器执行，另外提供选中项的递归下载和远程删除。

use crate::core::dispatcher::{work_fn, TransferDispatcher, TransferJob};
use crate::core::planner::{
    ConflictMode, DiffPlanner, FileComparator, PlannedItem, SyncDecision,
};
use crate::core::transfer;
use crate::error::{Result, SyncError};
use crate::storage::{
    delete_remote_tree, join_remote_path, LocalFileSystem, RemoteEntry, RemoteFileSystem,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// 交互式同步入口：把规划结果转换成传输作业交给调度器
pub struct SyncEngine {
    remote: Arc<dyn RemoteFileSystem>,
    local: Arc<dyn LocalFileSystem>,
    dispatcher: Arc<TransferDispatcher>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteFileSystem>,
        local: Arc<dyn LocalFileSystem>,
        dispatcher: Arc<TransferDispatcher>,
    ) -> Self {
        Self {
            remote,
            local,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TransferDispatcher> {
        &self.dispatcher
    }

    fn planner(&self, cancel: &CancellationToken) -> DiffPlanner<'_> {
        DiffPlanner::new(self.remote.as_ref(), self.local.as_ref()).with_cancel(cancel.clone())
    }

    /// 把一个计划项放入传输队列
    pub fn enqueue_item(&self, item: PlannedItem) -> Result<Uuid> {
        let remote = self.remote.clone();
        let local = self.local.clone();
        let PlannedItem {
            remote_path,
            local_path,
            decision,
        } = item;

        match decision {
            SyncDecision::Download => {
                let job = TransferJob::download(&remote_path, &local_path);
                self.dispatcher.enqueue(
                    job,
                    work_fn(move |token, sink| async move {
                        transfer::download_file(
                            remote.as_ref(),
                            local.as_ref(),
                            &remote_path,
                            &local_path,
                            &token,
                            &|f| sink.report(f),
                        )
                        .await
                        .map(|_| ())
                    }),
                )
            }
            SyncDecision::Upload => {
                let job = TransferJob::upload(&local_path, &remote_path);
                self.dispatcher.enqueue(
                    job,
                    work_fn(move |token, sink| async move {
                        transfer::upload_file(
                            remote.as_ref(),
                            local.as_ref(),
                            &local_path,
                            &remote_path,
                            &token,
                            &|f| sink.report(f),
                        )
                        .await
                        .map(|_| ())
                    }),
                )
            }
            SyncDecision::Skip => Err(SyncError::Config(format!(
                "skip decision cannot be queued: {}",
                remote_path
            ))),
        }
    }

    fn enqueue_plan(&self, plan: Vec<PlannedItem>) -> Result<Vec<Uuid>> {
        plan.into_iter()
            .filter(|item| item.decision != SyncDecision::Skip)
            .map(|item| self.enqueue_item(item))
            .collect()
    }

    /// 远程目录递归下载到本地（只下载需要更新的文件）
    pub async fn queue_download_sync(
        &self,
        remote_root: &str,
        local_root: &Path,
        mode: ConflictMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        self.local.create_dir_all(local_root).await?;
        let plan = self
            .planner(cancel)
            .plan_download_only(remote_root, local_root, mode)
            .await?;
        let ids = self.enqueue_plan(plan)?;
        info!("已排队下载同步: {} 个作业", ids.len());
        Ok(ids)
    }

    /// 双向同步
    pub async fn queue_bidirectional_sync(
        &self,
        remote_root: &str,
        local_root: &Path,
        mode: ConflictMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        self.local.create_dir_all(local_root).await?;
        let plan = self
            .planner(cancel)
            .plan_bidirectional(remote_root, local_root, mode)
            .await?;
        let ids = self.enqueue_plan(plan)?;
        info!("已排队双向同步: {} 个作业", ids.len());
        Ok(ids)
    }

    /// 下载前检查本地是否已有同名文件，用于决定是否询问冲突处理方式
    pub async fn has_conflicts(
        &self,
        remote_root: &str,
        local_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.planner(cancel)
            .has_conflicts(remote_root, local_root)
            .await
    }

    /// 把选中的远程文件和目录展开成下载计划。
    /// 目录下载到 `local_root/<目录名>/`，文件下载到 `local_root/`。
    pub async fn expand_selection(
        &self,
        selection: &[RemoteEntry],
        local_root: &Path,
        mode: ConflictMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlannedItem>> {
        let planner = self.planner(cancel);
        let comparator = FileComparator::default();
        let mut plan = Vec::new();

        for entry in selection.iter().filter(|e| !e.is_dot_entry()) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let local_path = local_root.join(&entry.name);
            if entry.is_dir {
                plan.extend(
                    planner
                        .plan_download_only(&entry.path, &local_path, mode)
                        .await?,
                );
                continue;
            }

            let local = self.local.stat(&local_path).await?;
            if comparator.should_download(&entry.fingerprint(), local.as_ref(), mode) {
                plan.push(PlannedItem {
                    remote_path: entry.path.clone(),
                    local_path,
                    decision: SyncDecision::Download,
                });
            }
        }

        debug!("选择展开为 {} 个下载", plan.len());
        Ok(plan)
    }

    /// 下载选中的文件和目录
    pub async fn queue_download_selection(
        &self,
        selection: &[RemoteEntry],
        local_root: &Path,
        mode: ConflictMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        let plan = self
            .expand_selection(selection, local_root, mode, cancel)
            .await?;
        self.enqueue_plan(plan)
    }

    /// 上传本地文件到远程目录
    pub fn queue_upload_files(&self, files: &[&Path], remote_dir: &str) -> Result<Vec<Uuid>> {
        files
            .iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        SyncError::Config(format!("not a file path: {}", path.display()))
                    })?;
                self.enqueue_item(PlannedItem {
                    remote_path: join_remote_path(remote_dir, &name),
                    local_path: path.to_path_buf(),
                    decision: SyncDecision::Upload,
                })
            })
            .collect()
    }

    /// 删除远程文件或目录（目录递归删除），返回删除的条目数
    pub async fn delete_remote(
        &self,
        entry: &RemoteEntry,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if entry.is_dir {
            let deleted = delete_remote_tree(self.remote.as_ref(), &entry.path, cancel).await?;
            info!("已删除远程目录: {} ({} 项)", entry.path, deleted);
            Ok(deleted)
        } else {
            self.remote.delete_file(&entry.path).await?;
            info!("已删除远程文件: {}", entry.path);
            Ok(1)
        }
    }
}
