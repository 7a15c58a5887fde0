//! 目录树差异规划
//!
//! 遍历远程树（显式栈深度优先）与本地树，按大小 + 修改时间生成同步决策。
//! 规划要么完整返回，要么整体失败，不会返回部分结果。

use crate::error::{Result, SyncError};
use crate::storage::{
    join_remote_path, FileFingerprint, LocalFileSystem, RemoteEntry, RemoteFileSystem,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 冲突处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// 仅在两端不同时传输
    #[default]
    Skip,
    /// 两端都存在时总是传输
    Overwrite,
}

/// 同步决策
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDecision {
    Download,
    Upload,
    /// 比较结果，不会出现在计划中
    Skip,
}

/// 计划中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub decision: SyncDecision,
}

/// 两端文件的比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 大小相同，时间差在容差内
    Equal,
    /// 大小不同，时间差在容差内
    Different,
    RemoteNewer,
    LocalNewer,
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 时间容差（秒），吸收时钟偏差和时间戳精度差异
    pub time_tolerance_seconds: i64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            time_tolerance_seconds: 2,
        }
    }
}

/// 文件比较器：只看大小和修改时间，不做内容哈希
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn compare(&self, remote: &FileFingerprint, local: &FileFingerprint) -> FileRelation {
        let delta_ms = (remote.modified_at_utc - local.modified_at_utc).num_milliseconds();
        let tolerance_ms = self.config.time_tolerance_seconds * 1000;

        if delta_ms > tolerance_ms {
            FileRelation::RemoteNewer
        } else if delta_ms < -tolerance_ms {
            FileRelation::LocalNewer
        } else if remote.size != local.size {
            FileRelation::Different
        } else {
            FileRelation::Equal
        }
    }

    /// 仅下载模式：本地不存在、覆盖模式、大小不同或远程更新时下载
    pub fn should_download(
        &self,
        remote: &FileFingerprint,
        local: Option<&FileFingerprint>,
        mode: ConflictMode,
    ) -> bool {
        let Some(local) = local else {
            return true;
        };
        if mode == ConflictMode::Overwrite || remote.size != local.size {
            return true;
        }
        self.compare(remote, local) == FileRelation::RemoteNewer
    }

    /// 双向模式：较新的一端胜出，时间无法区分时以远程为准
    pub fn decide_bidirectional(
        &self,
        remote: &FileFingerprint,
        local: &FileFingerprint,
        mode: ConflictMode,
    ) -> SyncDecision {
        match self.compare(remote, local) {
            FileRelation::RemoteNewer => SyncDecision::Download,
            FileRelation::LocalNewer => SyncDecision::Upload,
            FileRelation::Different => SyncDecision::Download,
            FileRelation::Equal => match mode {
                ConflictMode::Overwrite => SyncDecision::Download,
                ConflictMode::Skip => SyncDecision::Skip,
            },
        }
    }
}

/// 规范化远程根目录：去空白，补前导 `/`，去尾部 `/`（根目录除外）
pub fn normalize_remote_root(remote_root: &str) -> String {
    let trimmed = remote_root.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }
    let mut root = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    while root.len() > 1 && root.ends_with('/') {
        root.pop();
    }
    root
}

/// 远程完整路径相对于根目录的路径（不以 `/` 开头）
pub fn relative_remote_path(root: &str, full_path: &str) -> String {
    let rest = if root == "/" {
        full_path
    } else {
        full_path.strip_prefix(root).unwrap_or(full_path)
    };
    rest.trim_start_matches('/').to_string()
}

/// 相对路径（`/` 分隔）映射到本地路径
pub fn local_path_for(local_root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(local_root.to_path_buf(), |path, segment| path.join(segment))
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(SyncError::Cancelled),
        _ => Ok(()),
    }
}

/// 远程树的深度优先遍历，每层目录是栈上的一个列举迭代器，
/// 文件按"父目录先于子项，同级按列举顺序"的顺序产出。
struct RemoteWalker<'a> {
    remote: &'a dyn RemoteFileSystem,
    cancel: Option<&'a CancellationToken>,
    root: Option<String>,
    stack: Vec<std::vec::IntoIter<RemoteEntry>>,
}

impl<'a> RemoteWalker<'a> {
    fn new(
        remote: &'a dyn RemoteFileSystem,
        root: &str,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            remote,
            cancel,
            root: Some(root.to_string()),
            stack: Vec::new(),
        }
    }

    async fn descend(&mut self, dir: &str) -> Result<()> {
        check_cancel(self.cancel)?;
        debug!("列出远程目录: {}", dir);
        let entries = self.remote.list_directory(dir).await?;
        self.stack.push(entries.into_iter());
        Ok(())
    }

    /// 下一个文件，遍历结束返回 None
    async fn next_file(&mut self) -> Result<Option<RemoteEntry>> {
        if let Some(root) = self.root.take() {
            self.descend(&root).await?;
        }

        loop {
            check_cancel(self.cancel)?;
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            match frame.next() {
                None => {
                    self.stack.pop();
                }
                Some(entry) if entry.is_dot_entry() => {}
                Some(entry) if entry.is_dir => self.descend(&entry.path).await?,
                Some(entry) => return Ok(Some(entry)),
            }
        }
    }
}

/// 差异规划器
pub struct DiffPlanner<'a> {
    remote: &'a dyn RemoteFileSystem,
    local: &'a dyn LocalFileSystem,
    comparator: FileComparator,
    cancel: Option<CancellationToken>,
}

impl<'a> DiffPlanner<'a> {
    pub fn new(remote: &'a dyn RemoteFileSystem, local: &'a dyn LocalFileSystem) -> Self {
        Self {
            remote,
            local,
            comparator: FileComparator::default(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_compare_config(mut self, config: CompareConfig) -> Self {
        self.comparator = FileComparator::with_config(config);
        self
    }

    fn validate_roots(remote_root: &str, local_root: &Path) -> Result<String> {
        if remote_root.trim().is_empty() {
            return Err(SyncError::Config("remote root is required".to_string()));
        }
        if local_root.as_os_str().is_empty() {
            return Err(SyncError::Config("local root is required".to_string()));
        }
        Ok(normalize_remote_root(remote_root))
    }

    /// 仅下载计划：边遍历边决策
    pub async fn plan_download_only(
        &self,
        remote_root: &str,
        local_root: &Path,
        mode: ConflictMode,
    ) -> Result<Vec<PlannedItem>> {
        let root = Self::validate_roots(remote_root, local_root)?;
        let mut walker = RemoteWalker::new(self.remote, &root, self.cancel.as_ref());
        let mut plan = Vec::new();

        while let Some(entry) = walker.next_file().await? {
            let relative = relative_remote_path(&root, &entry.path);
            let local_path = local_path_for(local_root, &relative);
            let local = self.local.stat(&local_path).await?;

            if self
                .comparator
                .should_download(&entry.fingerprint(), local.as_ref(), mode)
            {
                debug!("计划下载: {}", relative);
                plan.push(PlannedItem {
                    remote_path: entry.path,
                    local_path,
                    decision: SyncDecision::Download,
                });
            }
        }

        info!("下载计划完成: {} -> {:?}, {} 项", root, local_root, plan.len());
        Ok(plan)
    }

    /// 双向计划：先按远程遍历顺序输出下载和两端共有的项，再输出仅本地存在的上传项
    pub async fn plan_bidirectional(
        &self,
        remote_root: &str,
        local_root: &Path,
        mode: ConflictMode,
    ) -> Result<Vec<PlannedItem>> {
        let root = Self::validate_roots(remote_root, local_root)?;
        let cancel = self.cancel.as_ref();

        // 远程：保持遍历顺序，另建小写索引做大小写不敏感匹配
        let mut remote_files: Vec<(String, RemoteEntry)> = Vec::new();
        let mut remote_index: HashMap<String, usize> = HashMap::new();
        let mut walker = RemoteWalker::new(self.remote, &root, cancel);
        while let Some(entry) = walker.next_file().await? {
            let relative = relative_remote_path(&root, &entry.path);
            remote_index
                .entry(relative.to_lowercase())
                .or_insert(remote_files.len());
            remote_files.push((relative, entry));
        }

        check_cancel(cancel)?;
        let local_files = self.local.list_files(local_root).await?;
        let mut local_index: HashMap<String, usize> = HashMap::new();
        for (i, file) in local_files.iter().enumerate() {
            local_index
                .entry(file.relative_path.to_lowercase())
                .or_insert(i);
        }

        let mut plan = Vec::new();

        for (relative, entry) in &remote_files {
            check_cancel(cancel)?;
            let key = relative.to_lowercase();
            let local_path = local_path_for(local_root, relative);

            let decision = match local_index.get(&key) {
                None => SyncDecision::Download,
                Some(&i) => self.comparator.decide_bidirectional(
                    &entry.fingerprint(),
                    &local_files[i].fingerprint,
                    mode,
                ),
            };
            if decision == SyncDecision::Skip {
                continue;
            }

            // 两端都存在时使用本地实际路径（大小写可能不同）
            let local_path = local_index
                .get(&key)
                .map(|&i| local_files[i].path.clone())
                .unwrap_or(local_path);

            plan.push(PlannedItem {
                remote_path: entry.path.clone(),
                local_path,
                decision,
            });
        }

        for file in &local_files {
            check_cancel(cancel)?;
            if remote_index.contains_key(&file.relative_path.to_lowercase()) {
                continue;
            }
            plan.push(PlannedItem {
                remote_path: join_remote_path(&root, &file.relative_path),
                local_path: file.path.clone(),
                decision: SyncDecision::Upload,
            });
        }

        info!(
            "双向计划完成: {} <-> {:?}, {} 项",
            root,
            local_root,
            plan.len()
        );
        Ok(plan)
    }

    /// 是否存在两端同名的文件。遇到第一个即返回。
    pub async fn has_conflicts(&self, remote_root: &str, local_root: &Path) -> Result<bool> {
        let root = Self::validate_roots(remote_root, local_root)?;
        let mut walker = RemoteWalker::new(self.remote, &root, self.cancel.as_ref());

        while let Some(entry) = walker.next_file().await? {
            let local_path = local_path_for(local_root, &relative_remote_path(&root, &entry.path));
            if self.local.stat(&local_path).await?.is_some() {
                debug!("发现已存在的本地文件: {:?}", local_path);
                return Ok(true);
            }
        }

        Ok(false)
    }
}
