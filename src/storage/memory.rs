//! 内存远程文件系统，测试用

use super::{
    copy_with_progress, remote_file_name, remote_parent, Credentials, FileFingerprint,
    OnProgress, RemoteConnector, RemoteEntry, RemoteFileSystem, TransferDirection,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone)]
enum MemoryNode {
    Dir,
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
}

pub struct MemoryRemote {
    nodes: Mutex<BTreeMap<String, MemoryNode>>,
    failing: Mutex<HashSet<String>>,
    disconnected: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), MemoryNode::Dir);
        Self {
            nodes: Mutex::new(nodes),
            failing: Mutex::new(HashSet::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    fn ensure_parents(nodes: &mut BTreeMap<String, MemoryNode>, path: &str) {
        let mut parent = remote_parent(path);
        while parent != "/" {
            nodes.entry(parent.clone()).or_insert(MemoryNode::Dir);
            parent = remote_parent(&parent);
        }
    }

    /// 添加文件，`modified_secs` 为 Unix 秒
    pub fn add_file(&self, path: &str, data: &[u8], modified_secs: i64) {
        let modified = Utc
            .timestamp_opt(modified_secs, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure_parents(&mut nodes, path);
        nodes.insert(
            path.to_string(),
            MemoryNode::File {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure_parents(&mut nodes, path);
        nodes.insert(path.to_string(), MemoryNode::Dir);
    }

    /// 之后对该路径的任何操作都返回协议错误
    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(MemoryNode::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(SyncError::protocol(path, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFileSystem for MemoryRemote {
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.check(path)?;
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(MemoryNode::Dir) => {}
            _ => return Err(SyncError::protocol(path, "no such directory")),
        }

        let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now);
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && p.as_str() != path && remote_parent(p) == path)
            .map(|(p, node)| {
                let (is_dir, size, modified) = match node {
                    MemoryNode::Dir => (true, 0, epoch),
                    MemoryNode::File { data, modified } => (false, data.len() as u64, *modified),
                };
                RemoteEntry {
                    name: remote_file_name(p).to_string(),
                    path: p.clone(),
                    is_dir,
                    size,
                    modified_at_utc: modified,
                }
            })
            .collect())
    }

    async fn get_attributes(&self, path: &str) -> Result<FileFingerprint> {
        self.check(path)?;
        match self.nodes.lock().unwrap().get(path) {
            Some(MemoryNode::File { data, modified }) => {
                Ok(FileFingerprint::new(data.len() as u64, *modified))
            }
            _ => Err(SyncError::protocol(path, "no such file")),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.nodes.lock().unwrap().contains_key(path))
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        remote_path: &str,
        on_progress: OnProgress<'_>,
    ) -> Result<u64> {
        self.check(remote_path)?;
        let mut data = Vec::new();
        let written =
            copy_with_progress(source, &mut data, TransferDirection::Upload, on_progress).await?;
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure_parents(&mut nodes, remote_path);
        nodes.insert(
            remote_path.to_string(),
            MemoryNode::File {
                data,
                modified: Utc::now(),
            },
        );
        Ok(written)
    }

    async fn download_file(
        &self,
        remote_path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
        on_progress: OnProgress<'_>,
    ) -> Result<u64> {
        self.check(remote_path)?;
        let data = self
            .file_data(remote_path)
            .ok_or_else(|| SyncError::protocol(remote_path, "no such file"))?;
        let mut reader: &[u8] = &data;
        copy_with_progress(&mut reader, dest, TransferDirection::Download, on_progress).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.check(path)?;
        self.add_dir(path);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.check(path)?;
        match self.nodes.lock().unwrap().remove(path) {
            Some(MemoryNode::File { .. }) => Ok(()),
            _ => Err(SyncError::protocol(path, "no such file")),
        }
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.check(path)?;
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.keys().any(|p| p != path && remote_parent(p) == path && p != "/") {
            return Err(SyncError::protocol(path, "directory not empty"));
        }
        match nodes.remove(path) {
            Some(MemoryNode::Dir) => Ok(()),
            _ => Err(SyncError::protocol(path, "no such directory")),
        }
    }

    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.check(old_path)?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .remove(old_path)
            .ok_or_else(|| SyncError::protocol(old_path, "no such file"))?;
        nodes.insert(new_path.to_string(), node);
        Ok(())
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()> {
        if let Some(MemoryNode::File { modified: m, .. }) = self.nodes.lock().unwrap().get_mut(path) {
            *m = modified;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// 总是返回同一个 [`MemoryRemote`] 的连接器
pub struct MemoryConnector {
    pub remote: Arc<MemoryRemote>,
    pub connects: AtomicUsize,
    pub reject: AtomicBool,
}

impl MemoryConnector {
    pub fn new(remote: Arc<MemoryRemote>) -> Self {
        Self {
            remote,
            connects: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteFileSystem>> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::Connection(format!(
                "authentication rejected for {}",
                credentials.username
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote.clone() as Arc<dyn RemoteFileSystem>)
    }
}
