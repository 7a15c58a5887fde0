//! 凭据存储
//!
//! 密码按 `sftpsync/user@host:port` 保存在配置目录下的 JSON 文件中，
//! Unix 上文件权限为 0600。

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub const CREDENTIALS_FILE: &str = "credentials.json";
const KEY_PREFIX: &str = "sftpsync";

/// 凭据查询
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 没有保存的密码时返回 None
    async fn try_get_password(&self, host: &str, port: u16, username: &str)
        -> Result<Option<String>>;
}

pub fn credential_key(host: &str, port: u16, username: &str) -> String {
    format!(
        "{}/{}@{}:{}",
        KEY_PREFIX,
        username,
        host.trim().to_lowercase(),
        port
    )
}

/// 基于文件的凭据存储
pub struct FileCredentialStore {
    path: PathBuf,
    gate: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(CREDENTIALS_FILE),
            gate: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SyncError::Config(format!("invalid credential store {:?}: {}", self.path, e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;

        // 临时文件创建时即为 0600，写完后重命名覆盖
        let temp_path = self.path.with_extension("json.tmp");
        let _ = tokio::fs::remove_file(&temp_path).await;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn save_password(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let _guard = self.gate.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(credential_key(host, port, username), password.to_string());
        self.write_entries(&entries).await?;
        debug!("已保存凭据: {}@{}:{}", username, host, port);
        Ok(())
    }

    /// 删除凭据，返回是否存在
    pub async fn delete_password(&self, host: &str, port: u16, username: &str) -> Result<bool> {
        let _guard = self.gate.lock().await;
        let mut entries = self.read_all().await?;
        let existed = entries
            .remove(&credential_key(host, port, username))
            .is_some();
        if existed {
            self.write_entries(&entries).await?;
        }
        Ok(existed)
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialStore {
    async fn try_get_password(
        &self,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<Option<String>> {
        let _guard = self.gate.lock().await;
        let entries = self.read_all().await?;
        Ok(entries.get(&credential_key(host, port, username)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());

        assert_eq!(store.try_get_password("h", 22, "u").await.unwrap(), None);

        store.save_password("Host.example", 22, "u", "s3cret").await.unwrap();
        assert_eq!(
            store
                .try_get_password("host.example", 22, "u")
                .await
                .unwrap()
                .as_deref(),
            Some("s3cret")
        );
        assert_eq!(
            store.try_get_password("host.example", 2222, "u").await.unwrap(),
            None
        );

        assert!(store.delete_password("host.example", 22, "u").await.unwrap());
        assert!(!store.delete_password("host.example", 22, "u").await.unwrap());
        assert_eq!(
            store.try_get_password("host.example", 22, "u").await.unwrap(),
            None
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store.save_password("h", 22, "u", "p").await.unwrap();

        let mode = std::fs::metadata(dir.path().join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        // 覆盖写入同样保持私有，且不残留临时文件
        std::fs::set_permissions(
            dir.path().join(CREDENTIALS_FILE),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();
        store.save_password("h2", 22, "u", "p2").await.unwrap();
        let mode = std::fs::metadata(dir.path().join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!dir.path().join("credentials.json.tmp").exists());
    }
}
