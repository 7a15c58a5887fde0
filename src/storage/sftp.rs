use super::{
    copy_with_progress, join_remote_path, Credentials, FileFingerprint, OnProgress,
    RemoteConnector, RemoteEntry, RemoteFileSystem, TransferDirection, CONNECT_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::{self, AuthResult, Handle, Handler};
use russh::keys::PublicKeyBase64;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// SSH 客户端回调
pub struct SshHandler {
    /// 允许的服务器指纹（OpenSSH SHA256 或 base64 公钥），None 表示不校验
    allowed_fingerprints: Option<Vec<String>>,
}

impl Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fp_sha256 = server_public_key
            .fingerprint(russh::keys::HashAlg::Sha256)
            .to_string();
        match &self.allowed_fingerprints {
            Some(allowed) => {
                let key_b64 = server_public_key.public_key_base64();
                let ok = allowed.iter().any(|s| s == &fp_sha256 || s == &key_b64);
                if !ok {
                    warn!("服务器指纹不在白名单中: {}", fp_sha256);
                }
                Ok(ok)
            }
            None => {
                debug!("服务器指纹（未校验）: {}", fp_sha256);
                Ok(true)
            }
        }
    }
}

/// 通过 SSH 密码认证建立 SFTP 会话
#[derive(Debug, Default, Clone)]
pub struct SftpConnector {
    pub allowed_fingerprints: Option<Vec<String>>,
}

impl SftpConnector {
    pub fn new(allowed_fingerprints: Option<Vec<String>>) -> Self {
        Self {
            allowed_fingerprints,
        }
    }
}

#[async_trait]
impl RemoteConnector for SftpConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteFileSystem>> {
        let remote = SftpRemote::connect(credentials, self.allowed_fingerprints.clone()).await?;
        Ok(Arc::new(remote) as Arc<dyn RemoteFileSystem>)
    }
}

pub struct SftpRemote {
    sftp: SftpSession,
    session: Handle<SshHandler>,
    name: String,
}

impl SftpRemote {
    pub async fn connect(
        credentials: &Credentials,
        allowed_fingerprints: Option<Vec<String>>,
    ) -> Result<Self> {
        let name = format!(
            "sftp://{}@{}:{}",
            credentials.username, credentials.host, credentials.port
        );
        let conn_err = |e: russh::Error| SyncError::Connection(format!("{}: {}", name, e));

        let config = Arc::new(client::Config::default());
        let handler = SshHandler {
            allowed_fingerprints,
        };

        let mut session = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            client::connect(
                config,
                (credentials.host.as_str(), credentials.port),
                handler,
            ),
        )
        .await
        .map_err(|_| SyncError::Connection(format!("{}: connection timed out", name)))?
        .map_err(conn_err)?;

        let auth = session
            .authenticate_password(credentials.username.as_str(), credentials.password.as_str())
            .await
            .map_err(conn_err)?;
        if matches!(auth, AuthResult::Failure { .. }) {
            return Err(SyncError::Connection(format!(
                "{}: authentication failed",
                name
            )));
        }

        let channel = session.channel_open_session().await.map_err(conn_err)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(conn_err)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SyncError::Connection(format!("{}: {}", name, e)))?;

        info!("已连接: {}", name);
        Ok(Self {
            sftp,
            session,
            name,
        })
    }

    /// 带超时的单次远程操作
    async fn op<T, E, F>(&self, context: &str, fut: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(Duration::from_secs(OP_TIMEOUT_SECS), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SyncError::protocol(context, e)),
            Err(_) => Err(SyncError::protocol(context, "operation timed out")),
        }
    }

    fn to_utc(mtime: Option<u32>) -> DateTime<Utc> {
        mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteFileSystem for SftpRemote {
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.op(path, self.sftp.read_dir(path)).await?;

        Ok(dir
            .map(|entry| {
                let name = entry.file_name();
                let meta = entry.metadata();
                RemoteEntry {
                    path: join_remote_path(path, &name),
                    name,
                    is_dir: meta.is_dir(),
                    size: if meta.is_dir() { 0 } else { meta.size.unwrap_or(0) },
                    modified_at_utc: Self::to_utc(meta.mtime),
                }
            })
            .collect())
    }

    async fn get_attributes(&self, path: &str) -> Result<FileFingerprint> {
        let meta = self.op(path, self.sftp.metadata(path)).await?;
        Ok(FileFingerprint::new(
            meta.size.unwrap_or(0),
            Self::to_utc(meta.mtime),
        ))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.op(path, self.sftp.try_exists(path)).await
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        remote_path: &str,
        on_progress: OnProgress<'_>,
    ) -> Result<u64> {
        let file = self.op(remote_path, self.sftp.create(remote_path)).await?;
        let mut file = Box::pin(file);

        let written =
            copy_with_progress(source, &mut file, TransferDirection::Upload, on_progress).await?;
        file.shutdown()
            .await
            .map_err(|e| SyncError::protocol(remote_path, e))?;

        Ok(written)
    }

    async fn download_file(
        &self,
        remote_path: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
        on_progress: OnProgress<'_>,
    ) -> Result<u64> {
        let file = self.op(remote_path, self.sftp.open(remote_path)).await?;
        let mut file = Box::pin(file);

        copy_with_progress(&mut file, dest, TransferDirection::Download, on_progress).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_remote_path(&current, part);
            if self.exists(&current).await? {
                continue;
            }
            if let Err(e) = self.op(&current, self.sftp.create_dir(current.as_str())).await {
                // 并发创建时目录可能已被其他任务创建
                if !self.exists(&current).await? {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.op(path, self.sftp.remove_file(path)).await
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.op(path, self.sftp.remove_dir(path)).await
    }

    async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.op(old_path, self.sftp.rename(old_path, new_path)).await
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()> {
        let ts = modified.timestamp().clamp(0, u32::MAX as i64) as u32;
        let attrs = FileAttributes {
            atime: Some(ts),
            mtime: Some(ts),
            ..Default::default()
        };
        self.op(path, self.sftp.set_metadata(path, attrs)).await
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            debug!("关闭 SFTP 会话失败: {}", e);
        }
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        info!("已断开: {}", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
