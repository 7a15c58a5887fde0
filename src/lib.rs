use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

pub mod config;
pub mod core;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod notify;
pub mod storage;

pub use config::{AppSettings, RecentConnection, ScheduleState, SettingsStore, TransferConfig};
pub use core::{
    ConflictMode, DiffPlanner, PlannedItem, SchedulerState, SyncDecision, SyncEngine,
    SyncScheduler, TransferDispatcher, TransferJob, TransferStatus,
};
pub use error::{Result, SyncError};

use credentials::{CredentialProvider, FileCredentialStore};
use notify::LogNotifier;
use storage::local::DiskFileSystem;
use storage::sftp::SftpConnector;
use storage::{Credentials, RemoteConnector};

const APP_DIR_NAME: &str = "sftpsync";

/// 解析配置目录：默认 `<系统配置目录>/sftpsync`，`config.json` 中的 `data_path`
/// 指向已存在的目录时使用自定义路径
pub fn resolve_config_dir() -> PathBuf {
    let default_config_dir = dirs::config_dir()
        .map(|p| p.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR_NAME)));

    config::read_config_section::<String>(&default_config_dir, "data_path")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_config_dir)
}

/// 应用状态：持有所有服务，由调用方显式构建并传递
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<SettingsStore>,
    pub credentials: Arc<FileCredentialStore>,
    pub connector: Arc<dyn RemoteConnector>,
    pub local: Arc<DiskFileSystem>,
    pub dispatcher: Arc<TransferDispatcher>,
    pub scheduler: Arc<SyncScheduler>,
    transfer_events: Mutex<Option<UnboundedReceiver<TransferJob>>>,
}

impl AppState {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config_dir(resolve_config_dir()).await
    }

    /// 使用指定配置目录构建（需要在 tokio 运行时内调用）
    pub async fn with_config_dir(config_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config_dir).await?;

        let settings = Arc::new(SettingsStore::new(&config_dir));
        let credentials = Arc::new(FileCredentialStore::new(&config_dir));
        let connector: Arc<dyn RemoteConnector> = Arc::new(SftpConnector::default());
        let local = Arc::new(DiskFileSystem::new());

        let transfer_config = TransferConfig::load(&config_dir);
        let (dispatcher, transfer_events) =
            TransferDispatcher::new(transfer_config.max_concurrency);

        let scheduler = Arc::new(SyncScheduler::new(
            settings.clone(),
            connector.clone(),
            local.clone(),
            credentials.clone(),
            Arc::new(LogNotifier),
        ));

        tracing::info!("应用状态已初始化，配置目录: {:?}", config_dir);

        Ok(Self {
            config_dir,
            settings,
            credentials,
            connector,
            local,
            dispatcher: Arc::new(dispatcher),
            scheduler,
            transfer_events: Mutex::new(Some(transfer_events)),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 取走传输作业快照通道（只能取一次）
    pub fn take_transfer_events(&self) -> Option<UnboundedReceiver<TransferJob>> {
        self.transfer_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// 使用已保存的密码连接远程主机，并记录到最近连接列表
    pub async fn connect(&self, host: &str, port: u16, username: &str) -> anyhow::Result<SyncEngine> {
        let password = self
            .credentials
            .try_get_password(host, port, username)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("no saved credentials found for {}@{}:{}", username, host, port)
            })?;

        let remote = self
            .connector
            .connect(&Credentials {
                host: host.to_string(),
                port,
                username: username.to_string(),
                password,
            })
            .await?;

        self.settings
            .update(|s| s.touch_recent_connection(host, port, username))
            .await?;

        Ok(SyncEngine::new(
            remote,
            self.local.clone(),
            self.dispatcher.clone(),
        ))
    }

    /// 清理资源（应用关闭时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        // 1. 停止定时同步
        self.scheduler.shutdown().await;

        // 2. 取消所有传输并等待调度循环退出
        self.dispatcher.cancel_all();
        self.dispatcher.shutdown().await;

        tracing::info!("资源清理完成");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
