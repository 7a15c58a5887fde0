//! 应用配置模块
//!
//! - `config.json`：应用级配置（日志、传输、自定义数据路径），按 key 分段读写
//! - `settings.json`：用户设置文档（最近连接、定时同步），由 [`SettingsStore`] 独占写入

use crate::core::planner::ConflictMode;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// 读取 `config.json` 中的某一段，文件缺失或格式错误时返回 None
pub(crate) fn read_config_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content).ok()?;
    serde_json::from_value(config.get(key)?.clone()).ok()
}

/// 更新 `config.json` 中的某一段，保留其他 key
pub(crate) fn write_config_section<T: Serialize>(
    config_dir: &Path,
    key: &str,
    value: &T,
) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
        Err(e) if e.kind() == io::ErrorKind::NotFound => serde_json::json!({}),
        Err(e) => return Err(e),
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 传输队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 交互式传输队列的最大并发数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    6
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl TransferConfig {
    pub fn load(config_dir: &Path) -> Self {
        read_config_section::<TransferConfig>(config_dir, "transfer")
            .map(|mut c| {
                c.max_concurrency = c.max_concurrency.max(1);
                c
            })
            .unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_config_section(config_dir, "transfer", self)
    }
}

/// 最近使用的连接（定时同步使用第一条）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentConnection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "Utc::now")]
    pub last_used_utc: DateTime<Utc>,
}

fn default_port() -> u16 {
    22
}

impl std::fmt::Display for RecentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// 书签
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
}

/// 名称为空时显示 `user@host:port`
impl std::fmt::Display for Bookmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.trim().is_empty() {
            write!(f, "{}@{}:{}", self.username, self.host, self.port)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// 定时同步设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub local_folder: String,
    #[serde(default = "default_remote_folder")]
    pub remote_folder: String,
    #[serde(default)]
    pub conflict_mode: ConflictMode,
    #[serde(default)]
    pub last_run_utc: Option<DateTime<Utc>>,
}

fn default_interval_seconds() -> u64 {
    30 * 60 // 默认 30 分钟
}

fn default_remote_folder() -> String {
    "/".to_string()
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_interval_seconds(),
            local_folder: String::new(),
            remote_folder: default_remote_folder(),
            conflict_mode: ConflictMode::default(),
            last_run_utc: None,
        }
    }
}

impl ScheduleState {
    /// 同步间隔，配置为 0 时回退到默认值
    pub fn interval(&self) -> Duration {
        if self.interval_seconds == 0 {
            Duration::from_secs(default_interval_seconds())
        } else {
            Duration::from_secs(self.interval_seconds)
        }
    }

    /// 远程目录，空值视为根目录
    pub fn remote_root(&self) -> &str {
        let trimmed = self.remote_folder.trim();
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }
}

/// 用户设置文档
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default)]
    pub recent_connections: Vec<RecentConnection>,
    #[serde(default = "default_max_recent")]
    pub max_recent_connections: usize,
    #[serde(default)]
    pub background_sync: ScheduleState,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    /// 本程序不认识的字段，原样写回
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_max_recent() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bookmarks: Vec::new(),
            recent_connections: Vec::new(),
            max_recent_connections: default_max_recent(),
            background_sync: ScheduleState::default(),
            notifications_enabled: true,
            extra: serde_json::Map::new(),
        }
    }
}

impl AppSettings {
    /// 记录一次连接：移到列表首位并按上限截断
    pub fn touch_recent_connection(&mut self, host: &str, port: u16, username: &str) {
        self.recent_connections.retain(|c| {
            !(c.host.eq_ignore_ascii_case(host) && c.port == port && c.username == username)
        });
        self.recent_connections.insert(
            0,
            RecentConnection {
                host: host.to_string(),
                port,
                username: username.to_string(),
                last_used_utc: Utc::now(),
            },
        );
        self.recent_connections
            .truncate(self.max_recent_connections.max(1));
    }
}

/// 设置文档存储。所有读写都经过同一把锁，读只在读取期间持锁。
pub struct SettingsStore {
    path: PathBuf,
    gate: Mutex<()>,
}

impl SettingsStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(SETTINGS_FILE),
            gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_unlocked(&self) -> Result<AppSettings> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SyncError::Config(format!("invalid settings {:?}: {}", self.path, e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("设置文件不存在，使用默认设置");
                Ok(AppSettings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_unlocked(&self, settings: &AppSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(settings)?;

        // 先写临时文件再重命名，避免写到一半的文档
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<AppSettings> {
        let _guard = self.gate.lock().await;
        self.read_unlocked().await
    }

    pub async fn save(&self, settings: &AppSettings) -> Result<()> {
        let _guard = self.gate.lock().await;
        self.write_unlocked(settings).await
    }

    /// 在锁内完成读-改-写，避免与其他写入交错
    pub async fn update<F>(&self, f: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let _guard = self.gate.lock().await;
        let mut settings = self.read_unlocked().await.inspect_err(|e| {
            warn!("读取设置失败，放弃本次更新: {}", e);
        })?;
        f(&mut settings);
        self.write_unlocked(&settings).await?;
        Ok(settings)
    }
}
