//! 定时同步
//!
//! 后台循环读取定时同步设置，到期后执行一轮"连接 → 规划 → 顺序下载 → 断开"，
//! 成功后记录 `lastRunUtc`。每轮之间至少间隔一个完整周期，两轮不会重叠。

use super::planner::{DiffPlanner, PlannedItem, SyncDecision};
use super::transfer;
use crate::config::{AppSettings, SettingsStore};
use crate::credentials::CredentialProvider;
use crate::error::{Result, SyncError};
use crate::notify::Notifier;
use crate::storage::{Credentials, LocalFileSystem, RemoteConnector, RemoteFileSystem};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 定时同步关闭时重新检查设置的间隔
pub const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const NOTIFY_TITLE: &str = "Background sync";

/// 调度器状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting { due_in: Duration },
    Running,
    Stopped,
}

/// 一轮同步的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub planned: usize,
    pub downloaded: usize,
    pub bytes: u64,
}

/// 距离下次执行的时间；从未执行过时立即执行
pub fn due_in(
    last_run: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let Some(last_run) = last_run else {
        return Duration::ZERO;
    };
    let interval = chrono::Duration::from_std(interval)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    let due_at = last_run.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC);
    (due_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// 睡眠，被取消时返回 false
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// 定时同步调度器
pub struct SyncScheduler {
    settings: Arc<SettingsStore>,
    connector: Arc<dyn RemoteConnector>,
    local: Arc<dyn LocalFileSystem>,
    credentials: Arc<dyn CredentialProvider>,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<SchedulerState>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        settings: Arc<SettingsStore>,
        connector: Arc<dyn RemoteConnector>,
        local: Arc<dyn LocalFileSystem>,
        credentials: Arc<dyn CredentialProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            settings,
            connector,
            local,
            credentials,
            notifier,
            state,
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    fn set_state(&self, state: SchedulerState) {
        debug!("调度器状态: {:?}", state);
        self.state.send_replace(state);
    }

    /// 启动后台循环，已在运行时先停止旧循环
    pub fn start(self: &Arc<Self>) {
        self.stop();
        if let Some(old) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            old.abort();
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());
        self.set_state(SchedulerState::Idle);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(cancel).await });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("定时同步调度器已启动");
    }

    /// 发出停止信号，正在进行的一轮在下一个文件边界结束
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }

    /// 停止并等待后台循环退出
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("调度器任务异常退出: {}", e);
            }
        }
    }

    async fn load_settings(&self) -> AppSettings {
        match self.settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("读取设置失败，使用默认设置: {}", e);
                AppSettings::default()
            }
        }
    }

    fn notify(&self, settings: &AppSettings, message: &str) {
        if settings.notifications_enabled {
            self.notifier.notify(NOTIFY_TITLE, message);
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.set_state(SchedulerState::Idle);
            let settings = self.load_settings().await;
            let schedule = &settings.background_sync;

            if !schedule.enabled {
                if !sleep_or_cancel(DISABLED_POLL_INTERVAL, &cancel).await {
                    break;
                }
                continue;
            }

            let wait = due_in(schedule.last_run_utc, schedule.interval(), Utc::now());
            let settings = if wait.is_zero() {
                settings
            } else {
                self.set_state(SchedulerState::Waiting { due_in: wait });
                if !sleep_or_cancel(wait, &cancel).await {
                    break;
                }
                // 等待期间可能修改了设置
                let reloaded = self.load_settings().await;
                if !reloaded.background_sync.enabled {
                    continue;
                }
                reloaded
            };
            let interval = settings.background_sync.interval();

            self.set_state(SchedulerState::Running);
            match self.run_once(&settings, &cancel).await {
                Ok(report) => {
                    info!(
                        "定时同步完成: 计划 {} 项，下载 {} 项，{} bytes",
                        report.planned, report.downloaded, report.bytes
                    );
                    let now = Utc::now();
                    if let Err(e) = self
                        .settings
                        .update(|s| s.background_sync.last_run_utc = Some(now))
                        .await
                    {
                        error!("保存同步时间失败: {}", e);
                    }
                    self.notify(&settings, "Sync completed.");
                }
                Err(SyncError::Cancelled) => {
                    info!("定时同步已取消");
                    break;
                }
                Err(e) => {
                    error!("定时同步失败: {}", e);
                    self.notify(&settings, &format!("Sync failed: {}", e));
                }
            }

            self.set_state(SchedulerState::Waiting { due_in: interval });
            if !sleep_or_cancel(interval, &cancel).await {
                break;
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!("定时同步调度器已停止");
    }

    /// 执行一轮同步
    pub async fn run_once(
        &self,
        settings: &AppSettings,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let schedule = &settings.background_sync;

        let connection = settings
            .recent_connections
            .first()
            .ok_or_else(|| SyncError::Config("no recent connections available".to_string()))?;
        let local_folder = schedule.local_folder.trim();
        if local_folder.is_empty() {
            return Err(SyncError::Config(
                "background sync local folder is not configured".to_string(),
            ));
        }
        let local_root = Path::new(local_folder);
        self.local.create_dir_all(local_root).await?;

        let password = self
            .credentials
            .try_get_password(&connection.host, connection.port, &connection.username)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("no saved credentials found for {}", connection))
            })?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let credentials = Credentials {
            host: connection.host.clone(),
            port: connection.port,
            username: connection.username.clone(),
            password,
        };
        let remote = self.connector.connect(&credentials).await?;

        let result = self
            .download_pass(remote.as_ref(), schedule.remote_root(), local_root, settings, cancel)
            .await;

        if let Err(e) = remote.disconnect().await {
            warn!("断开连接失败: {}", e);
        }
        result
    }

    async fn download_pass(
        &self,
        remote: &dyn RemoteFileSystem,
        remote_root: &str,
        local_root: &Path,
        settings: &AppSettings,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let plan: Vec<PlannedItem> = DiffPlanner::new(remote, self.local.as_ref())
            .with_cancel(cancel.clone())
            .plan_download_only(remote_root, local_root, settings.background_sync.conflict_mode)
            .await?;

        let mut report = PassReport {
            planned: plan.len(),
            ..Default::default()
        };

        for item in plan {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if item.decision != SyncDecision::Download {
                continue;
            }

            report.bytes += transfer::download_file(
                remote,
                self.local.as_ref(),
                &item.remote_path,
                &item.local_path,
                cancel,
                &|_| {},
            )
            .await?;
            report.downloaded += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecentConnection;
    use crate::notify::testing::RecordingNotifier;
    use crate::storage::memory::{MemoryConnector, MemoryRemote};
    use crate::storage::{BoxedReader, BoxedWriter, DiskFileSystem, FileFingerprint, LocalEntry};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    struct StaticCredentials(Option<String>);

    #[async_trait]
    impl CredentialProvider for StaticCredentials {
        async fn try_get_password(&self, _: &str, _: u16, _: &str) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// 本地磁盘，第一个文件写完后执行一次回调
    struct HookedDisk {
        inner: DiskFileSystem,
        after_first_file: std::sync::Mutex<Option<Hook>>,
    }

    #[async_trait]
    impl LocalFileSystem for HookedDisk {
        async fn list_files(&self, root: &Path) -> Result<Vec<LocalEntry>> {
            self.inner.list_files(root).await
        }

        async fn stat(&self, path: &Path) -> Result<Option<FileFingerprint>> {
            self.inner.stat(path).await
        }

        async fn create_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.create_dir_all(path).await
        }

        async fn open_read(&self, path: &Path) -> Result<(BoxedReader, u64)> {
            self.inner.open_read(path).await
        }

        async fn create_file(&self, path: &Path) -> Result<BoxedWriter> {
            self.inner.create_file(path).await
        }

        async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()> {
            self.inner.set_modified(path, modified).await?;
            let hook = self.after_first_file.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        remote: Arc<MemoryRemote>,
        connector: Arc<MemoryConnector>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<SettingsStore>,
        scheduler: Arc<SyncScheduler>,
    }

    async fn fixture(configure: impl FnOnce(&mut AppSettings, &Path)) -> Fixture {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file("/data/report.txt", b"quarterly", 1_600_000_000);
        let connector = Arc::new(MemoryConnector::new(remote.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(SettingsStore::new(dir.path()));

        let mut settings = AppSettings::default();
        settings.background_sync.enabled = true;
        settings.background_sync.interval_seconds = 60;
        settings.background_sync.remote_folder = "/data".to_string();
        settings.background_sync.local_folder =
            dir.path().join("mirror").to_string_lossy().into_owned();
        settings.recent_connections.push(RecentConnection {
            host: "sftp.example".to_string(),
            port: 22,
            username: "backup".to_string(),
            last_used_utc: Utc::now(),
        });
        configure(&mut settings, dir.path());
        store.save(&settings).await.unwrap();

        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            connector.clone(),
            Arc::new(DiskFileSystem::new()),
            Arc::new(StaticCredentials(Some("pw".to_string()))),
            notifier.clone(),
        ));

        Fixture {
            dir,
            remote,
            connector,
            notifier,
            store,
            scheduler,
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<SchedulerState>,
        pred: impl Fn(&SchedulerState) -> bool,
    ) -> SchedulerState {
        rx.wait_for(|s| pred(s)).await.unwrap().clone()
    }

    #[test]
    fn test_due_in() {
        let now = Utc::now();
        let minute = Duration::from_secs(60);

        assert_eq!(due_in(None, minute, now), Duration::ZERO);
        assert_eq!(
            due_in(Some(now - chrono::Duration::seconds(20)), minute, now),
            Duration::from_secs(40)
        );
        assert_eq!(
            due_in(Some(now - chrono::Duration::seconds(600)), minute, now),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_runs_immediately_and_persists_last_run() {
        let f = fixture(|_, _| {}).await;
        let mut rx = f.scheduler.subscribe();

        f.scheduler.start();
        wait_for_state(&mut rx, |s| *s == SchedulerState::Running).await;
        let after = wait_for_state(&mut rx, |s| matches!(s, SchedulerState::Waiting { .. })).await;
        assert_eq!(
            after,
            SchedulerState::Waiting {
                due_in: Duration::from_secs(60)
            }
        );

        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);
        assert!(f.remote.is_disconnected());
        assert_eq!(
            std::fs::read(f.dir.path().join("mirror").join("report.txt")).unwrap(),
            b"quarterly"
        );
        assert_eq!(
            f.notifier.messages(),
            vec![(NOTIFY_TITLE.to_string(), "Sync completed.".to_string())]
        );

        f.scheduler.shutdown().await;
        let saved = f.store.load().await.unwrap();
        assert!(saved.background_sync.last_run_utc.is_some());
        assert_eq!(f.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pass_before_due_time() {
        let f = fixture(|s, _| {
            s.background_sync.last_run_utc = Some(Utc::now() - chrono::Duration::seconds(10));
        })
        .await;
        let mut rx = f.scheduler.subscribe();

        f.scheduler.start();
        let waiting = wait_for_state(&mut rx, |s| matches!(s, SchedulerState::Waiting { .. })).await;
        let SchedulerState::Waiting { due_in } = waiting else {
            unreachable!()
        };
        assert!(due_in <= Duration::from_secs(50) && due_in > Duration::from_secs(45));

        tokio::time::sleep(due_in - Duration::from_secs(2)).await;
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);

        wait_for_state(&mut rx, |s| *s == SchedulerState::Running).await;
        wait_for_state(&mut rx, |s| matches!(s, SchedulerState::Waiting { .. })).await;
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);

        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_notifies_and_keeps_running() {
        let f = fixture(|s, _| s.recent_connections.clear()).await;
        let mut rx = f.scheduler.subscribe();

        f.scheduler.start();
        wait_for_state(&mut rx, |s| *s == SchedulerState::Running).await;
        wait_for_state(&mut rx, |s| matches!(s, SchedulerState::Waiting { .. })).await;

        let messages = f.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.starts_with("Sync failed:"));

        // 下一个周期会再次尝试
        wait_for_state(&mut rx, |s| *s == SchedulerState::Running).await;
        wait_for_state(&mut rx, |s| matches!(s, SchedulerState::Waiting { .. })).await;
        assert_eq!(f.notifier.messages().len(), 2);

        f.scheduler.shutdown().await;
        assert!(f.store.load().await.unwrap().background_sync.last_run_utc.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedule_never_connects() {
        let f = fixture(|s, _| s.background_sync.enabled = false).await;

        f.scheduler.start();
        tokio::time::sleep(DISABLED_POLL_INTERVAL * 4).await;

        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);
        assert_ne!(f.scheduler.state(), SchedulerState::Running);
        f.scheduler.shutdown().await;
        assert_eq!(f.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_pass_ends_between_files() {
        let f = fixture(|_, _| {}).await;
        f.remote.add_file("/data/ledger.txt", b"ledger", 1_600_000_000);
        f.remote.add_file("/data/notes.txt", b"notes", 1_600_000_000);

        let local = Arc::new(HookedDisk {
            inner: DiskFileSystem::new(),
            after_first_file: std::sync::Mutex::new(None),
        });
        let scheduler = Arc::new(SyncScheduler::new(
            f.store.clone(),
            f.connector.clone(),
            local.clone(),
            Arc::new(StaticCredentials(Some("pw".to_string()))),
            f.notifier.clone(),
        ));
        let to_stop = scheduler.clone();
        *local.after_first_file.lock().unwrap() = Some(Box::new(move || to_stop.stop()));

        let mut rx = scheduler.subscribe();
        scheduler.start();
        wait_for_state(&mut rx, |s| *s == SchedulerState::Stopped).await;

        let mirror = f.dir.path().join("mirror");
        let downloaded = ["report.txt", "ledger.txt", "notes.txt"]
            .iter()
            .filter(|name| mirror.join(name).exists())
            .count();
        assert_eq!(downloaded, 1);
        assert!(f.remote.is_disconnected());
        assert!(f.notifier.messages().is_empty());
        assert!(f.store.load().await.unwrap().background_sync.last_run_utc.is_none());

        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_run_once_cancelled_after_first_download() {
        let f = fixture(|_, _| {}).await;
        f.remote.add_file("/data/ledger.txt", b"ledger", 1_600_000_000);
        f.remote.add_file("/data/notes.txt", b"notes", 1_600_000_000);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let local = Arc::new(HookedDisk {
            inner: DiskFileSystem::new(),
            after_first_file: std::sync::Mutex::new(Some(Box::new(move || trigger.cancel()))),
        });
        let scheduler = SyncScheduler::new(
            f.store.clone(),
            f.connector.clone(),
            local,
            Arc::new(StaticCredentials(Some("pw".to_string()))),
            f.notifier.clone(),
        );

        let settings = f.store.load().await.unwrap();
        let result = scheduler.run_once(&settings, &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));

        let entries = std::fs::read_dir(f.dir.path().join("mirror")).unwrap().count();
        assert_eq!(entries, 1);
        assert!(f.remote.is_disconnected());
    }

    #[tokio::test]
    async fn test_run_once_requires_credentials_and_folder() {
        let f = fixture(|_, _| {}).await;
        let settings = f.store.load().await.unwrap();
        let cancel = CancellationToken::new();

        let no_password = SyncScheduler::new(
            f.store.clone(),
            f.connector.clone(),
            Arc::new(DiskFileSystem::new()),
            Arc::new(StaticCredentials(None)),
            f.notifier.clone(),
        );
        assert!(matches!(
            no_password.run_once(&settings, &cancel).await,
            Err(SyncError::Config(_))
        ));

        let mut no_folder = settings.clone();
        no_folder.background_sync.local_folder = "  ".to_string();
        assert!(matches!(
            f.scheduler.run_once(&no_folder, &cancel).await,
            Err(SyncError::Config(_))
        ));

        f.connector.reject.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.scheduler.run_once(&settings, &cancel).await,
            Err(SyncError::Connection(_))
        ));
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_once_skips_unchanged_files() {
        let f = fixture(|_, _| {}).await;
        let settings = f.store.load().await.unwrap();
        let cancel = CancellationToken::new();

        let first = f.scheduler.run_once(&settings, &cancel).await.unwrap();
        assert_eq!(first.downloaded, 1);
        assert_eq!(first.bytes, 9);

        let second = f.scheduler.run_once(&settings, &cancel).await.unwrap();
        assert_eq!(second, PassReport::default());
    }
}
