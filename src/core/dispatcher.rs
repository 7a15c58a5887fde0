//! 有界并发传输队列
//!
//! 单个调度任务按 FIFO 取出作业，获取并发槽位后为每个作业启动独立任务。
//! 作业状态和进度以快照形式通过通道发送给观察者，调度器在作业结束后不再持有它。

use crate::error::{Result, SyncError};
use crate::storage::TransferDirection;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use scopeguard::defer;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 默认并发数
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
/// 进度采样间隔（约 10 次/秒）
pub const PROGRESS_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

const PROGRESS_SCALE: f64 = 10_000.0;

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Pending → Running → {Completed, Failed, Canceled}；排队中的作业也可以直接取消
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

/// 传输作业快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub source_path: String,
    pub destination_path: String,
    pub status: TransferStatus,
    /// 0.0 ~ 1.0
    pub progress: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(
        direction: TransferDirection,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            status: TransferStatus::Pending,
            progress: 0.0,
            message: None,
            created_at: Utc::now(),
        }
    }

    pub fn download(remote_path: &str, local_path: &Path) -> Self {
        Self::new(
            TransferDirection::Download,
            remote_path,
            local_path.to_string_lossy(),
        )
    }

    pub fn upload(local_path: &Path, remote_path: &str) -> Self {
        Self::new(
            TransferDirection::Upload,
            local_path.to_string_lossy(),
            remote_path,
        )
    }

    /// 非法转换被忽略并返回 false
    pub fn transition(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "忽略非法状态转换: {} {:?} -> {:?}",
                self.id, self.status, next
            );
            return false;
        }
        self.status = next;
        true
    }
}

/// 进度接收端。只保存最新值（单调不减），不会阻塞调用方。
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    scaled: Arc<AtomicU32>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, fraction: f64) {
        let clamped = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let scaled = (clamped * PROGRESS_SCALE).round() as u32;
        self.scaled.fetch_max(scaled, Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        self.scaled.load(Ordering::Relaxed) as f64 / PROGRESS_SCALE
    }
}

/// 作业执行体：接收取消令牌和进度接收端
pub type WorkFn =
    Box<dyn FnOnce(CancellationToken, ProgressSink) -> BoxFuture<'static, Result<()>> + Send>;

/// 把异步闭包包装成 [`WorkFn`]
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: FnOnce(CancellationToken, ProgressSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |token, sink| f(token, sink).boxed())
}

struct QueuedJob {
    job: TransferJob,
    work: WorkFn,
}

struct Shared {
    queue: Mutex<VecDeque<QueuedJob>>,
    /// 运行中作业的取消令牌
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    wake: Notify,
    idle: Notify,
    slots: Arc<Semaphore>,
    stopped: AtomicBool,
    stop_token: CancellationToken,
    /// 所有作业令牌的父令牌
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<TransferJob>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, job: &TransferJob) {
        // 观察者已断开时丢弃
        let _ = self.events.send(job.clone());
    }
}

/// 传输调度器
pub struct TransferDispatcher {
    shared: Arc<Shared>,
    max_concurrency: usize,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransferDispatcher {
    /// 创建调度器并启动调度任务（需要在 tokio 运行时内调用）。
    /// 返回的接收端收到每次状态或进度变化的作业快照。
    pub fn new(max_concurrency: usize) -> (Self, mpsc::UnboundedReceiver<TransferJob>) {
        let max_concurrency = max_concurrency.max(1);
        let (events, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            idle: Notify::new(),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            stopped: AtomicBool::new(false),
            stop_token: CancellationToken::new(),
            cancel_token: CancellationToken::new(),
            events,
        });

        let handle = tokio::spawn(Self::dispatch_loop(shared.clone()));
        info!("传输调度器已启动，最大并发: {}", max_concurrency);

        (
            Self {
                shared,
                max_concurrency,
                dispatch_handle: Mutex::new(Some(handle)),
            },
            rx,
        )
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.running().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// 入队（不阻塞）。调度器停止后拒绝新作业。
    pub fn enqueue(&self, job: TransferJob, work: WorkFn) -> Result<Uuid> {
        if self.is_stopped() {
            return Err(SyncError::Cancelled);
        }

        let id = job.id;
        debug!("作业入队: {} {}", id, job.source_path);
        self.shared.emit(&job);
        self.shared.queue().push_back(QueuedJob { job, work });
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// 丢弃所有尚未开始的作业并返回它们，运行中的作业不受影响
    pub fn clear(&self) -> Vec<TransferJob> {
        let dropped: Vec<TransferJob> = self.shared.queue().drain(..).map(|q| q.job).collect();
        if !dropped.is_empty() {
            info!("已清空 {} 个排队作业", dropped.len());
        }
        self.shared.idle.notify_waiters();
        dropped
    }

    /// 停止取出新作业，运行中的作业继续执行直到结束
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            info!("传输调度器停止");
            self.shared.stop_token.cancel();
            self.shared.idle.notify_waiters();
        }
    }

    /// 停止调度并取消所有运行中的作业
    pub fn cancel_all(&self) {
        self.stop();
        self.shared.cancel_token.cancel();
    }

    /// 取消单个作业：运行中的发出取消信号，排队中的直接移出并标记为已取消
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Some(token) = self.shared.running().get(&id) {
            token.cancel();
            return true;
        }

        let removed = {
            let mut queue = self.shared.queue();
            queue
                .iter()
                .position(|q| q.job.id == id)
                .and_then(|idx| queue.remove(idx))
        };
        match removed {
            Some(mut queued) => {
                queued.job.transition(TransferStatus::Canceled);
                queued.job.message = Some("Canceled".to_string());
                self.shared.emit(&queued.job);
                self.shared.idle.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// 等待队列排空且没有运行中的作业（停止后只等待运行中的作业）
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let drained = self.is_stopped() || self.pending_count() == 0;
            if drained && self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 停止调度并等待调度任务和运行中的作业结束
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .dispatch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.wait_idle().await;
    }

    async fn dispatch_loop(shared: Arc<Shared>) {
        loop {
            if shared.stopped.load(Ordering::SeqCst) {
                break;
            }

            // 先占槽位再取作业，作业始终处于排队或运行之一
            let permit = tokio::select! {
                permit = shared.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shared.stop_token.cancelled() => break,
            };
            if shared.stopped.load(Ordering::SeqCst) {
                break;
            }

            let next = {
                let mut queue = shared.queue();
                queue.pop_front().map(|queued| {
                    let token = shared.cancel_token.child_token();
                    shared.running().insert(queued.job.id, token.clone());
                    (queued, token)
                })
            };
            let Some((queued, token)) = next else {
                drop(permit);
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = shared.stop_token.cancelled() => break,
                }
                continue;
            };

            let shared = shared.clone();
            tokio::spawn(async move {
                let id = queued.job.id;
                defer! {
                    shared.running().remove(&id);
                    drop(permit);
                    shared.idle.notify_waiters();
                }
                Self::run_job(&shared, queued, token).await;
            });
        }

        debug!("调度任务退出");
    }

    async fn run_job(shared: &Shared, queued: QueuedJob, token: CancellationToken) {
        let QueuedJob { mut job, work } = queued;

        job.transition(TransferStatus::Running);
        shared.emit(&job);

        let sink = ProgressSink::new();
        let sampler_stop = CancellationToken::new();
        let sampler = tokio::spawn(Self::sample_progress(
            job.clone(),
            sink.clone(),
            shared.events.clone(),
            sampler_stop.clone(),
        ));

        // 在独立任务中执行，执行体 panic 也只影响本作业
        let result = match tokio::spawn(work(token, sink.clone())).await {
            Ok(result) => result,
            Err(e) => Err(SyncError::from(e)),
        };

        sampler_stop.cancel();
        let _ = sampler.await;

        match result {
            Ok(()) => {
                job.progress = 1.0;
                job.transition(TransferStatus::Completed);
                debug!("作业完成: {}", job.id);
            }
            Err(SyncError::Cancelled) => {
                job.progress = sink.get();
                job.transition(TransferStatus::Canceled);
                job.message = Some("Canceled".to_string());
                info!("作业已取消: {}", job.id);
            }
            Err(e) => {
                job.progress = sink.get();
                job.transition(TransferStatus::Failed);
                job.message = Some(e.to_string());
                warn!("作业失败: {} {}: {}", job.id, job.source_path, e);
            }
        }
        shared.emit(&job);
    }

    /// 按固定间隔把最新进度转发给观察者，只在值增大时发送
    async fn sample_progress(
        mut job: TransferJob,
        sink: ProgressSink,
        events: mpsc::UnboundedSender<TransferJob>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(PROGRESS_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let current = sink.get();
                    if current > job.progress {
                        job.progress = current;
                        if events.send(job.clone()).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TransferDispatcher {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.stop_token.cancel();
    }
}
