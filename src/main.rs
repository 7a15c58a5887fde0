use sftpsync_lib::logging::init_logging;
use sftpsync_lib::{resolve_config_dir, AppState, SchedulerState};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = resolve_config_dir();
    std::fs::create_dir_all(&config_dir)?;

    // 初始化日志系统，guard 保持到进程退出
    let _log_guard = init_logging(&config_dir);

    let state = AppState::with_config_dir(config_dir).await?;

    // `--once`：立即执行一轮同步后退出
    if std::env::args().skip(1).any(|arg| arg == "--once") {
        let settings = state.settings.load().await?;
        let result = state
            .scheduler
            .run_once(&settings, &CancellationToken::new())
            .await;
        state.cleanup().await;
        let report = result?;
        tracing::info!(
            "同步完成: 计划 {} 个，下载 {} 个，共 {} 字节",
            report.planned,
            report.downloaded,
            report.bytes
        );
        return Ok(());
    }

    if let Some(mut events) = state.take_transfer_events() {
        tokio::spawn(async move {
            while let Some(job) = events.recv().await {
                tracing::debug!(
                    "传输 {} {:?} {:.0}%",
                    job.id,
                    job.status,
                    job.progress * 100.0
                );
            }
        });
    }

    let mut states = state.scheduler.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let current = states.borrow_and_update().clone();
            if let SchedulerState::Waiting { due_in } = current {
                tracing::info!("下次同步将在 {} 秒后开始", due_in.as_secs());
            }
        }
    });

    state.scheduler.start();
    tracing::info!("sftpsync 已启动，按 Ctrl+C 退出");

    tokio::signal::ctrl_c().await?;
    state.cleanup().await;
    Ok(())
}
