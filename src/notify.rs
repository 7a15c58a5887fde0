//! 同步结果通知

use tracing::info;

/// 通知接收方（桌面通知、日志等）
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// 把通知写入日志
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(target: "sftpsync::notify", "[{}] {}", title, message);
    }
}
