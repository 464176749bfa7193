//! 关闭信号辅助函数
//!
//! 整个管道共享一个 `watch::Receiver<bool>`，值变为 true 即表示进入关闭流程。

use tokio::sync::watch;

/// 是否已收到关闭信号
pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// 等待关闭信号
///
/// 发送端被丢弃而从未发出关闭信号时，视为永不关闭。
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_signal() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!is_shutdown(&rx));

        tx.send(true).unwrap();
        wait_for_shutdown(&mut rx).await;
        assert!(is_shutdown(&rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_never_signals() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);

        let waited =
            tokio::time::timeout(Duration::from_secs(60), wait_for_shutdown(&mut rx)).await;
        assert!(waited.is_err());
    }
}
