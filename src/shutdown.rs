//! Shutdown signalling shared by every task.
//!
//! A single `watch` channel carries the shutdown flag. Tasks select on
//! [`stopped`] next to their normal work.

use tokio::sync::watch;

/// Create the shutdown flag, initially clear
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once shutdown is requested or its sender is gone
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopped_after_flag() {
        let (tx, mut rx) = channel();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .unwrap();
        // Already set: resolves again immediately
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_when_sender_dropped() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_while_clear() {
        let (_tx, mut rx) = channel();
        assert!(
            tokio::time::timeout(Duration::from_secs(5), stopped(&mut rx))
                .await
                .is_err()
        );
    }
}
