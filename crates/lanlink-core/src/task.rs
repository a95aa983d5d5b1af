//! Helpers for the background loops owned by the services.

use std::time::Duration;

use tokio::task::JoinHandle;

/// How long `stop` waits for each loop before aborting it.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for a loop to finish, aborting it once `timeout` elapses.
pub(crate) async fn join_bounded(mut handle: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        tracing::warn!("Background task did not stop within {timeout:?}, aborting");
        handle.abort();
    }
}

/// Join every handle, each bounded by [`STOP_TIMEOUT`].
pub(crate) async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        join_bounded(handle, STOP_TIMEOUT).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finished_task_joins() {
        let handle = tokio::spawn(async {});
        join_bounded(handle, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let joined = tokio::time::timeout(
            Duration::from_secs(1),
            join_bounded(handle, Duration::from_millis(20)),
        )
        .await;
        assert!(joined.is_ok());
    }
}
