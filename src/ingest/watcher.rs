//! Rotation watcher
//!
//! One watcher runs per reader generation. It re-resolves the expected file
//! name on a fixed interval and, the first time it differs from the file being
//! read, hands the new path over a oneshot channel and exits.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::resolver::{Clock, FilenameResolver};

/// Rotation notification carrying the newly resolved file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSignal {
    pub path: PathBuf,
}

/// Spawn the watcher for the file currently being read
///
/// Returns the receiving half of the signal channel and the task handle. The
/// task also exits, without sending, once the receiver is dropped.
pub fn spawn_rotation_watcher(
    current: PathBuf,
    resolver: FilenameResolver,
    clock: Clock,
    poll_interval: Duration,
) -> (oneshot::Receiver<RotationSignal>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        watch_loop(current, resolver, clock, poll_interval, tx).await;
    });

    (rx, handle)
}

async fn watch_loop(
    current: PathBuf,
    resolver: FilenameResolver,
    clock: Clock,
    poll_interval: Duration,
    mut tx: oneshot::Sender<RotationSignal>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(path = %current.display(), "Reader gone, rotation watcher exiting");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let expected = resolver.resolve(clock());
        if expected != current {
            tracing::info!(
                old = %current.display(),
                new = %expected.display(),
                "Log file name changed"
            );
            // Receiver may already be gone; either way this generation is done
            let _ = tx.send(RotationSignal { path: expected });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let shared = now.clone();
        let clock: Clock = Arc::new(move || *shared.lock().unwrap());
        (clock, now)
    }

    fn resolver() -> FilenameResolver {
        FilenameResolver::new("/logs", "pg-%Y-%m-%d.log", FixedOffset::east_opt(0).unwrap())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_once_on_name_change() {
        let (clock, now) = manual_clock(Utc.with_ymd_and_hms(2024, 1, 1, 23, 58, 0).unwrap());
        let current = resolver().resolve(clock());

        let (rx, handle) =
            spawn_rotation_watcher(current, resolver(), clock, Duration::from_secs(60));

        // Several polls with an unchanged name
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(!handle.is_finished());

        *now.lock().unwrap() = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 30).unwrap();

        let signal = rx.await.unwrap();
        assert_eq!(signal.path, PathBuf::from("/logs/pg-2024-01-02.log"));

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_receiver_dropped() {
        let (clock, _now) = manual_clock(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let current = resolver().resolve(clock());

        let (rx, handle) =
            spawn_rotation_watcher(current, resolver(), clock, Duration::from_secs(60));
        drop(rx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher should exit")
            .unwrap();
    }
}
