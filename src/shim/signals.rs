//! Turns SIGHUP, SIGUSR1 and SIGUSR2 into collect-now requests
//!
//! On platforms without these signals the listener does nothing and
//! collection is driven by the timer and stdin wakes only.

use super::CollectTrigger;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Start listening for collect signals until `shutdown` is cancelled
///
/// Signal handlers are registered before this returns, so a signal sent
/// afterwards is never lost to the default disposition.
#[cfg(unix)]
pub fn listen_for_collect_signals(
    trigger: CollectTrigger,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    use log::{debug, warn};
    use tokio::signal::unix::{signal, SignalKind};

    let registered = (|| {
        Ok::<_, std::io::Error>((
            signal(SignalKind::hangup())?,
            signal(SignalKind::user_defined1())?,
            signal(SignalKind::user_defined2())?,
        ))
    })();

    tokio::spawn(async move {
        let (mut hangup, mut user1, mut user2) = match registered {
            Ok(streams) => streams,
            Err(e) => {
                warn!("Failed to register collect signals: {}", e);
                return;
            }
        };

        loop {
            // Shutdown is checked first so nothing is posted to a session
            // that stopped reading
            let name = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = hangup.recv() => "SIGHUP",
                _ = user1.recv() => "SIGUSR1",
                _ = user2.recv() => "SIGUSR2",
            };
            debug!("Received {}, requesting collection", name);
            trigger.request();
        }
        // Dropping the streams deregisters this listener
    })
}

#[cfg(not(unix))]
pub fn listen_for_collect_signals(
    _trigger: CollectTrigger,
    _shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async {})
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_listener_exits_on_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let handle = listen_for_collect_signals(CollectTrigger { tx }, shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
