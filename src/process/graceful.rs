//! Soft-then-hard termination of a child process

use log::{debug, warn};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// Ask `child` to terminate, escalating to a kill once `grace` has passed
///
/// On unix the soft stage is SIGTERM. Elsewhere there is no soft stage, so the
/// child is given `grace` to exit on its own before it is killed.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "Process {:?} still running after {:?}, killing it",
                child.id(),
                grace
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    // `id` is None once the child has been reaped
    let Some(pid) = child.id() else {
        return;
    };
    debug!("Sending SIGTERM to {}", pid);
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "SIGTERM to {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    #[tokio::test]
    async fn test_terminate_stops_cooperative_child_quickly() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();

        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; echo ready; exec sleep 30"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        // Wait until the trap is installed
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

        let grace = Duration::from_millis(200);
        let started = Instant::now();
        let status = terminate(&mut child, grace).await.unwrap();

        assert!(!status.success());
        assert!(started.elapsed() >= grace);
    }
}
