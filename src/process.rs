//! OS process helpers shared by the supervisors and the watchdog

use crate::logs::Stream;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pids that must never be signalled: 0 targets our own process group and
/// values above `i32::MAX` wrap to negative group ids.
fn signallable(pid: u32) -> Option<i32> {
    if pid == 0 || pid == std::process::id() {
        return None;
    }
    i32::try_from(pid).ok()
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Some(raw) = signallable(pid) else {
        return false;
    };
    let result = unsafe { libc::kill(raw, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, signal, error = %err, "Failed to signal process");
        }
        return false;
    }
    true
}

/// Send SIGTERM to `pid`. Returns false when nothing was signalled.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> bool {
    send_signal(pid, libc::SIGTERM)
}

/// Send SIGKILL to `pid`. Returns false when nothing was signalled.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> bool {
    send_signal(pid, libc::SIGKILL)
}

/// Whether some process currently exists at `pid`
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Some(raw) = signallable(pid) else {
        return pid == std::process::id();
    };
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn terminate_pid(pid: u32) -> bool {
    warn!(pid, "Signalling processes by pid is not supported on this platform");
    false
}

#[cfg(not(unix))]
pub fn kill_pid(pid: u32) -> bool {
    terminate_pid(pid)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM a child, wait up to `grace_period`, then SIGKILL it
pub async fn stop_child(name: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(name, pid, "Sending SIGTERM");

        #[cfg(unix)]
        {
            terminate_pid(pid);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(name, ?status, "Process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(name, error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Forward every line of `reader` to `sink` until EOF
pub fn pump_lines<R, F>(reader: R, stream: Stream, mut sink: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(Stream, String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink(stream, line),
                Ok(None) => break,
                Err(e) => {
                    debug!(stream = stream.tag(), error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}
