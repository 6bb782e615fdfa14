//! DHCP through the native `dhcpagent` and `ifconfig ... dhcp`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lxinit_networking::{DhcpAgent, DhcpReply, FacilityError};
use tokio::process::Command;
use tracing::{debug, info};

/// Message the agent prints when another instance already runs.
const ALREADY_RUNNING: &str = "already running";

/// DHCP client driven through native tools.
#[derive(Debug, Clone)]
pub struct NativeDhcp {
    agent: PathBuf,
    ifconfig: PathBuf,
}

impl NativeDhcp {
    pub fn new(agent: PathBuf, ifconfig: PathBuf) -> Self {
        Self { agent, ifconfig }
    }
}

/// Run `cmd` to completion within `timeout`, returning exit code and the
/// combined, trimmed output.
async fn run_bounded(
    mut cmd: Command,
    operation: &str,
    timeout: Duration,
) -> Result<(i32, String), FacilityError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| FacilityError::io(operation, e))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FacilityError::Timeout {
            operation: operation.to_string(),
            secs: timeout.as_secs(),
        })?
        .map_err(|e| FacilityError::io(operation, e))?;

    let mut message = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !message.is_empty() {
            message.push('\n');
        }
        message.push_str(stderr.trim());
    }

    // killed by a signal
    let code = output.status.code().unwrap_or(-1);
    Ok((code, message))
}

#[async_trait]
impl DhcpAgent for NativeDhcp {
    async fn ensure_running(&self, timeout: Duration) -> Result<(), FacilityError> {
        let (code, message) =
            run_bounded(Command::new(&self.agent), "start dhcpagent", timeout).await?;

        if code == 0 {
            info!("dhcpagent started");
            return Ok(());
        }
        if message.contains(ALREADY_RUNNING) {
            debug!("dhcpagent already running");
            return Ok(());
        }

        Err(FacilityError::rejected(
            "start dhcpagent",
            format!("exit code {}: {}", code, message),
        ))
    }

    async fn start_lease(&self, iface: &str, timeout: Duration) -> Result<DhcpReply, FacilityError> {
        let wait_secs = timeout.as_secs().to_string();
        let mut cmd = Command::new(&self.ifconfig);
        cmd.args([iface, "dhcp", "start", "wait", wait_secs.as_str()]);

        // the agent gets its own bound; ours only covers a wedged ifconfig
        let (return_code, message) =
            run_bounded(cmd, &format!("DHCP start on {}", iface), timeout + Duration::from_secs(1))
                .await?;

        Ok(DhcpReply {
            return_code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_run_collects_output() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);

        let (code, message) = run_bounded(cmd, "probe", Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(message, "out\nerr");
    }

    #[tokio::test]
    async fn test_bounded_run_times_out() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 5"]);

        let err = run_bounded(cmd, "probe", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_agent_already_running_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("dhcpagent");
        std::fs::write(&agent, "#!/bin/sh\necho 'dhcpagent: already running' >&2\nexit 1\n").unwrap();
        make_executable(&agent);

        let dhcp = NativeDhcp::new(agent, "/bin/false".into());
        dhcp.ensure_running(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_agent_fails() {
        let dhcp = NativeDhcp::new("/nonexistent/dhcpagent".into(), "/bin/false".into());
        let err = dhcp.ensure_running(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FacilityError::Io { .. }));
    }

    #[tokio::test]
    async fn test_lease_reports_return_code() {
        let dhcp = NativeDhcp::new("/bin/true".into(), "/bin/false".into());
        let reply = dhcp.start_lease("net0", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.return_code, 1);
    }

    fn make_executable(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
