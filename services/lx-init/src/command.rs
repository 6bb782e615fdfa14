//! Native programs run during boot: management daemons, the static route
//! feed and the post-network hook.
//!
//! Every program runs to completion before the next step starts.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use lxinit_networking::{apply_line, AutoconfService, FacilityError, RouteChannel};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::InitError;

/// Bytes of route feed stderr kept for the failure message.
pub const STDERR_CAPTURE_LIMIT: usize = 512;

/// Human-readable exit status.
fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        (None, None) => "terminated abnormally".to_string(),
    }
}

/// Reap any zombie child processes left by daemonizing services.
pub fn reap_zombies() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "reaped zombie");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "reaped signaled zombie");
            }
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                warn!(error = %e, "waitpid error");
                break;
            }
            _ => {}
        }
    }
}

/// A native daemon whose launcher is run once and waited for.
#[derive(Debug, Clone)]
pub struct Service {
    name: &'static str,
    path: PathBuf,
    fmri: &'static str,
}

impl Service {
    pub fn new(name: &'static str, path: PathBuf, fmri: &'static str) -> Self {
        Self { name, path, fmri }
    }

    /// The IP interface management daemon.
    pub fn ipmgmtd(native_root: &Path) -> Self {
        Self::new(
            "ipmgmtd",
            native_root.join("lib/inet/ipmgmtd"),
            "svc:/network/ip-interface-management:default",
        )
    }

    /// The neighbor discovery daemon, which performs autoconfiguration.
    pub fn ndpd(native_root: &Path) -> Self {
        Self::new(
            "in.ndpd",
            native_root.join("usr/lib/inet/in.ndpd"),
            "svc:/network/routing/ndp:default",
        )
    }

    /// Run the launcher with an empty environment apart from `SMF_FMRI`.
    pub async fn launch(&self) -> Result<(), InitError> {
        info!(service = self.name, path = %self.path.display(), "starting service");

        let failed = |detail: String| InitError::ServiceFailed {
            name: self.name.to_string(),
            detail,
        };

        let status = Command::new(&self.path)
            .arg0(self.name)
            .env_clear()
            .env("SMF_FMRI", self.fmri)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| failed(format!("failed to start: {}", e)))?;

        if !status.success() {
            return Err(failed(describe(status)));
        }

        info!(service = self.name, "service started");
        Ok(())
    }
}

#[async_trait]
impl AutoconfService for Service {
    async fn start(&self) -> Result<(), FacilityError> {
        self.launch()
            .await
            .map_err(|e| FacilityError::rejected(self.name, e.to_string()))
    }
}

/// Read up to `limit` bytes as text, then drain the rest.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<String> {
    let mut kept = Vec::with_capacity(limit);
    (&mut reader).take(limit as u64).read_to_end(&mut kept).await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(String::from_utf8_lossy(&kept).trim().to_string())
}

/// The program that prints the zone's static routes.
#[derive(Debug, Clone)]
pub struct RouteFeed {
    path: PathBuf,
}

impl RouteFeed {
    pub fn new(native_root: &Path) -> Self {
        Self::at(native_root.join("usr/lib/brand/lx/routeinfo"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Run the feed and install every route it prints.
    ///
    /// Returns the number of routes installed. A missing feed installs none.
    pub async fn run(&self, channel: &dyn RouteChannel) -> Result<usize, InitError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                debug!(path = %self.path.display(), "no static route feed");
                return Ok(0);
            }
        }

        let mut child = Command::new(&self.path)
            .arg0("routeinfo")
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InitError::StaticRouteFailed(format!("{}: {}", self.path.display(), e))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(InitError::StaticRouteFailed(
                "route feed output not captured".to_string(),
            ));
        };

        let feed = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut installed = 0;
            while let Some(line) = lines.next_line().await? {
                let parsed = apply_line(channel, &line)?;
                info!(route = %parsed.request, "static route added");
                installed += 1;
            }
            Ok::<_, InitError>(installed)
        };
        let capture = async {
            read_capped(stderr, STDERR_CAPTURE_LIMIT)
                .await
                .map_err(InitError::from)
        };

        let (installed, stderr) = tokio::try_join!(feed, capture)?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(InitError::StaticRouteFailed(format!(
                "{} {}: {}",
                self.path.display(),
                describe(status),
                stderr
            )));
        }

        Ok(installed)
    }
}

/// Brand hook run once networking is up.
#[derive(Debug, Clone)]
pub struct PostnetHook {
    path: PathBuf,
}

impl PostnetHook {
    pub fn new(native_root: &Path) -> Self {
        Self::at(native_root.join("usr/lib/brand/lx/lx_hook_postnet"))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Run the hook if present and executable.
    pub async fn run(&self) -> Result<(), InitError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no post-network hook");
            return Ok(());
        }

        let output = match Command::new(&self.path)
            .env_clear()
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(path = %self.path.display(), "post-network hook not executable");
                return Ok(());
            }
            Err(e) => {
                return Err(InitError::HookFailed(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let text = [output.stdout.as_slice(), output.stderr.as_slice()]
            .map(String::from_utf8_lossy)
            .join("");
        for line in text.lines().filter(|l| !l.is_empty()) {
            info!(hook = "postnet", "{}", line);
        }

        if !output.status.success() {
            return Err(InitError::HookFailed(format!(
                "{} {}: {}",
                self.path.display(),
                describe(output.status),
                text.trim()
            )));
        }

        Ok(())
    }
}
