//! Chrome process supervision (§4.1)
//!
//! Spawns a Chromium-family browser in an isolated profile, polls its
//! DevTools readiness endpoint for the `about:blank` target, and tears it
//! down with escalating signals. Each `Supervisor` owns exactly one
//! subprocess and the two temp directories backing its profile.

use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::config::DriverConfig;
use crate::{Error, Result};

#[cfg(unix)]
use nix::sys::signal;
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Cross-platform stand-in for the two signals `stop()` escalates through.
/// Only meaningful on unix, where [`Supervisor::send_signal`] maps it onto
/// `nix::sys::signal::Signal`; kept as a plain enum so `stop()`'s control
/// flow doesn't need a `cfg` split.
#[derive(Debug, Clone, Copy)]
enum Signal {
    Sigterm,
    Sigkill,
}

#[derive(Debug, Deserialize)]
struct TargetDescriptor {
    url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Owns one Chrome/Chromium subprocess and its scratch profile directories.
///
/// Lifecycle: construct (no process yet) → `start()` (spawns, polls) →
/// running → `stop()` (signals, reaps, deletes dirs) → terminal. `Drop` is a
/// last-resort safety net in case `stop()` was never called.
pub struct Supervisor {
    port: u16,
    config: DriverConfig,
    proxy: Option<String>,
    user_home_dir: Option<PathBuf>,
    user_data_dir: Option<PathBuf>,
    process: Option<Child>,
    start_time: Option<Instant>,
}

impl Supervisor {
    pub fn new(port: u16, config: DriverConfig, proxy: Option<String>) -> Self {
        Self {
            port,
            config,
            proxy,
            user_home_dir: None,
            user_data_dir: None,
            process: None,
            start_time: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Spawns Chrome in a fresh temp home/profile and waits for its
    /// DevTools readiness endpoint to expose an `about:blank` target with a
    /// websocket debugger URL. §4.1.
    pub async fn start(&mut self) -> Result<String> {
        let unique = uuid::Uuid::new_v4();
        let user_home_dir = std::env::temp_dir().join(format!("browser-core-home-{}", unique));
        let user_data_dir = user_home_dir.join("chrome-user-data");
        std::fs::create_dir_all(&user_data_dir)?;

        let mut cmd = Command::new(&self.config.chrome_executable);
        cmd.env("HOME", &user_home_dir);
        cmd.arg("--use-mock-keychain");
        cmd.arg(format!("--user-data-dir={}", user_data_dir.display()));
        cmd.arg(format!("--remote-debugging-port={}", self.port));
        cmd.arg("--disable-web-sockets");
        cmd.arg("--disable-cache");
        cmd.arg("--window-size=1100,900");
        cmd.arg("--no-default-browser-check");
        cmd.arg("--disable-first-run-ui");
        cmd.arg("--no-first-run");
        cmd.arg("--homepage=about:blank");
        cmd.arg("--disable-direct-npapi-requests");
        cmd.arg("--disable-web-security");
        if self.config.ignore_cert_errors {
            cmd.arg("--ignore-certificate-errors");
        }
        if let Some(proxy) = &self.proxy {
            cmd.arg(format!("--proxy-server={}", proxy));
        }
        cmd.arg("about:blank");

        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.stdin(Stdio::null());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
        }

        tracing::info!(port = self.port, executable = %self.config.chrome_executable.display(), "spawning chrome");
        let child = cmd.spawn()?;
        tracing::info!(port = self.port, pid = ?child.id(), "chrome running");

        self.user_home_dir = Some(user_home_dir);
        self.user_data_dir = Some(user_data_dir);
        let start_time = Instant::now();
        self.start_time = Some(start_time);
        self.process = Some(child);

        let ws_url = self.poll_for_ws_url(start_time).await?;
        Ok(ws_url)
    }

    async fn poll_for_ws_url(&mut self, start_time: Instant) -> Result<String> {
        let json_url = format!("http://localhost:{}/json", self.port);
        let client = reqwest::Client::new();

        loop {
            if let Ok(response) = client.get(&json_url).send().await {
                if let Ok(targets) = response.json::<Vec<TargetDescriptor>>().await {
                    if let Some(target) = targets
                        .into_iter()
                        .find(|t| t.url == "about:blank" && t.web_socket_debugger_url.is_some())
                    {
                        let url = target.web_socket_debugger_url.unwrap();
                        tracing::info!(port = self.port, ws_url = %url, "got chrome devtools websocket url");
                        return Ok(url);
                    }
                }
            }

            if start_time.elapsed() > self.config.startup_timeout {
                return Err(Error::StartupTimeout(format!(
                    "failed to retrieve {} after {:?}",
                    json_url, self.config.startup_timeout
                )));
            }
            sleep(self.config.startup_poll_interval).await;
        }
    }

    /// Graceful termination with escalation. §4.1 step 1-5. Never raises:
    /// every failure still attempts process reap and directory cleanup.
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let pid = process.id();
            tracing::info!(port = self.port, ?pid, "terminating chrome");

            self.send_signal(pid, Signal::Sigterm);
            let first_sigterm = Instant::now();
            let mut last_sigterm = first_sigterm;

            loop {
                if first_sigterm.elapsed() > self.config.shutdown_timeout {
                    break;
                }
                match process.try_wait() {
                    Ok(Some(status)) => {
                        if status.success() {
                            tracing::info!(port = self.port, ?pid, "chrome exited normally");
                        } else {
                            tracing::warn!(port = self.port, ?pid, ?status, "chrome exited with nonzero status");
                        }
                        self.cleanup_dirs();
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(port = self.port, ?pid, error = %e, "error polling chrome exit status");
                    }
                }

                sleep(self.config.shutdown_resignal_interval.min(Duration::from_millis(500))).await;

                if last_sigterm.elapsed() > self.config.shutdown_resignal_interval {
                    self.send_signal(pid, Signal::Sigterm);
                    last_sigterm = Instant::now();
                }
            }

            tracing::warn!(
                port = self.port,
                ?pid,
                timeout = ?self.config.shutdown_timeout,
                "chrome still alive after graceful timeout, sending SIGKILL"
            );
            self.send_signal(pid, Signal::Sigkill);
            match process.wait().await {
                Ok(status) => tracing::warn!(port = self.port, ?pid, ?status, "chrome reaped after SIGKILL"),
                Err(e) => tracing::error!(port = self.port, ?pid, error = %e, "failed to reap chrome after SIGKILL"),
            }
        }
        self.cleanup_dirs();
    }

    #[cfg(unix)]
    fn send_signal(&self, pid: Option<u32>, signal: Signal) {
        let nix_signal = match signal {
            Signal::Sigterm => signal::Signal::SIGTERM,
            Signal::Sigkill => signal::Signal::SIGKILL,
        };
        if let Some(pid) = pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), nix_signal) {
                tracing::debug!(port = self.port, pid, ?signal, error = %e, "failed to signal chrome (already gone?)");
            }
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _pid: Option<u32>, _signal: Signal) {}

    fn cleanup_dirs(&mut self) {
        if let Some(dir) = self.user_home_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove chrome temp home dir");
                }
            }
        }
        self.user_data_dir = None;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            tracing::warn!(port = self.port, "supervisor dropped without stop(), killing chrome");
            let _ = process.start_kill();
        }
        if let Some(dir) = self.user_home_dir.take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
