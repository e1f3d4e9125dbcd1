//! Driver-wide tunables
//!
//! The distilled protocol behavior hardcodes these as constants; this crate
//! collects them into one struct so tests and embedders can override them
//! without touching the state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::behavior::{Behavior, ImmediateBehavior};

/// URL regex the driver uses to breakpoint and neutralize Google Analytics'
/// `analytics.js`, matching the one historically used by web archiving
/// crawlers to avoid skewing site analytics while crawling.
pub const DEFAULT_ANALYTICS_BREAKPOINT_URL_REGEX: &str =
    r"https?://www\.google-analytics\.com/analytics\.js";

/// Base debug port for the first driver in a [`crate::BrowserPool`].
pub const DEFAULT_BASE_PORT: u16 = 9200;

/// Tunables shared by every [`crate::SessionDriver`] in a pool.
#[derive(Clone)]
pub struct DriverConfig {
    /// Path (or bare name resolved via `PATH`) to the Chromium-family
    /// executable.
    pub chrome_executable: PathBuf,
    /// Ceiling on `Supervisor::start` before it gives up (§4.1: 600s).
    pub startup_timeout: Duration,
    /// Interval between readiness polls of `/json` (§4.1: 500ms).
    pub startup_poll_interval: Duration,
    /// Time since the last SIGTERM before `Supervisor::stop` resends it
    /// (§4.1: 10s).
    pub shutdown_resignal_interval: Duration,
    /// Ceiling on `Supervisor::stop` before escalating to SIGKILL (§4.1: 300s).
    pub shutdown_timeout: Duration,
    /// Interval the visit poll loop sleeps between checks (§4.2/§5: 500ms).
    pub visit_poll_interval: Duration,
    /// Hard per-visit ceiling regardless of behavior progress (§4.2: 1200s).
    pub visit_hard_timeout: Duration,
    /// `urlRegex` passed to `Debugger.setBreakpointByUrl` to neutralize
    /// analytics scripts (§9 design note: exposed as configuration).
    pub analytics_breakpoint_url_regex: String,
    /// Whether to pass `--ignore-certificate-errors` to Chrome.
    pub ignore_cert_errors: bool,
    /// Factory constructing the `Behavior` collaborator for a visit, given
    /// the target URL. Defaults to [`ImmediateBehavior`], which performs no
    /// in-page activity and reports finished on the first poll; real
    /// crawlers are expected to supply their own.
    pub behavior_factory: Arc<dyn Fn(&str) -> Box<dyn Behavior> + Send + Sync>,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("chrome_executable", &self.chrome_executable)
            .field("startup_timeout", &self.startup_timeout)
            .field("startup_poll_interval", &self.startup_poll_interval)
            .field("shutdown_resignal_interval", &self.shutdown_resignal_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("visit_poll_interval", &self.visit_poll_interval)
            .field("visit_hard_timeout", &self.visit_hard_timeout)
            .field("analytics_breakpoint_url_regex", &self.analytics_breakpoint_url_regex)
            .field("ignore_cert_errors", &self.ignore_cert_errors)
            .field("behavior_factory", &"<fn>")
            .finish()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            chrome_executable: PathBuf::from("chromium-browser"),
            startup_timeout: Duration::from_secs(600),
            startup_poll_interval: Duration::from_millis(500),
            shutdown_resignal_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(300),
            visit_poll_interval: Duration::from_millis(500),
            visit_hard_timeout: Duration::from_secs(20 * 60),
            analytics_breakpoint_url_regex: DEFAULT_ANALYTICS_BREAKPOINT_URL_REGEX.to_string(),
            ignore_cert_errors: false,
            behavior_factory: Arc::new(|_url| Box::new(ImmediateBehavior::default())),
        }
    }
}
