//! # archiver-browser-core
//!
//! The core of a headless-browser automation driver for a web-archiving
//! crawler: Chrome process supervision, a DevTools session driver that
//! implements the page-visit state machine, and a fixed-size browser pool.
//!
//! Out of scope, by design: the in-page behavior engine beyond the [`Behavior`]
//! seam, the crawler's frontier/scheduling, archive/WARC writing, and any
//! HTTP capture pipeline. See `DESIGN.md` for the full grounding ledger.

mod behavior;
mod config;
mod connection;
mod error;
mod pool;
mod session;
mod supervisor;

pub use behavior::{Behavior, ChromeSender, ImmediateBehavior};
pub use config::{DriverConfig, DEFAULT_ANALYTICS_BREAKPOINT_URL_REGEX, DEFAULT_BASE_PORT};
pub use error::{Error, Result};
pub use pool::BrowserPool;
pub use session::{BrowseCallbacks, SessionDriver};
pub use supervisor::Supervisor;

/// Returns the library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
