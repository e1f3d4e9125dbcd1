//! The browser pool (§4.3): a fixed-size rendezvous of pre-assigned debug
//! ports, handed out under mutual exclusion.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{DriverConfig, DEFAULT_BASE_PORT};
use crate::session::SessionDriver;
use crate::{Error, Result};

struct PoolState {
    available: Vec<Arc<SessionDriver>>,
    in_use: Vec<Arc<SessionDriver>>,
}

/// Holds N pre-configured [`SessionDriver`]s, each bound to a distinct
/// debug port, and hands them out under a single exclusion primitive. §4.3.
pub struct BrowserPool {
    state: Mutex<PoolState>,
    size: usize,
}

impl BrowserPool {
    /// Allocates `size` drivers on ports `base_port + 0 .. base_port +
    /// size - 1`, all sharing `config`.
    pub fn new(size: usize, config: DriverConfig, base_port: u16) -> Self {
        let available = (0..size)
            .map(|i| Arc::new(SessionDriver::new(base_port + i as u16, config.clone())))
            .collect();
        Self {
            state: Mutex::new(PoolState { available, in_use: Vec::new() }),
            size,
        }
    }

    /// Convenience constructor using [`DEFAULT_BASE_PORT`].
    pub fn with_default_base_port(size: usize, config: DriverConfig) -> Self {
        Self::new(size, config, DEFAULT_BASE_PORT)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Removes an arbitrary driver from `available` and moves it to
    /// `in_use`. Fails with [`Error::PoolEmpty`] if none remain.
    pub async fn acquire(&self) -> Result<Arc<SessionDriver>> {
        let mut state = self.state.lock().await;
        let driver = state.available.pop().ok_or(Error::PoolEmpty)?;
        state.in_use.push(driver.clone());
        Ok(driver)
    }

    /// Moves `driver` back from `in_use` to `available`. Not required to be
    /// idempotent (§4.3): releasing a driver not currently tracked as
    /// in-use is a no-op rather than an error.
    pub async fn release(&self, driver: Arc<SessionDriver>) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.in_use.iter().position(|d| d.port() == driver.port()) {
            state.in_use.remove(pos);
            state.available.push(driver);
        }
    }

    /// Invokes `abort_browse_page` on every driver currently in use.
    /// Non-blocking: does not wait for any in-progress visit to unwind.
    pub async fn shutdown_now(&self) {
        let state = self.state.lock().await;
        for driver in &state.in_use {
            driver.abort_browse_page();
        }
    }

    #[cfg(test)]
    async fn available_count(&self) -> usize {
        self.state.lock().await.available.len()
    }

    #[cfg(test)]
    async fn in_use_count(&self) -> usize {
        self.state.lock().await.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_partition_invariant_holds() {
        let pool = BrowserPool::new(2, DriverConfig::default(), 9200);
        assert_eq!(pool.available_count().await, 2);
        assert_eq!(pool.in_use_count().await, 0);

        let d1 = pool.acquire().await.unwrap();
        let d2 = pool.acquire().await.unwrap();
        assert_ne!(d1.port(), d2.port());
        assert_eq!(
            [d1.port(), d2.port()].iter().collect::<std::collections::HashSet<_>>().len(),
            2
        );
        assert_eq!(pool.available_count().await, 0);
        assert_eq!(pool.in_use_count().await, 2);

        assert!(matches!(pool.acquire().await, Err(Error::PoolEmpty)));

        pool.release(d1).await;
        assert_eq!(pool.available_count().await, 1);
        assert_eq!(pool.in_use_count().await, 1);

        let d4 = pool.acquire().await.unwrap();
        assert_eq!(pool.available_count().await, 0);
        let _ = d4;
    }

    #[tokio::test]
    async fn ports_assigned_from_base_sequentially() {
        let pool = BrowserPool::new(3, DriverConfig::default(), 9200);
        let mut ports = Vec::new();
        while let Ok(driver) = pool.acquire().await {
            ports.push(driver.port());
        }
        ports.sort_unstable();
        assert_eq!(ports, vec![9200, 9201, 9202]);
    }

    #[tokio::test]
    async fn shutdown_now_aborts_only_in_use_drivers() {
        let pool = BrowserPool::new(2, DriverConfig::default(), 9200);
        let in_use = pool.acquire().await.unwrap();
        pool.shutdown_now().await;
        assert!(in_use.abort.load(std::sync::atomic::Ordering::SeqCst));
    }
}
