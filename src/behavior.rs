//! The in-page behavior collaborator (§4.4, §6)
//!
//! The page-visit state machine delegates "is there more to do on this
//! page" to an external `Behavior`. The distilled protocol treats it as
//! fully opaque (a duck-typed `Behavior(url, driver)` collaborator); Rust
//! has no duck typing, so it becomes a trait object built by a factory in
//! [`crate::DriverConfig::behavior_factory`] and driven through a
//! [`ChromeSender`] handle rather than the whole driver.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::Result;

/// A narrow handle a [`Behavior`] uses to issue commands to the page being
/// browsed, without needing access to the rest of [`crate::SessionDriver`].
#[derive(Clone)]
pub struct ChromeSender {
    pub(crate) connection: Arc<Connection>,
}

impl ChromeSender {
    /// Allocate the next command id on this visit's connection, send
    /// `{id, method, params}`, and return the id.
    pub fn send_to_chrome(&self, method: &str, params: Value) -> Result<u32> {
        self.connection.send(method, params)
    }
}

/// In-page activity engine bound to one page-visit.
///
/// Implementors use interior mutability (the trait takes `&self`) since the
/// visit poller holds a shared `Box<dyn Behavior>` and also forwards reply
/// messages to it from the same task that polls `is_finished`.
pub trait Behavior: Send + Sync {
    /// Begin in-page activity, typically by sending one or more commands
    /// through `sender`.
    fn start(&self, sender: &ChromeSender) -> Result<()>;

    /// Whether this behavior considers the page visit complete.
    fn is_finished(&self) -> bool;

    /// Called on every `Network.requestWillBeSent` event observed during
    /// the visit, including `data:` URLs.
    fn notify_of_activity(&self);

    /// Whether `msg_id` belongs to a command this behavior previously sent
    /// via `sender`, and is therefore owed the reply.
    fn is_waiting_on_result(&self, msg_id: u32) -> bool;

    /// Delivers a reply whose id matched `is_waiting_on_result`.
    fn notify_of_result(&self, sender: &ChromeSender, message: &Value);
}

/// A trivial built-in [`Behavior`] that performs no in-page activity and
/// reports finished as soon as it is polled. Suitable for tests and for
/// crawlers that only need screenshot + outlink extraction with no
/// scripted interaction.
#[derive(Debug, Default)]
pub struct ImmediateBehavior {
    activity_seen: AtomicBool,
}

impl Behavior for ImmediateBehavior {
    fn start(&self, _sender: &ChromeSender) -> Result<()> {
        Ok(())
    }

    fn is_finished(&self) -> bool {
        true
    }

    fn notify_of_activity(&self) {
        self.activity_seen.store(true, Ordering::Relaxed);
    }

    fn is_waiting_on_result(&self, _msg_id: u32) -> bool {
        false
    }

    fn notify_of_result(&self, _sender: &ChromeSender, _message: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_behavior_is_always_finished() {
        let behavior = ImmediateBehavior::default();
        assert!(behavior.is_finished());
        behavior.notify_of_activity();
        assert!(behavior.is_finished());
    }

    #[test]
    fn immediate_behavior_never_waits_on_results() {
        let behavior = ImmediateBehavior::default();
        assert!(!behavior.is_waiting_on_result(1));
        assert!(!behavior.is_waiting_on_result(0));
    }
}
