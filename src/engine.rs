//! Pluggable pub/sub engines.
//!
//! An engine mirrors the bus's channel set into an external broker: it is
//! told when a pub/sub or pattern channel first gains a subscriber and when
//! its last subscriber leaves, and engine-scoped publishes are handed to it
//! instead of the built-in fan-out. The built-in cluster scopes are plain
//! enum variants, not engines, so the dispatcher can fast-path them.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::debug;

use crate::message::Encoding;
use crate::task::lock_unpoisoned;
use crate::Result;

/// An external pub/sub backend.
///
/// Channel hooks are invoked while the bus holds the owning table lock, so
/// they must not call back into subscription management; queueing work and
/// returning is the expected shape.
pub trait Engine: Send + Sync {
    /// A channel with this identity gained its first local subscriber.
    /// `matcher` is the symbolic match-function name for pattern channels.
    fn subscribe(&self, channel: &[u8], matcher: Option<&[u8]>);

    /// The channel's last local subscriber left.
    fn unsubscribe(&self, channel: &[u8], matcher: Option<&[u8]>);

    /// An engine-scoped publish. Only the pub/sub namespace reaches engines.
    fn publish(&self, channel: &Bytes, payload: &Bytes, encoding: Encoding) -> Result<()>;

    /// Called once when the engine is attached to a running bus.
    fn on_startup(&self) {}
}

pub(crate) struct EngineRegistry {
    engines: Mutex<Vec<Arc<dyn Engine>>>,
    // `None` routes `Scope::Default` through the built-in cluster scope.
    default_engine: Mutex<Option<Arc<dyn Engine>>>,
}

fn same_engine(a: &Arc<dyn Engine>, b: &Arc<dyn Engine>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(Vec::new()),
            default_engine: Mutex::new(None),
        }
    }

    /// Inserts the engine. Returns false when it was already attached.
    pub fn attach(&self, engine: &Arc<dyn Engine>) -> bool {
        let mut engines = lock_unpoisoned(&self.engines);
        if engines.iter().any(|e| same_engine(e, engine)) {
            return false;
        }
        engines.push(Arc::clone(engine));
        true
    }

    /// Removes the engine. Detaching the current default engine reverts the
    /// default to the built-in cluster scope.
    pub fn detach(&self, engine: &Arc<dyn Engine>) -> bool {
        let mut engines = lock_unpoisoned(&self.engines);
        let before = engines.len();
        engines.retain(|e| !same_engine(e, engine));
        let removed = engines.len() != before;
        drop(engines);
        if removed {
            let mut default = lock_unpoisoned(&self.default_engine);
            if default.as_ref().is_some_and(|d| same_engine(d, engine)) {
                *default = None;
            }
        } else {
            debug!("detach of an engine that was never attached");
        }
        removed
    }

    pub fn is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        lock_unpoisoned(&self.engines)
            .iter()
            .any(|e| same_engine(e, engine))
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Engine>> {
        lock_unpoisoned(&self.engines).clone()
    }

    pub fn set_default(&self, engine: Option<Arc<dyn Engine>>) {
        *lock_unpoisoned(&self.default_engine) = engine;
    }

    pub fn default_engine(&self) -> Option<Arc<dyn Engine>> {
        lock_unpoisoned(&self.default_engine).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        subscribes: AtomicUsize,
    }

    impl Engine for CountingEngine {
        fn subscribe(&self, _channel: &[u8], _matcher: Option<&[u8]>) {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
        }
        fn unsubscribe(&self, _channel: &[u8], _matcher: Option<&[u8]>) {}
        fn publish(&self, _channel: &Bytes, _payload: &Bytes, _encoding: Encoding) -> Result<()> {
            Ok(())
        }
    }

    fn counting_engine() -> Arc<dyn Engine> {
        Arc::new(CountingEngine {
            subscribes: AtomicUsize::new(0),
        })
    }

    #[test]
    fn attach_is_idempotent_by_identity() {
        let registry = EngineRegistry::new();
        let engine = counting_engine();
        assert!(registry.attach(&engine));
        assert!(!registry.attach(&engine));
        assert!(registry.is_attached(&engine));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn detach_clears_default_when_it_was_the_default() {
        let registry = EngineRegistry::new();
        let engine = counting_engine();
        registry.attach(&engine);
        registry.set_default(Some(Arc::clone(&engine)));
        assert!(registry.default_engine().is_some());
        assert!(registry.detach(&engine));
        assert!(registry.default_engine().is_none());
        assert!(!registry.is_attached(&engine));
    }

    #[test]
    fn detach_of_unattached_engine_is_a_no_op() {
        let registry = EngineRegistry::new();
        let engine = counting_engine();
        assert!(!registry.detach(&engine));
    }
}
