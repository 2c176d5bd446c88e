//! Subscription and channel records.
//!
//! A channel groups the subscriptions sharing one identity; the three
//! collections in [`crate::collection`] own the channels. A subscription is
//! reference-counted: the channel list holds one strong reference and every
//! in-flight delivery holds another, so `on_unsubscribe` runs exactly once,
//! after the last of them is gone.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::message::{AnyData, MessageView};
use crate::task::lock_unpoisoned;

/// Channel identity: an opaque byte name in the pub/sub namespace, or a
/// process-local numeric filter. The two namespaces are disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Name(Bytes),
    Filter(i32),
}

impl ChannelKey {
    pub fn name(&self) -> Option<&Bytes> {
        match self {
            ChannelKey::Name(name) => Some(name),
            ChannelKey::Filter(_) => None,
        }
    }

    pub fn filter(&self) -> Option<i32> {
        match self {
            ChannelKey::Name(_) => None,
            ChannelKey::Filter(filter) => Some(*filter),
        }
    }
}

pub(crate) type CallbackFn = dyn Fn(&MessageView<'_>) + Send + Sync;
pub(crate) type UnsubscribeFn = Box<dyn FnOnce() + Send>;
pub(crate) type MatcherFn = dyn Fn(&[u8], &[u8]) -> bool + Send + Sync;

/// A match function paired with the symbolic name it is registered under.
/// The name is what crosses the cluster socket for pattern subscriptions;
/// each process resolves it against its own matcher registry.
#[derive(Clone)]
pub(crate) struct NamedMatcher {
    pub name: Bytes,
    pub func: Arc<MatcherFn>,
}

pub(crate) struct Subscription {
    pub(crate) callback: Box<CallbackFn>,
    on_unsubscribe: Mutex<Option<UnsubscribeFn>>,
    pub(crate) udata1: Option<AnyData>,
    pub(crate) udata2: Option<AnyData>,
    // Serializes callback runs; deliveries try-lock and re-defer on contention.
    pub(crate) delivery: Mutex<()>,
}

impl Subscription {
    pub fn new(
        callback: Box<CallbackFn>,
        on_unsubscribe: Option<UnsubscribeFn>,
        udata1: Option<AnyData>,
        udata2: Option<AnyData>,
    ) -> Arc<Self> {
        Arc::new(Self {
            callback,
            on_unsubscribe: Mutex::new(on_unsubscribe),
            udata1,
            udata2,
            delivery: Mutex::new(()),
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let hook = lock_unpoisoned(&self.on_unsubscribe).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

pub(crate) struct Channel {
    pub(crate) key: ChannelKey,
    // `Some` iff the channel lives in the patterns collection.
    pub(crate) matcher: Option<NamedMatcher>,
    pub(crate) subscribers: Mutex<Vec<Arc<Subscription>>>,
}

impl Channel {
    pub fn new(key: ChannelKey, matcher: Option<NamedMatcher>) -> Arc<Self> {
        Arc::new(Self {
            key,
            matcher,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the subscriber list, in list (subscribe) order.
    pub fn subscriber_snapshot(&self) -> Vec<Arc<Subscription>> {
        lock_unpoisoned(&self.subscribers).clone()
    }
}

/// Which collection a subscription was filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionKind {
    Filters,
    Pubsub,
    Patterns,
}

/// Opaque handle returned by a successful subscribe. Passing it back to
/// [`crate::Postoffice::unsubscribe`] removes the subscription; dropping it
/// without unsubscribing leaves the subscription active for the lifetime of
/// the bus.
pub struct SubscriptionHandle {
    pub(crate) sub: Arc<Subscription>,
    pub(crate) key: ChannelKey,
    pub(crate) kind: CollectionKind,
}

impl SubscriptionHandle {
    /// The identity of the channel this subscription is attached to.
    pub fn channel(&self) -> &ChannelKey {
        &self.key
    }
}
