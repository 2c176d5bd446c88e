//! Lock-guarded identity→channel tables.
//!
//! Three instances exist per bus: `filters`, `pubsub`, `patterns`. All
//! structural changes happen under the table lock, and the channel list lock
//! is only ever taken while the table lock is held (fixed order table →
//! channel), so channel creation and destruction are atomic with respect to
//! concurrent subscribes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};

use crate::channel::{Channel, ChannelKey, Subscription};
use crate::task::lock_unpoisoned;

// Tables smaller than this are never compacted.
const COMPACT_MIN_CAPACITY: usize = 512;

pub(crate) struct Collection {
    map: Mutex<HashMap<ChannelKey, Arc<Channel>>>,
}

/// Result of removing one subscription from a channel.
pub(crate) enum RemoveOutcome {
    /// The channel list lock was contended; retry on the task queue.
    Busy,
    /// Removed; `destroyed` carries the channel if its list emptied and it
    /// left the table.
    Removed { destroyed: Option<Arc<Channel>> },
}

impl Collection {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Finds or creates the channel for `key` and appends `sub` to its list,
    /// all under the table lock. `on_create` runs (still under the lock) only
    /// when the channel was created by this call, before the subscription is
    /// appended.
    pub fn subscribe(
        &self,
        key: ChannelKey,
        sub: Arc<Subscription>,
        make: impl FnOnce() -> Arc<Channel>,
        on_create: impl FnOnce(&Arc<Channel>),
    ) -> Arc<Channel> {
        let mut map = lock_unpoisoned(&self.map);
        let chan = match map.get(&key) {
            Some(chan) => Arc::clone(chan),
            None => {
                let chan = make();
                map.insert(key, Arc::clone(&chan));
                on_create(&chan);
                chan
            }
        };
        lock_unpoisoned(&chan.subscribers).push(sub);
        chan
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        lock_unpoisoned(&self.map).get(key).cloned()
    }

    /// Removes `sub` from `key`'s channel. If the channel list empties, the
    /// channel leaves the table in the same critical section. The list lock
    /// is only tried; contention reports [`RemoveOutcome::Busy`] so the
    /// caller can re-defer instead of spinning under the table lock.
    pub fn remove_subscription(&self, key: &ChannelKey, sub: &Arc<Subscription>) -> RemoveOutcome {
        let mut map = lock_unpoisoned(&self.map);
        let Some(chan) = map.get(key).cloned() else {
            return RemoveOutcome::Removed { destroyed: None };
        };
        let mut list = match chan.subscribers.try_lock() {
            Ok(list) => list,
            Err(TryLockError::Poisoned(err)) => err.into_inner(),
            Err(TryLockError::WouldBlock) => return RemoveOutcome::Busy,
        };
        list.retain(|entry| !Arc::ptr_eq(entry, sub));
        let destroyed = if list.is_empty() {
            map.remove(key);
            Some(Arc::clone(&chan))
        } else {
            None
        };
        drop(list);
        Self::maybe_compact(&mut map);
        RemoveOutcome::Removed { destroyed }
    }

    /// Copy of every channel currently in the table.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        lock_unpoisoned(&self.map).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.map).len()
    }

    /// Consolidates table storage; used after fork to keep the child's pages
    /// compact.
    pub fn compact(&self) {
        lock_unpoisoned(&self.map).shrink_to_fit();
    }

    fn maybe_compact(map: &mut HashMap<ChannelKey, Arc<Channel>>) {
        if map.capacity() > COMPACT_MIN_CAPACITY && map.len() < map.capacity() / 2 {
            map.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(name: &'static [u8]) -> ChannelKey {
        ChannelKey::Name(Bytes::from_static(name))
    }

    fn noop_sub() -> Arc<Subscription> {
        Subscription::new(Box::new(|_| {}), None, None, None)
    }

    #[test]
    fn subscribe_creates_channel_once() {
        let col = Collection::new();
        let mut created = 0;
        for _ in 0..3 {
            col.subscribe(
                key(b"a"),
                noop_sub(),
                || Channel::new(key(b"a"), None),
                |_| created += 1,
            );
        }
        assert_eq!(created, 1);
        assert_eq!(col.len(), 1);
        assert_eq!(col.get(&key(b"a")).unwrap().subscriber_snapshot().len(), 3);
    }

    #[test]
    fn removing_last_subscription_destroys_the_channel() {
        let col = Collection::new();
        let sub = noop_sub();
        col.subscribe(
            key(b"a"),
            Arc::clone(&sub),
            || Channel::new(key(b"a"), None),
            |_| {},
        );
        match col.remove_subscription(&key(b"a"), &sub) {
            RemoveOutcome::Removed { destroyed } => {
                let chan = destroyed.expect("channel should be destroyed");
                assert_eq!(chan.key, key(b"a"));
            }
            RemoveOutcome::Busy => panic!("uncontended removal reported busy"),
        }
        assert!(col.get(&key(b"a")).is_none());
        assert_eq!(col.len(), 0);
    }

    #[test]
    fn removal_keeps_channel_while_other_subscriptions_remain() {
        let col = Collection::new();
        let first = noop_sub();
        let second = noop_sub();
        col.subscribe(
            key(b"a"),
            Arc::clone(&first),
            || Channel::new(key(b"a"), None),
            |_| {},
        );
        col.subscribe(
            key(b"a"),
            Arc::clone(&second),
            || Channel::new(key(b"a"), None),
            |_| {},
        );
        match col.remove_subscription(&key(b"a"), &first) {
            RemoveOutcome::Removed { destroyed } => assert!(destroyed.is_none()),
            RemoveOutcome::Busy => panic!("uncontended removal reported busy"),
        }
        assert_eq!(col.get(&key(b"a")).unwrap().subscriber_snapshot().len(), 1);
    }

    #[test]
    fn contended_channel_lock_reports_busy() {
        let col = Collection::new();
        let sub = noop_sub();
        let chan = col.subscribe(
            key(b"a"),
            Arc::clone(&sub),
            || Channel::new(key(b"a"), None),
            |_| {},
        );
        let guard = chan.subscribers.lock().unwrap();
        match col.remove_subscription(&key(b"a"), &sub) {
            RemoveOutcome::Busy => {}
            RemoveOutcome::Removed { .. } => panic!("removal should be contended"),
        }
        drop(guard);
    }
}
