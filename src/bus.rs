//! The postoffice: three channel collections, the engine and metadata
//! registries, and the dispatcher that ties them to the deferred-task queue
//! and the cluster link.
//!
//! Subscription callbacks are never run inside `publish`; matching
//! subscriptions are scheduled on the task queue, each delivery holding one
//! reference to the subscription and one to the envelope. Per subscription,
//! deliveries serialize on the subscription's own lock; across
//! subscriptions they are free to run in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use bytes::Bytes;
use log::error;

use crate::channel::{
    CallbackFn, Channel, ChannelKey, CollectionKind, MatcherFn, NamedMatcher, Subscription,
    SubscriptionHandle, UnsubscribeFn,
};
use crate::cluster::{Cluster, RemoteScope};
use crate::collection::{Collection, RemoveOutcome};
use crate::engine::{Engine, EngineRegistry};
use crate::glob::glob_match;
use crate::message::{AnyData, Encoding, Message, MessageView};
use crate::metadata::{MetadataRegistry, ProducerFn};
use crate::task::{lock_unpoisoned, TaskQueue};
use crate::{Error, Result};

/// Name the default glob matcher is registered under; this is also what a
/// pattern subscription announces across the cluster socket.
pub const GLOB_MATCHER: &[u8] = b"glob";

/// Delivery scope of a publish.
#[derive(Clone)]
pub enum Scope {
    /// Every matching subscriber in every process, this one included.
    Cluster,
    /// This process only.
    Process,
    /// Every process except this one.
    Siblings,
    /// The root process only.
    Root,
    /// Whatever the configured default engine is; the built-in cluster
    /// scope when none is set.
    Default,
    /// A specific attached engine.
    Engine(Arc<dyn Engine>),
}

pub struct PostofficeConfig {
    /// Worker threads draining the deferred-task queue. Zero means the
    /// caller drives deliveries through [`Postoffice::perform_all`].
    pub worker_threads: usize,
    /// Idle interval after which a cluster link emits a keepalive ping.
    pub keepalive: Duration,
    /// Whether cluster teardown paths raise real signals (self-SIGINT in
    /// workers, process-group kill at root exit). Disabled for in-process
    /// topologies such as tests.
    pub raise_signals: bool,
}

impl Default for PostofficeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            keepalive: Duration::from_secs(5),
            raise_signals: true,
        }
    }
}

/// Builder-style arguments for [`Postoffice::subscribe`].
pub struct SubscribeOptions {
    target: Option<ChannelKey>,
    matcher: Option<Bytes>,
    callback: Option<Box<CallbackFn>>,
    on_unsubscribe: Option<UnsubscribeFn>,
    udata1: Option<AnyData>,
    udata2: Option<AnyData>,
}

impl SubscribeOptions {
    fn new(target: Option<ChannelKey>, matcher: Option<Bytes>) -> Self {
        Self {
            target,
            matcher,
            callback: None,
            on_unsubscribe: None,
            udata1: None,
            udata2: None,
        }
    }

    /// Exact-match subscription on a named channel.
    pub fn channel(name: impl Into<Bytes>) -> Self {
        Self::new(Some(ChannelKey::Name(name.into())), None)
    }

    /// Process-local numeric filter subscription. `filter` must be non-zero.
    pub fn filter(filter: i32) -> Self {
        Self::new(Some(ChannelKey::Filter(filter)), None)
    }

    /// Pattern subscription using the default glob matcher.
    pub fn pattern(pattern: impl Into<Bytes>) -> Self {
        Self::new(
            Some(ChannelKey::Name(pattern.into())),
            Some(Bytes::from_static(GLOB_MATCHER)),
        )
    }

    /// Selects a registered matcher by name instead of the default glob.
    pub fn matcher(mut self, name: impl Into<Bytes>) -> Self {
        self.matcher = Some(name.into());
        self
    }

    pub fn callback(mut self, f: impl Fn(&MessageView<'_>) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Runs exactly once, when the subscription's last reference is gone —
    /// or immediately, if the subscribe call itself is rejected.
    pub fn on_unsubscribe(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }

    pub fn udata1(mut self, value: AnyData) -> Self {
        self.udata1 = Some(value);
        self
    }

    pub fn udata2(mut self, value: AnyData) -> Self {
        self.udata2 = Some(value);
        self
    }
}

struct MatcherRegistry {
    map: Mutex<HashMap<Bytes, Arc<MatcherFn>>>,
}

impl MatcherRegistry {
    fn new() -> Self {
        let registry = Self {
            map: Mutex::new(HashMap::new()),
        };
        registry.register(
            Bytes::from_static(GLOB_MATCHER),
            Arc::new(|pattern: &[u8], input: &[u8]| glob_match(pattern, input)),
        );
        registry
    }

    fn register(&self, name: Bytes, func: Arc<MatcherFn>) {
        lock_unpoisoned(&self.map).insert(name, func);
    }

    fn get(&self, name: &Bytes) -> Option<Arc<MatcherFn>> {
        lock_unpoisoned(&self.map).get(name).cloned()
    }
}

pub struct Postoffice {
    filters: Collection,
    pubsub: Collection,
    patterns: Collection,
    engines: EngineRegistry,
    metadata: MetadataRegistry,
    matchers: MatcherRegistry,
    pub(crate) tasks: Arc<TaskQueue>,
    pub(crate) cluster: Cluster,
    parent_crash_hooks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    down: AtomicBool,
    worker_threads: usize,
}

impl Postoffice {
    pub fn new() -> Arc<Self> {
        Self::with_config(PostofficeConfig::default())
    }

    pub fn with_config(config: PostofficeConfig) -> Arc<Self> {
        Arc::new(Self {
            filters: Collection::new(),
            pubsub: Collection::new(),
            patterns: Collection::new(),
            engines: EngineRegistry::new(),
            metadata: MetadataRegistry::new(),
            matchers: MatcherRegistry::new(),
            tasks: TaskQueue::new(config.worker_threads),
            cluster: Cluster::new(config.keepalive, config.raise_signals),
            parent_crash_hooks: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
            worker_threads: config.worker_threads,
        })
    }

    fn collection(&self, kind: CollectionKind) -> &Collection {
        match kind {
            CollectionKind::Filters => &self.filters,
            CollectionKind::Pubsub => &self.pubsub,
            CollectionKind::Patterns => &self.patterns,
        }
    }

    // ---- subscription management ----

    pub fn subscribe(self: &Arc<Self>, options: SubscribeOptions) -> Result<SubscriptionHandle> {
        let SubscribeOptions {
            target,
            matcher,
            callback,
            on_unsubscribe,
            udata1,
            udata2,
        } = options;

        let reject = |on_unsubscribe: Option<UnsubscribeFn>, err: Error| {
            if let Some(hook) = on_unsubscribe {
                hook();
            }
            Err(err)
        };

        let Some(callback) = callback else {
            return reject(
                on_unsubscribe,
                Error::InvalidSubscription("missing callback"),
            );
        };
        let Some(key) = target else {
            return reject(
                on_unsubscribe,
                Error::InvalidSubscription("missing channel or filter"),
            );
        };
        if key == ChannelKey::Filter(0) {
            return reject(
                on_unsubscribe,
                Error::InvalidSubscription("filter zero selects the pub/sub namespace"),
            );
        }
        if matcher.is_some() && key.filter().is_some() {
            return reject(
                on_unsubscribe,
                Error::InvalidSubscription("patterns cannot use filters"),
            );
        }
        let named = match matcher {
            Some(name) => match self.matchers.get(&name) {
                Some(func) => Some(NamedMatcher { name, func }),
                None => {
                    let name = String::from_utf8_lossy(&name).into_owned();
                    return reject(on_unsubscribe, Error::UnknownMatcher(name));
                }
            },
            None => None,
        };

        let kind = match (&key, &named) {
            (ChannelKey::Filter(_), _) => CollectionKind::Filters,
            (ChannelKey::Name(_), Some(_)) => CollectionKind::Patterns,
            (ChannelKey::Name(_), None) => CollectionKind::Pubsub,
        };
        let sub = Subscription::new(callback, on_unsubscribe, udata1, udata2);
        let make_key = key.clone();
        self.collection(kind).subscribe(
            key.clone(),
            Arc::clone(&sub),
            move || Channel::new(make_key, named),
            |chan| {
                if kind != CollectionKind::Filters {
                    self.announce_channel_created(chan);
                }
            },
        );
        Ok(SubscriptionHandle { sub, key, kind })
    }

    pub fn unsubscribe(self: &Arc<Self>, handle: SubscriptionHandle) {
        let SubscriptionHandle { sub, key, kind } = handle;
        self.remove_subscription(kind, key, sub);
    }

    fn remove_subscription(self: &Arc<Self>, kind: CollectionKind, key: ChannelKey, sub: Arc<Subscription>) {
        match self.collection(kind).remove_subscription(&key, &sub) {
            RemoveOutcome::Busy => {
                let bus = Arc::clone(self);
                self.tasks
                    .defer(Box::new(move || bus.remove_subscription(kind, key, sub)));
            }
            RemoveOutcome::Removed { destroyed } => {
                if let Some(chan) = destroyed {
                    if kind != CollectionKind::Filters {
                        self.announce_channel_destroyed(&chan);
                    }
                }
            }
        }
    }

    fn announce_channel_created(&self, chan: &Arc<Channel>) {
        let Some(name) = chan.key.name() else { return };
        let matcher = chan.matcher.as_ref().map(|m| &m.name);
        for engine in self.engines.snapshot() {
            engine.subscribe(name, matcher.map(|m| m.as_ref()));
        }
        self.cluster.forward_subscribe(name, matcher);
    }

    fn announce_channel_destroyed(&self, chan: &Arc<Channel>) {
        let Some(name) = chan.key.name() else { return };
        let matcher = chan.matcher.as_ref().map(|m| &m.name);
        for engine in self.engines.snapshot() {
            engine.unsubscribe(name, matcher.map(|m| m.as_ref()));
        }
        self.cluster.forward_unsubscribe(name, matcher);
    }

    /// Registers a match function under a symbolic name. The name is what
    /// identifies the matcher across the cluster socket.
    pub fn register_matcher(
        &self,
        name: impl Into<Bytes>,
        func: impl Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.matchers.register(name.into(), Arc::new(func));
    }

    pub(crate) fn resolve_matcher(&self, name: &Bytes) -> Option<Arc<MatcherFn>> {
        self.matchers.get(name)
    }

    // ---- publishing ----

    /// Publishes raw bytes on a named channel.
    pub fn publish(
        self: &Arc<Self>,
        scope: Scope,
        channel: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let msg = Message::new(0, channel.into(), payload.into(), Encoding::Forward);
        self.publish_scoped(scope, msg)
    }

    /// Publishes structured values; both channel and payload are rendered to
    /// canonical JSON text once, before any fan-out. A string channel keeps
    /// its raw content so exact and pattern matching behave as for bytes.
    pub fn publish_json(
        self: &Arc<Self>,
        scope: Scope,
        channel: &serde_json::Value,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let channel = match channel {
            serde_json::Value::String(name) => Bytes::from(name.clone().into_bytes()),
            other => Bytes::from(serde_json::to_vec(other)?),
        };
        let payload = Bytes::from(serde_json::to_vec(payload)?);
        let msg = Message::new(0, channel, payload, Encoding::Json);
        self.publish_scoped(scope, msg)
    }

    /// Publishes on a numeric filter. Filters are confined to this process
    /// whatever the scope says: no engines, no metadata, no cluster traffic.
    pub fn publish_filter(
        self: &Arc<Self>,
        scope: Scope,
        filter: i32,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        if filter == 0 {
            return Err(Error::InvalidPublish("filter must be non-zero"));
        }
        let msg = Message::new(filter, Bytes::new(), payload.into(), Encoding::Forward);
        self.publish_scoped(scope, msg)
    }

    fn publish_scoped(self: &Arc<Self>, scope: Scope, msg: Message) -> Result<()> {
        match &scope {
            Scope::Engine(engine) => {
                if msg.filter != 0 {
                    error!("engine publish rejected: filters never reach engines");
                    return Err(Error::EngineFilter);
                }
                return engine.publish(&msg.channel, &msg.payload, msg.encoding);
            }
            Scope::Default => {
                return match self.engines.default_engine() {
                    Some(engine) => self.publish_scoped(Scope::Engine(engine), msg),
                    None => self.publish_scoped(Scope::Cluster, msg),
                };
            }
            _ => {}
        }

        if msg.filter != 0 {
            // Filters never leave the process; a siblings-only publish has
            // nowhere to go at all.
            if matches!(scope, Scope::Siblings) {
                log::warn!("filter publish dropped: filters never leave the process");
                return Ok(());
            }
            self.dispatch_filter(msg);
            return Ok(());
        }

        let is_worker = self.cluster.is_worker();
        let (remote, local) = match scope {
            Scope::Cluster => (Some(RemoteScope::Cluster), true),
            Scope::Process => (None, true),
            Scope::Siblings => (Some(RemoteScope::Siblings), false),
            Scope::Root => (is_worker.then_some(RemoteScope::Root), !is_worker),
            Scope::Default | Scope::Engine(_) => unreachable!("handled above"),
        };
        if let Some(remote) = remote {
            self.cluster.send_publish(&msg, remote)?;
        }
        if local {
            self.dispatch_pubsub(msg);
        }
        Ok(())
    }

    /// Local fan-out for the pub/sub namespace: metadata producers first,
    /// then exact subscribers in list order, then pattern subscribers.
    pub(crate) fn dispatch_pubsub(self: &Arc<Self>, mut msg: Message) {
        self.metadata.apply(&mut msg);
        let msg = Arc::new(msg);
        let exact = self
            .pubsub
            .get(&ChannelKey::Name(msg.channel.clone()))
            .map(|chan| chan.subscriber_snapshot())
            .unwrap_or_default();
        for sub in exact {
            self.schedule(sub, Arc::clone(&msg));
        }
        for chan in self.patterns.snapshot() {
            let Some(matcher) = chan.matcher.as_ref() else { continue };
            let Some(pattern) = chan.key.name() else { continue };
            if (matcher.func)(pattern, &msg.channel) {
                for sub in chan.subscriber_snapshot() {
                    self.schedule(sub, Arc::clone(&msg));
                }
            }
        }
    }

    /// Entry point for frames arriving over a cluster link.
    pub(crate) fn dispatch_inbound(self: &Arc<Self>, msg: Message) {
        if msg.filter != 0 {
            self.dispatch_filter(msg);
        } else {
            self.dispatch_pubsub(msg);
        }
    }

    /// `(channel, matcher name)` for every live pub/sub and pattern channel;
    /// what a worker announces upstream when its link comes up.
    pub(crate) fn replay_snapshot(&self) -> Vec<(Bytes, Option<Bytes>)> {
        let mut out = Vec::new();
        for chan in self.pubsub.snapshot() {
            if let Some(name) = chan.key.name() {
                out.push((name.clone(), None));
            }
        }
        for chan in self.patterns.snapshot() {
            if let Some(name) = chan.key.name() {
                out.push((name.clone(), chan.matcher.as_ref().map(|m| m.name.clone())));
            }
        }
        out
    }

    fn dispatch_filter(self: &Arc<Self>, msg: Message) {
        let msg = Arc::new(msg);
        let subs = self
            .filters
            .get(&ChannelKey::Filter(msg.filter))
            .map(|chan| chan.subscriber_snapshot())
            .unwrap_or_default();
        for sub in subs {
            self.schedule(sub, Arc::clone(&msg));
        }
    }

    fn schedule(self: &Arc<Self>, sub: Arc<Subscription>, msg: Arc<Message>) {
        let bus = Arc::clone(self);
        self.tasks.defer(Box::new(move || bus.deliver(sub, msg)));
    }

    fn deliver(self: &Arc<Self>, sub: Arc<Subscription>, msg: Arc<Message>) {
        let mut would_block = false;
        let redeliver = 'locked: {
            let guard = match sub.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    // Another delivery for this subscription is running; retry
                    // after it finishes instead of blocking a pool thread.
                    would_block = true;
                    break 'locked false;
                }
            };
            let view = MessageView::new(&msg, sub.udata1.as_ref(), sub.udata2.as_ref());
            (sub.callback)(&view);
            let redeliver = view.take_deferred();
            drop(view);
            drop(guard);
            redeliver
        };
        if would_block || redeliver {
            self.schedule(sub, msg);
        }
    }

    // ---- engines ----

    pub fn attach_engine(&self, engine: Arc<dyn Engine>) {
        if !self.engines.attach(&engine) {
            return;
        }
        engine.on_startup();
        self.replay_channels(&engine);
    }

    pub fn detach_engine(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.detach(engine)
    }

    /// Replays every current pub/sub and pattern channel to an engine that
    /// asked for a refresh (e.g. after reconnecting to its broker).
    pub fn reattach_engine(&self, engine: &Arc<dyn Engine>) {
        if !self.engines.is_attached(engine) {
            log::debug!("reattach of an engine that was never attached");
        }
        self.replay_channels(engine);
    }

    pub fn engine_is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.is_attached(engine)
    }

    /// Routes `Scope::Default` publishes through `engine` instead of the
    /// built-in cluster scope; `None` restores the built-in.
    pub fn set_default_engine(&self, engine: Option<Arc<dyn Engine>>) {
        self.engines.set_default(engine);
    }

    fn replay_channels(&self, engine: &Arc<dyn Engine>) {
        for chan in self.pubsub.snapshot() {
            if let Some(name) = chan.key.name() {
                engine.subscribe(name, None);
            }
        }
        for chan in self.patterns.snapshot() {
            if let Some(name) = chan.key.name() {
                engine.subscribe(name, chan.matcher.as_ref().map(|m| m.name.as_ref()));
            }
        }
    }

    // ---- metadata ----

    /// Registers (or replaces) the metadata producer for `type_id`. The
    /// producer runs once per pub/sub publish, before any subscriber is
    /// scheduled.
    pub fn set_metadata_producer(&self, type_id: u64, producer: ProducerFn) {
        self.metadata.set(type_id, producer);
    }

    pub fn clear_metadata_producer(&self, type_id: u64) -> bool {
        self.metadata.clear(type_id)
    }

    // ---- introspection ----

    pub fn active_channels(&self) -> Vec<Bytes> {
        self.pubsub
            .snapshot()
            .into_iter()
            .filter_map(|chan| chan.key.name().cloned())
            .collect()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn subscriber_count(&self, channel: impl Into<Bytes>) -> usize {
        self.pubsub
            .get(&ChannelKey::Name(channel.into()))
            .map(|chan| chan.subscriber_snapshot().len())
            .unwrap_or(0)
    }

    // ---- lifecycle / cluster ----

    /// Runs queued deliveries on the calling thread until the queue is empty.
    pub fn perform_all(&self) {
        self.tasks.perform_all();
    }

    /// Registers a hook to run in a worker whose upstream link dies without
    /// a prior shutdown frame.
    pub fn on_parent_crash(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock_unpoisoned(&self.parent_crash_hooks).push(Arc::new(hook));
    }

    pub(crate) fn run_parent_crash_hooks(&self) {
        let hooks: Vec<_> = lock_unpoisoned(&self.parent_crash_hooks).clone();
        for hook in hooks {
            hook();
        }
    }

    /// Binds the cluster listener at the conventional per-pid socket path
    /// under `TMPDIR` (falling back to `/tmp`). Must run in the root, before
    /// any fork.
    pub fn listen_root(self: &Arc<Self>) -> Result<PathBuf> {
        self.cluster.listen_root(self)
    }

    /// Binds the cluster listener at an explicit path instead of the
    /// per-pid default.
    pub fn listen_root_at(self: &Arc<Self>, path: impl Into<PathBuf>) -> Result<PathBuf> {
        self.cluster.listen_root_at(self, path.into())
    }

    /// Connects this process to the root's listener and replays its live
    /// channels upstream.
    pub fn connect_worker(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<()> {
        self.cluster.connect_worker(self, path.as_ref())
    }

    /// Broadcasts a shutdown frame to every connected worker.
    pub fn signal_children(&self) {
        self.cluster.signal_children();
    }

    pub fn cluster_socket_path(&self) -> Option<PathBuf> {
        self.cluster.socket_path()
    }

    /// Post-fork reinitialization for the child process: worker threads are
    /// respawned, inherited cluster state is dropped, the tables are
    /// compacted, and the child connects upstream as a worker.
    pub fn after_fork_child(self: &Arc<Self>) -> Result<()> {
        self.tasks.reset_after_fork(self.worker_threads);
        self.filters.compact();
        self.pubsub.compact();
        self.patterns.compact();
        self.cluster.reconnect_child(self)
    }

    /// Orderly teardown: drain the task queue, close cluster links (workers
    /// are signalled first when this process is the root), unlink the socket.
    pub fn shutdown(self: &Arc<Self>) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cluster.shutdown();
        self.tasks.shutdown();
    }
}
