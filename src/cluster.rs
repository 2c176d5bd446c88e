//! Cluster topology: one root process listening on a local-domain socket,
//! workers connected to it.
//!
//! The root fans every pub/sub frame out to its other children and delivers
//! it locally; workers forward their subscribe/unsubscribe intent upstream
//! so the root's bookkeeping (and through it, any attached engine) sees the
//! cluster-wide channel set. Frames are written whole under the link's write
//! lock, so ordering per link is the stream's ordering.
//!
//! A worker whose upstream link dies without a prior shutdown frame treats
//! that as a parent crash: registered hooks run, the stale socket file is
//! removed, and the process raises SIGINT (suppressed for in-process
//! topologies, e.g. under test).

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, warn};

use crate::bus::{Postoffice, SubscribeOptions, GLOB_MATCHER};
use crate::channel::SubscriptionHandle;
use crate::frame::{Frame, FrameKind, FrameParser};
use crate::message::{Encoding, Message};
use crate::task::lock_unpoisoned;
use crate::{Error, Result};

/// Remote leg of a publish, as decided by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteScope {
    /// Peers and local: the frame goes out as FORWARD/JSON.
    Cluster,
    /// Peers only.
    Siblings,
    /// Upstream only, marked for root-local delivery.
    Root,
}

/// Which end of a link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkSide {
    /// This process is the root; the peer is a worker.
    RootEnd,
    /// This process is a worker; the peer is the root.
    WorkerEnd,
}

pub(crate) struct Cluster {
    role: Mutex<Role>,
    keepalive: Duration,
    raise_signals: bool,
    // Set by the root before fork; the child reuses it to reconnect.
    path: Mutex<Option<PathBuf>>,
    link_ids: AtomicU64,
}

enum Role {
    Inactive,
    Root(RootState),
    Worker(WorkerState),
}

struct RootState {
    live: Arc<AtomicBool>,
    links: Arc<LinkSet>,
    accept: Option<JoinHandle<()>>,
}

struct WorkerState {
    link: Arc<Link>,
    // The reader detaches on drop; it exits once its stream closes.
    _reader: Option<JoinHandle<()>>,
}

struct LinkSet {
    links: Mutex<Vec<Arc<Link>>>,
}

impl LinkSet {
    fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, link: Arc<Link>) {
        lock_unpoisoned(&self.links).push(link);
    }

    fn remove(&self, id: u64) {
        lock_unpoisoned(&self.links).retain(|l| l.id != id);
    }

    fn snapshot(&self) -> Vec<Arc<Link>> {
        lock_unpoisoned(&self.links).clone()
    }
}

struct Link {
    id: u64,
    writer: Mutex<UnixStream>,
    // Mock subscriptions the root installed on this worker's behalf,
    // keyed by (channel, is_pattern).
    mocks: Mutex<HashMap<(Bytes, bool), SubscriptionHandle>>,
    peer_shutdown: AtomicBool,
    closed_locally: AtomicBool,
}

impl Link {
    fn new(id: u64, writer: UnixStream) -> Arc<Self> {
        Arc::new(Self {
            id,
            writer: Mutex::new(writer),
            mocks: Mutex::new(HashMap::new()),
            peer_shutdown: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
        })
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let wire = frame.encode()?;
        self.send_bytes(&wire)
    }

    fn send_bytes(&self, wire: &[u8]) -> Result<()> {
        let mut writer = lock_unpoisoned(&self.writer);
        writer.write_all(wire)?;
        Ok(())
    }

    /// Closes both directions; the reader thread sees EOF and exits.
    fn close(&self) {
        self.closed_locally.store(true, Ordering::SeqCst);
        let writer = lock_unpoisoned(&self.writer);
        let _ = writer.shutdown(std::net::Shutdown::Both);
    }
}

fn cluster_socket_path() -> PathBuf {
    let dir = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    dir.join(format!("postoffice-sock-{:o}", std::process::id()))
}

fn forward_kind(encoding: Encoding, root_scoped: bool) -> FrameKind {
    match (encoding, root_scoped) {
        (Encoding::Forward, false) => FrameKind::Forward,
        (Encoding::Json, false) => FrameKind::Json,
        (Encoding::Forward, true) => FrameKind::Root,
        (Encoding::Json, true) => FrameKind::RootJson,
    }
}

fn frame_encoding(kind: FrameKind) -> Encoding {
    match kind {
        FrameKind::Json | FrameKind::RootJson => Encoding::Json,
        _ => Encoding::Forward,
    }
}

fn inbound_message(frame: &Frame) -> Message {
    Message::new(
        frame.filter,
        frame.channel.clone(),
        frame.payload.clone(),
        frame_encoding(frame.kind),
    )
}

impl Cluster {
    pub fn new(keepalive: Duration, raise_signals: bool) -> Self {
        Self {
            role: Mutex::new(Role::Inactive),
            keepalive,
            raise_signals,
            path: Mutex::new(None),
            link_ids: AtomicU64::new(1),
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(*lock_unpoisoned(&self.role), Role::Worker(_))
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        lock_unpoisoned(&self.path).clone()
    }

    /// Binds the cluster listener at the conventional per-pid path.
    pub fn listen_root(&self, bus: &Arc<Postoffice>) -> Result<PathBuf> {
        self.listen_root_at(bus, cluster_socket_path())
    }

    /// Binds the cluster listener and starts accepting workers. Runs in the
    /// root, before any fork.
    pub fn listen_root_at(&self, bus: &Arc<Postoffice>, path: PathBuf) -> Result<PathBuf> {
        let mut role = lock_unpoisoned(&self.role);
        if !matches!(*role, Role::Inactive) {
            return Err(Error::ClusterActive);
        }
        // A stale file from a previous incarnation would fail the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let live = Arc::new(AtomicBool::new(true));
        let links = Arc::new(LinkSet::new());
        let accept = {
            let bus = Arc::downgrade(bus);
            let live = Arc::clone(&live);
            let links = Arc::clone(&links);
            let raise_signals = self.raise_signals;
            std::thread::Builder::new()
                .name("postoffice-accept".into())
                .spawn(move || run_accept_loop(bus, listener, live, links, raise_signals))?
        };
        *role = Role::Root(RootState {
            live,
            links,
            accept: Some(accept),
        });
        drop(role);
        *lock_unpoisoned(&self.path) = Some(path.clone());
        debug!("cluster listening at {}", path.display());
        Ok(path)
    }

    /// Connects this process to the root at `path` and replays its live
    /// channels upstream.
    pub fn connect_worker(&self, bus: &Arc<Postoffice>, path: &Path) -> Result<()> {
        {
            let mut role = lock_unpoisoned(&self.role);
            if !matches!(*role, Role::Inactive) {
                return Err(Error::ClusterActive);
            }
            let stream = UnixStream::connect(path)?;
            let link = Link::new(self.next_link_id(), stream.try_clone()?);
            let reader = self.spawn_link_reader(bus, Arc::clone(&link), stream, LinkSide::WorkerEnd, None)?;
            *role = Role::Worker(WorkerState {
                link,
                _reader: Some(reader),
            });
        }
        *lock_unpoisoned(&self.path) = Some(path.to_path_buf());
        // Announce everything that was subscribed before the link came up.
        // The root tolerates duplicates, so racing with fresh subscribes
        // (which announce themselves) is harmless.
        for (channel, matcher) in bus.replay_snapshot() {
            self.forward_subscribe(&channel, matcher.as_ref());
        }
        debug!("cluster connected to {}", path.display());
        Ok(())
    }

    fn next_link_id(&self) -> u64 {
        self.link_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_link_reader(
        &self,
        bus: &Arc<Postoffice>,
        link: Arc<Link>,
        stream: UnixStream,
        side: LinkSide,
        links: Option<Arc<LinkSet>>,
    ) -> Result<JoinHandle<()>> {
        let bus = Arc::downgrade(bus);
        let keepalive = self.keepalive;
        let raise_signals = self.raise_signals;
        Ok(std::thread::Builder::new()
            .name(format!("postoffice-link-{}", link.id))
            .spawn(move || run_link(bus, link, stream, side, links, keepalive, raise_signals))?)
    }

    /// Sends the remote leg of a publish. `Cluster` without a running
    /// cluster is ordinary single-process operation; `Siblings` without one
    /// has nowhere to deliver at all and is reported.
    pub fn send_publish(&self, msg: &Message, scope: RemoteScope) -> Result<()> {
        let role = lock_unpoisoned(&self.role);
        match &*role {
            Role::Root(root) => {
                let frame = Frame::new(
                    forward_kind(msg.encoding, false),
                    msg.filter,
                    msg.channel.clone(),
                    msg.payload.clone(),
                );
                let wire = frame.encode()?;
                for link in root.links.snapshot() {
                    if let Err(err) = link.send_bytes(&wire) {
                        debug!("cluster fan-out to link {} failed: {err}", link.id);
                    }
                }
                Ok(())
            }
            Role::Worker(worker) => {
                let frame = Frame::new(
                    forward_kind(msg.encoding, scope == RemoteScope::Root),
                    msg.filter,
                    msg.channel.clone(),
                    msg.payload.clone(),
                );
                worker.link.send(&frame)
            }
            Role::Inactive => match scope {
                RemoteScope::Cluster => {
                    debug!("cluster publish without a cluster; local delivery only");
                    Ok(())
                }
                RemoteScope::Siblings => {
                    warn!("siblings publish dropped: cluster is not running");
                    Err(Error::ClusterInactive)
                }
                // Without a cluster this process is its own root; the
                // dispatcher already took the local leg.
                RemoteScope::Root => Ok(()),
            },
        }
    }

    /// A pub/sub or pattern channel gained its first local subscriber;
    /// workers tell the root.
    pub fn forward_subscribe(&self, channel: &Bytes, matcher: Option<&Bytes>) {
        self.forward_intent(channel, matcher, true);
    }

    /// The channel's last local subscriber left.
    pub fn forward_unsubscribe(&self, channel: &Bytes, matcher: Option<&Bytes>) {
        self.forward_intent(channel, matcher, false);
    }

    fn forward_intent(&self, channel: &Bytes, matcher: Option<&Bytes>, subscribe: bool) {
        let role = lock_unpoisoned(&self.role);
        let Role::Worker(worker) = &*role else { return };
        let (kind, payload) = match (matcher, subscribe) {
            (Some(name), true) => (FrameKind::PatternSub, name.clone()),
            (Some(name), false) => (FrameKind::PatternUnsub, name.clone()),
            (None, true) => (FrameKind::Sub, Bytes::new()),
            (None, false) => (FrameKind::Unsub, Bytes::new()),
        };
        let frame = Frame::new(kind, 0, channel.clone(), payload);
        if let Err(err) = worker.link.send(&frame) {
            debug!("cluster subscribe intent failed: {err}");
        }
    }

    /// Broadcasts a shutdown frame to every connected worker.
    pub fn signal_children(&self) {
        let role = lock_unpoisoned(&self.role);
        let Role::Root(root) = &*role else { return };
        let links = root.links.snapshot();
        drop(role);
        for link in links {
            if let Err(err) = link.send(&Frame::control(FrameKind::Shutdown)) {
                debug!("shutdown signal to link {} failed: {err}", link.id);
            }
        }
    }

    /// Tears down whatever role this process holds. The root signals its
    /// workers first and unlinks the socket file (exactly once).
    pub fn shutdown(&self) {
        let role = {
            let mut role = lock_unpoisoned(&self.role);
            std::mem::replace(&mut *role, Role::Inactive)
        };
        match role {
            Role::Inactive => {}
            Role::Root(mut root) => {
                for link in root.links.snapshot() {
                    let _ = link.send(&Frame::control(FrameKind::Shutdown));
                    link.close();
                }
                root.live.store(false, Ordering::SeqCst);
                if let Some(accept) = root.accept.take() {
                    let _ = accept.join();
                }
                if let Some(path) = lock_unpoisoned(&self.path).take() {
                    let _ = std::fs::remove_file(path);
                }
            }
            Role::Worker(worker) => {
                let _ = worker.link.send(&Frame::control(FrameKind::Shutdown));
                worker.link.close();
            }
        }
    }

    /// Post-fork, in the child: inherited cluster state (the parent's
    /// listener, its links) is dropped without signaling anyone, and the
    /// child connects upstream as a worker.
    pub fn reconnect_child(&self, bus: &Arc<Postoffice>) -> Result<()> {
        {
            let mut role = lock_unpoisoned(&self.role);
            // Reader/accept threads did not survive the fork; dropping the
            // state only closes this process's copies of the descriptors.
            *role = Role::Inactive;
        }
        let path = lock_unpoisoned(&self.path)
            .clone()
            .ok_or(Error::ClusterInactive)?;
        *lock_unpoisoned(&self.path) = None;
        self.connect_worker(bus, &path)
    }

    fn accept_link(bus: &Arc<Postoffice>, links: &Arc<LinkSet>, stream: UnixStream) {
        if let Err(err) = stream.set_nonblocking(false) {
            debug!("cluster accept: {err}");
            return;
        }
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                debug!("cluster accept: {err}");
                return;
            }
        };
        let link = Link::new(bus.cluster.next_link_id(), writer);
        links.push(Arc::clone(&link));
        let spawned = bus.cluster.spawn_link_reader(
            bus,
            Arc::clone(&link),
            stream,
            LinkSide::RootEnd,
            Some(Arc::clone(links)),
        );
        match spawned {
            Ok(_reader) => debug!("cluster link {} accepted", link.id),
            Err(err) => {
                links.remove(link.id);
                error!("cluster link reader spawn failed: {err}");
            }
        }
    }
}

fn run_accept_loop(
    bus: Weak<Postoffice>,
    listener: UnixListener,
    live: Arc<AtomicBool>,
    links: Arc<LinkSet>,
    raise_signals: bool,
) {
    while live.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                let Some(bus) = bus.upgrade() else { break };
                Cluster::accept_link(&bus, &links, stream);
                // Tight loop: keep accepting while connections are pending.
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if bus.strong_count() == 0 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                if live.load(Ordering::Acquire) {
                    error!("cluster listener failed: {err}");
                    if raise_signals {
                        // The cluster cannot be rebuilt; take the process
                        // group down with the listener.
                        unsafe { libc::kill(0, libc::SIGTERM) };
                    }
                }
                break;
            }
        }
    }
}

fn run_link(
    bus: Weak<Postoffice>,
    link: Arc<Link>,
    mut stream: UnixStream,
    side: LinkSide,
    links: Option<Arc<LinkSet>>,
    keepalive: Duration,
    raise_signals: bool,
) {
    let _ = stream.set_read_timeout(Some(keepalive));
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; 16 * 1024];

    'io: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                // Idle: keep the peer's crash detector fed.
                if link.send(&Frame::control(FrameKind::Ping)).is_err() {
                    break;
                }
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("cluster link {} read failed: {err}", link.id);
                break;
            }
        };
        let Some(bus) = bus.upgrade() else { break };
        let mut frames = Vec::new();
        if let Err(err) = parser.feed(&buf[..n], &mut |frame| frames.push(frame)) {
            // Framing violations are fatal for the whole process, not just
            // this link; the partial frame dies with it either way.
            error!("cluster link {}: fatal protocol violation: {err}", link.id);
            if raise_signals
                && matches!(err, Error::FrameOverflow { .. } | Error::FrameMalformed(_))
            {
                unsafe { libc::kill(0, libc::SIGTERM) };
            }
            break;
        }
        for frame in frames {
            if !handle_frame(&bus, &link, side, links.as_ref(), frame) {
                break 'io;
            }
        }
    }

    match side {
        LinkSide::RootEnd => {
            if let (Some(bus), Some(links)) = (bus.upgrade(), links) {
                root_link_closed(&bus, &links, &link);
            }
        }
        LinkSide::WorkerEnd => worker_link_closed(bus, &link, raise_signals),
    }
}

/// Returns whether the link should keep running.
fn handle_frame(
    bus: &Arc<Postoffice>,
    link: &Arc<Link>,
    side: LinkSide,
    links: Option<&Arc<LinkSet>>,
    frame: Frame,
) -> bool {
    match (side, frame.kind) {
        // Root: pub/sub traffic from one worker goes to every other worker
        // verbatim, and to this process's own subscribers.
        (LinkSide::RootEnd, FrameKind::Forward | FrameKind::Json) => {
            if let Some(links) = links {
                match frame.encode() {
                    Ok(wire) => {
                        for other in links.snapshot() {
                            if other.id == link.id {
                                continue;
                            }
                            if let Err(err) = other.send_bytes(&wire) {
                                debug!("cluster fan-out to link {} failed: {err}", other.id);
                            }
                        }
                    }
                    Err(err) => debug!("cluster re-encode failed: {err}"),
                }
            }
            bus.dispatch_inbound(inbound_message(&frame));
            true
        }
        // Root-scoped traffic is for this process only.
        (LinkSide::RootEnd, FrameKind::Root | FrameKind::RootJson) => {
            bus.dispatch_inbound(inbound_message(&frame));
            true
        }
        (LinkSide::RootEnd, FrameKind::Sub) => {
            install_mock(bus, link, frame, false);
            true
        }
        (LinkSide::RootEnd, FrameKind::PatternSub) => {
            install_mock(bus, link, frame, true);
            true
        }
        (LinkSide::RootEnd, FrameKind::Unsub) => {
            remove_mock(bus, link, &frame, false);
            true
        }
        (LinkSide::RootEnd, FrameKind::PatternUnsub) => {
            remove_mock(bus, link, &frame, true);
            true
        }
        (LinkSide::WorkerEnd, FrameKind::Forward | FrameKind::Json) => {
            bus.dispatch_inbound(inbound_message(&frame));
            true
        }
        (_, FrameKind::Shutdown) => {
            link.peer_shutdown.store(true, Ordering::SeqCst);
            false
        }
        (_, FrameKind::Ping) => true,
        (_, FrameKind::Error) => {
            debug!("cluster link {}: error frame ignored", link.id);
            true
        }
        // Everything else is not addressed to this side.
        _ => true,
    }
}

/// Installs a do-nothing subscription on a worker's behalf, so the root's
/// own bookkeeping creates the channel and notifies engines.
fn install_mock(bus: &Arc<Postoffice>, link: &Arc<Link>, frame: Frame, pattern: bool) {
    let key = (frame.channel.clone(), pattern);
    if lock_unpoisoned(&link.mocks).contains_key(&key) {
        return;
    }
    let options = if pattern {
        let mut matcher = if frame.payload.is_empty() {
            Bytes::from_static(GLOB_MATCHER)
        } else {
            frame.payload.clone()
        };
        if bus.resolve_matcher(&matcher).is_none() {
            warn!(
                "cluster link {}: unknown matcher {:?}; using glob",
                link.id,
                String::from_utf8_lossy(&matcher)
            );
            matcher = Bytes::from_static(GLOB_MATCHER);
        }
        SubscribeOptions::pattern(frame.channel.clone()).matcher(matcher)
    } else {
        SubscribeOptions::channel(frame.channel.clone())
    };
    match bus.subscribe(options.callback(|_| {})) {
        Ok(handle) => {
            lock_unpoisoned(&link.mocks).insert(key, handle);
        }
        Err(err) => warn!("cluster link {}: mock subscription failed: {err}", link.id),
    }
}

fn remove_mock(bus: &Arc<Postoffice>, link: &Arc<Link>, frame: &Frame, pattern: bool) {
    let key = (frame.channel.clone(), pattern);
    let handle = lock_unpoisoned(&link.mocks).remove(&key);
    if let Some(handle) = handle {
        bus.unsubscribe(handle);
    }
}

fn root_link_closed(bus: &Arc<Postoffice>, links: &Arc<LinkSet>, link: &Arc<Link>) {
    links.remove(link.id);
    let mocks: Vec<SubscriptionHandle> = {
        let mut map = lock_unpoisoned(&link.mocks);
        map.drain().map(|(_, handle)| handle).collect()
    };
    for handle in mocks {
        bus.unsubscribe(handle);
    }
    debug!("cluster link {} closed", link.id);
}

fn worker_link_closed(bus: Weak<Postoffice>, link: &Arc<Link>, raise_signals: bool) {
    if link.closed_locally.load(Ordering::SeqCst) {
        return;
    }
    let clean = link.peer_shutdown.load(Ordering::SeqCst);
    if let Some(bus) = bus.upgrade() {
        {
            let mut role = lock_unpoisoned(&bus.cluster.role);
            if matches!(*role, Role::Worker(_)) {
                *role = Role::Inactive;
            }
        }
        if !clean {
            warn!("cluster root vanished without shutdown");
            bus.run_parent_crash_hooks();
            // The root is gone; nobody else will unlink its socket.
            if let Some(path) = bus.cluster.socket_path() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
    if raise_signals {
        unsafe { libc::raise(libc::SIGINT) };
    }
}
