use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use postoffice::{
    Encoding, Engine, Postoffice, PostofficeConfig, Scope, SubscribeOptions,
};

/// A bus whose deliveries are driven explicitly through `perform_all`.
fn caller_driven_bus() -> Arc<Postoffice> {
    Postoffice::with_config(PostofficeConfig {
        worker_threads: 0,
        raise_signals: false,
        ..PostofficeConfig::default()
    })
}

fn threaded_bus(workers: usize) -> Arc<Postoffice> {
    Postoffice::with_config(PostofficeConfig {
        worker_threads: workers,
        raise_signals: false,
        ..PostofficeConfig::default()
    })
}

#[test]
fn publish_reaches_every_subscriber_on_the_channel() {
    let bus = caller_driven_bus();
    let hits = Arc::new(Mutex::new(Vec::new()));

    let a_hits = Arc::clone(&hits);
    let a = bus
        .subscribe(SubscribeOptions::channel("news").callback(move |msg| {
            assert_eq!(msg.channel(), b"news");
            assert_eq!(msg.payload(), b"hi");
            a_hits.lock().unwrap().push("a");
        }))
        .expect("subscribe a");

    let b_hits = Arc::clone(&hits);
    let b = bus
        .subscribe(SubscribeOptions::channel("news").callback(move |msg| {
            assert_eq!(msg.payload(), b"hi");
            b_hits.lock().unwrap().push("b");
        }))
        .expect("subscribe b");

    bus.publish(Scope::Cluster, "news", "hi").expect("publish");
    bus.perform_all();

    let seen = hits.lock().unwrap().clone();
    assert_eq!(seen, vec!["a", "b"]);

    bus.unsubscribe(a);
    bus.unsubscribe(b);
}

#[test]
fn pattern_subscriber_sees_only_matching_channels() {
    let bus = caller_driven_bus();
    let count = Arc::new(AtomicUsize::new(0));

    let cb_count = Arc::clone(&count);
    let sub = bus
        .subscribe(SubscribeOptions::pattern("ch.*").callback(move |msg| {
            assert_eq!(msg.channel(), b"ch.42");
            cb_count.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("subscribe pattern");

    bus.publish(Scope::Process, "ch.42", "x").expect("publish");
    bus.perform_all();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.publish(Scope::Process, "other", "x").expect("publish");
    bus.perform_all();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.unsubscribe(sub);
}

#[test]
fn exact_subscribers_are_scheduled_before_pattern_subscribers() {
    let bus = caller_driven_bus();
    let order = Arc::new(Mutex::new(Vec::new()));

    let pattern_order = Arc::clone(&order);
    let pattern = bus
        .subscribe(SubscribeOptions::pattern("top*").callback(move |_| {
            pattern_order.lock().unwrap().push("pattern");
        }))
        .expect("subscribe pattern");

    let exact_order = Arc::clone(&order);
    let exact = bus
        .subscribe(SubscribeOptions::channel("topic").callback(move |_| {
            exact_order.lock().unwrap().push("exact");
        }))
        .expect("subscribe exact");

    bus.publish(Scope::Process, "topic", "m").expect("publish");
    bus.perform_all();
    assert_eq!(*order.lock().unwrap(), vec!["exact", "pattern"]);

    bus.unsubscribe(pattern);
    bus.unsubscribe(exact);
}

#[test]
fn filters_and_names_are_disjoint_namespaces() {
    let bus = caller_driven_bus();
    let filter_hits = Arc::new(AtomicUsize::new(0));
    let name_hits = Arc::new(AtomicUsize::new(0));

    let cb_filter = Arc::clone(&filter_hits);
    let on_filter = bus
        .subscribe(SubscribeOptions::filter(7).callback(move |msg| {
            assert_eq!(msg.filter(), 7);
            assert_eq!(msg.payload(), b"p");
            cb_filter.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("subscribe filter");

    let cb_name = Arc::clone(&name_hits);
    let on_name = bus
        .subscribe(SubscribeOptions::channel("7").callback(move |msg| {
            assert_eq!(msg.filter(), 0);
            cb_name.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("subscribe name");

    bus.publish_filter(Scope::Process, 7, "p").expect("publish filter");
    bus.perform_all();
    assert_eq!(filter_hits.load(Ordering::SeqCst), 1);
    assert_eq!(name_hits.load(Ordering::SeqCst), 0);

    bus.publish(Scope::Process, "7", "p").expect("publish name");
    bus.perform_all();
    assert_eq!(filter_hits.load(Ordering::SeqCst), 1);
    assert_eq!(name_hits.load(Ordering::SeqCst), 1);

    bus.unsubscribe(on_filter);
    bus.unsubscribe(on_name);
}

#[test]
fn unsubscribe_fires_the_hook_exactly_once_after_in_flight_delivery() {
    let bus = caller_driven_bus();
    let delivered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    let cb_delivered = Arc::clone(&delivered);
    let hook_released = Arc::clone(&released);
    let sub = bus
        .subscribe(
            SubscribeOptions::channel("c")
                .callback(move |_| {
                    cb_delivered.fetch_add(1, Ordering::SeqCst);
                })
                .on_unsubscribe(move || {
                    hook_released.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .expect("subscribe");

    // The delivery is already scheduled when the unsubscribe lands; it may
    // still run, and the hook must fire only after it has.
    bus.publish(Scope::Process, "c", "m").expect("publish");
    bus.unsubscribe(sub);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    bus.perform_all();
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // Nothing further can fire it again.
    bus.publish(Scope::Process, "c", "m").expect("publish");
    bus.perform_all();
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn deferred_delivery_runs_the_callback_again() {
    let bus = caller_driven_bus();
    let runs = Arc::new(AtomicUsize::new(0));

    let cb_runs = Arc::clone(&runs);
    let sub = bus
        .subscribe(SubscribeOptions::channel("slow").callback(move |msg| {
            if cb_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                msg.defer();
            }
        }))
        .expect("subscribe");

    bus.publish(Scope::Process, "slow", "m").expect("publish");
    bus.perform_all();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    bus.unsubscribe(sub);
}

#[test]
fn udata_slots_are_per_subscription() {
    let bus = caller_driven_bus();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in ["first", "second"] {
        let seen = Arc::clone(&seen);
        let handle = bus
            .subscribe(
                SubscribeOptions::channel("c")
                    .udata1(Arc::new(tag))
                    .callback(move |msg| {
                        let tag = msg
                            .udata1()
                            .and_then(|v| v.downcast_ref::<&str>())
                            .copied()
                            .expect("udata1");
                        seen.lock().unwrap().push(tag);
                    }),
            )
            .expect("subscribe");
        handles.push(handle);
    }

    bus.publish(Scope::Process, "c", "m").expect("publish");
    bus.perform_all();
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

    for handle in handles {
        bus.unsubscribe(handle);
    }
}

#[test]
fn metadata_producer_runs_once_per_publish() {
    let bus = caller_driven_bus();
    let produced = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));

    let produced_in_producer = Arc::clone(&produced);
    bus.set_metadata_producer(
        42,
        Arc::new(move |msg| {
            produced_in_producer.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(msg.payload().len()))
        }),
    );

    let mut handles = Vec::new();
    for _ in 0..3 {
        let observed = Arc::clone(&observed);
        let handle = bus
            .subscribe(SubscribeOptions::channel("meta").callback(move |msg| {
                let len = msg
                    .metadata(42)
                    .and_then(|v| v.downcast_ref::<usize>())
                    .copied()
                    .expect("metadata node");
                assert_eq!(len, 5);
                observed.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("subscribe");
        handles.push(handle);
    }

    bus.publish(Scope::Process, "meta", "hello").expect("publish");
    bus.perform_all();
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(observed.load(Ordering::SeqCst), 3);

    assert!(bus.clear_metadata_producer(42));
    bus.publish(Scope::Process, "meta", "hello").expect("publish");
    bus.perform_all();
    assert_eq!(produced.load(Ordering::SeqCst), 1);

    for handle in handles {
        bus.unsubscribe(handle);
    }
}

#[test]
fn json_publish_round_trips_for_subscribers() {
    let bus = caller_driven_bus();
    let payload = serde_json::json!({"k": [1, 2, 3], "s": "v"});
    let seen = Arc::new(Mutex::new(None));

    let cb_seen = Arc::clone(&seen);
    let expected = payload.clone();
    let sub = bus
        .subscribe(SubscribeOptions::channel("jt").callback(move |msg| {
            assert_eq!(msg.encoding(), Encoding::Json);
            assert_eq!(msg.channel(), b"jt");
            let value = msg.payload_json().expect("payload parses");
            assert_eq!(value, expected);
            *cb_seen.lock().unwrap() = Some(value);
        }))
        .expect("subscribe");

    bus.publish_json(Scope::Process, &serde_json::json!("jt"), &payload)
        .expect("publish json");
    bus.perform_all();
    assert!(seen.lock().unwrap().is_some());

    bus.unsubscribe(sub);
}

struct RecordingEngine {
    events: Mutex<Vec<(String, Option<String>, bool)>>,
    published: Mutex<Vec<(Bytes, Bytes)>>,
}

impl RecordingEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, channel: &[u8], matcher: Option<&[u8]>, subscribe: bool) {
        self.events.lock().unwrap().push((
            String::from_utf8_lossy(channel).into_owned(),
            matcher.map(|m| String::from_utf8_lossy(m).into_owned()),
            subscribe,
        ));
    }
}

impl Engine for RecordingEngine {
    fn subscribe(&self, channel: &[u8], matcher: Option<&[u8]>) {
        self.record(channel, matcher, true);
    }
    fn unsubscribe(&self, channel: &[u8], matcher: Option<&[u8]>) {
        self.record(channel, matcher, false);
    }
    fn publish(&self, channel: &Bytes, payload: &Bytes, _encoding: Encoding) -> postoffice::Result<()> {
        self.published.lock().unwrap().push((channel.clone(), payload.clone()));
        Ok(())
    }
}

#[test]
fn engines_observe_channel_lifecycle_and_replay() {
    let bus = caller_driven_bus();

    // A channel that exists before the engine attaches is replayed to it.
    let early = bus
        .subscribe(SubscribeOptions::channel("early").callback(|_| {}))
        .expect("subscribe early");

    let engine = RecordingEngine::new();
    let as_engine: Arc<dyn Engine> = engine.clone();
    bus.attach_engine(Arc::clone(&as_engine));
    assert!(bus.engine_is_attached(&as_engine));
    assert_eq!(
        engine.events.lock().unwrap().as_slice(),
        &[("early".into(), None, true)]
    );

    // Creation and destruction emit exactly one notification each; the
    // second subscriber on the same channel emits nothing.
    let late_a = bus
        .subscribe(SubscribeOptions::pattern("ev.*").callback(|_| {}))
        .expect("subscribe pattern");
    let late_b = bus
        .subscribe(SubscribeOptions::pattern("ev.*").callback(|_| {}))
        .expect("subscribe pattern again");
    assert_eq!(engine.events.lock().unwrap().len(), 2);
    assert_eq!(
        engine.events.lock().unwrap()[1],
        ("ev.*".into(), Some("glob".into()), true)
    );

    bus.unsubscribe(late_a);
    bus.perform_all();
    assert_eq!(engine.events.lock().unwrap().len(), 2);
    bus.unsubscribe(late_b);
    bus.perform_all();
    assert_eq!(engine.events.lock().unwrap().len(), 3);
    assert_eq!(
        engine.events.lock().unwrap()[2],
        ("ev.*".into(), Some("glob".into()), false)
    );

    // Engine-scoped publishes bypass the built-in fan-out entirely.
    bus.publish(Scope::Engine(Arc::clone(&as_engine)), "early", "to-broker")
        .expect("engine publish");
    bus.perform_all();
    assert_eq!(
        engine.published.lock().unwrap().as_slice(),
        &[(Bytes::from_static(b"early"), Bytes::from_static(b"to-broker"))]
    );

    // Filters never reach engines.
    assert!(matches!(
        bus.publish_filter(Scope::Engine(Arc::clone(&as_engine)), 5, "p"),
        Err(postoffice::Error::EngineFilter)
    ));

    assert!(bus.detach_engine(&as_engine));
    bus.unsubscribe(early);
    bus.perform_all();
    assert_eq!(engine.events.lock().unwrap().len(), 3);
}

#[test]
fn one_subscription_never_runs_its_callback_concurrently() {
    let bus = threaded_bus(4);
    let in_callback = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel();

    let flag = Arc::clone(&in_callback);
    let overlap_count = Arc::clone(&overlaps);
    let run_count = Arc::clone(&runs);
    let sub = bus
        .subscribe(SubscribeOptions::channel("serial").callback(move |_| {
            if flag.swap(true, Ordering::SeqCst) {
                overlap_count.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(200));
            flag.store(false, Ordering::SeqCst);
            run_count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }))
        .expect("subscribe");

    const PUBLISHES: usize = 64;
    for n in 0..PUBLISHES {
        bus.publish(Scope::Process, "serial", format!("m{n}"))
            .expect("publish");
    }
    for _ in 0..PUBLISHES {
        rx.recv_timeout(Duration::from_secs(10)).expect("delivery");
    }
    assert_eq!(runs.load(Ordering::SeqCst), PUBLISHES);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    bus.unsubscribe(sub);
    bus.shutdown();
}

#[test]
fn introspection_reflects_live_channels() {
    let bus = caller_driven_bus();
    assert!(bus.active_channels().is_empty());
    assert_eq!(bus.pattern_count(), 0);

    let a = bus
        .subscribe(SubscribeOptions::channel("one").callback(|_| {}))
        .expect("subscribe");
    let b = bus
        .subscribe(SubscribeOptions::channel("one").callback(|_| {}))
        .expect("subscribe");
    let p = bus
        .subscribe(SubscribeOptions::pattern("o*").callback(|_| {}))
        .expect("subscribe");

    assert_eq!(bus.active_channels(), vec![Bytes::from_static(b"one")]);
    assert_eq!(bus.subscriber_count("one"), 2);
    assert_eq!(bus.pattern_count(), 1);

    bus.unsubscribe(a);
    bus.unsubscribe(b);
    bus.unsubscribe(p);
    bus.perform_all();
    assert!(bus.active_channels().is_empty());
    assert_eq!(bus.pattern_count(), 0);
}
