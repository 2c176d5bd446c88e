//! Metadata producer registry.
//!
//! Producers run once per pub/sub publish, before any subscriber is
//! scheduled, and attach side data (a pre-parsed header, a serialized form)
//! to the envelope for every subscriber to share. The producer list is
//! snapshotted under its lock and invoked outside it, so producers may take
//! their time without blocking registration.

use std::sync::{Arc, Mutex};

use crate::message::{AnyData, Message, MetadataNode};
use crate::task::lock_unpoisoned;

pub type ProducerFn = Arc<dyn Fn(&Message) -> Option<AnyData> + Send + Sync>;

struct Producer {
    type_id: u64,
    build: ProducerFn,
}

pub(crate) struct MetadataRegistry {
    producers: Mutex<Vec<Producer>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self {
            producers: Mutex::new(Vec::new()),
        }
    }

    /// Registers (or replaces) the producer for `type_id`.
    pub fn set(&self, type_id: u64, build: ProducerFn) {
        let mut producers = lock_unpoisoned(&self.producers);
        match producers.iter_mut().find(|p| p.type_id == type_id) {
            Some(existing) => existing.build = build,
            None => producers.push(Producer { type_id, build }),
        }
    }

    /// Removes the producer for `type_id`; returns whether one was present.
    pub fn clear(&self, type_id: u64) -> bool {
        let mut producers = lock_unpoisoned(&self.producers);
        let before = producers.len();
        producers.retain(|p| p.type_id != type_id);
        producers.len() != before
    }

    /// Runs every producer against `msg`, appending the nodes they build.
    pub fn apply(&self, msg: &mut Message) {
        let snapshot: Vec<(u64, ProducerFn)> = lock_unpoisoned(&self.producers)
            .iter()
            .map(|p| (p.type_id, Arc::clone(&p.build)))
            .collect();
        for (type_id, build) in snapshot {
            if let Some(data) = build(msg) {
                msg.metadata.push(MetadataNode { type_id, data });
            }
        }
    }
}
