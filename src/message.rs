//! Message envelope and per-delivery view.
//!
//! One [`Message`] is built per publish, normalized exactly once, and shared
//! by reference across every scheduled delivery and the cluster write path.
//! Each delivery observes it through a [`MessageView`] that substitutes the
//! subscription's user-data slots.

use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

/// How a message's channel and payload were normalized at publish time.
///
/// `Forward` carries the publisher's bytes untouched; `Json` means both were
/// rendered to canonical JSON text once, before any fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Forward,
    Json,
}

/// Opaque user data carried through the bus untouched.
pub type AnyData = Arc<dyn Any + Send + Sync>;

/// Side data attached to a message by a metadata producer, built once per
/// publish and shared by every subscriber. Dropped with the envelope.
pub struct MetadataNode {
    pub type_id: u64,
    pub data: AnyData,
}

pub struct Message {
    pub(crate) channel: Bytes,
    pub(crate) payload: Bytes,
    pub(crate) filter: i32,
    pub(crate) encoding: Encoding,
    pub(crate) metadata: Vec<MetadataNode>,
}

impl Message {
    pub(crate) fn new(filter: i32, channel: Bytes, payload: Bytes, encoding: Encoding) -> Self {
        Self {
            channel,
            payload,
            filter,
            encoding,
            metadata: Vec::new(),
        }
    }

    pub fn channel(&self) -> &Bytes {
        &self.channel
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn filter(&self) -> i32 {
        self.filter
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

/// The shape a subscription callback receives: the shared envelope plus the
/// subscription's own `udata` slots.
pub struct MessageView<'a> {
    message: &'a Message,
    udata1: Option<&'a AnyData>,
    udata2: Option<&'a AnyData>,
    deferred: Cell<bool>,
}

impl<'a> MessageView<'a> {
    pub(crate) fn new(
        message: &'a Message,
        udata1: Option<&'a AnyData>,
        udata2: Option<&'a AnyData>,
    ) -> Self {
        Self {
            message,
            udata1,
            udata2,
            deferred: Cell::new(false),
        }
    }

    pub fn channel(&self) -> &[u8] {
        &self.message.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn filter(&self) -> i32 {
        self.message.filter
    }

    pub fn encoding(&self) -> Encoding {
        self.message.encoding
    }

    /// Parses the payload as JSON. For `Encoding::Json` messages this undoes
    /// the publish-time normalization.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.message.payload)?)
    }

    pub fn udata1(&self) -> Option<&AnyData> {
        self.udata1
    }

    pub fn udata2(&self) -> Option<&AnyData> {
        self.udata2
    }

    /// First metadata node registered under `type_id`, if a producer built
    /// one for this message.
    pub fn metadata(&self, type_id: u64) -> Option<&AnyData> {
        self.message
            .metadata
            .iter()
            .find(|node| node.type_id == type_id)
            .map(|node| &node.data)
    }

    /// Asks the bus to deliver this message to the same subscription again.
    /// The redelivery is scheduled after the current callback returns.
    pub fn defer(&self) {
        self.deferred.set(true);
    }

    pub(crate) fn take_deferred(&self) -> bool {
        self.deferred.replace(false)
    }
}
