//! In-process publish/subscribe bus with transparent multi-process fan-out.
//!
//! A single root process binds a local-domain socket before forking its
//! workers; every process then shares one pub/sub namespace, so a publish
//! anywhere reaches every matching subscriber in the cluster. Numeric
//! *filter* channels stay confined to their own process. Pluggable engines
//! mirror channel creation/destruction into external brokers, and metadata
//! producers attach per-message side data once for all subscribers to share.

pub mod bus;
pub mod channel;
mod cluster;
mod collection;
pub mod engine;
pub mod error;
pub mod frame;
pub mod glob;
pub mod message;
pub mod metadata;
mod task;

use std::sync::{Arc, OnceLock};

pub use bus::{Postoffice, PostofficeConfig, Scope, SubscribeOptions, GLOB_MATCHER};
pub use channel::{ChannelKey, SubscriptionHandle};
pub use engine::Engine;
pub use error::{Error, Result};
pub use frame::{Frame, FrameKind, FrameParser};
pub use glob::glob_match;
pub use message::{AnyData, Encoding, Message, MessageView, MetadataNode};
pub use metadata::ProducerFn;

/// The process-wide bus, built with the default configuration on first use.
pub fn global() -> &'static Arc<Postoffice> {
    static GLOBAL: OnceLock<Arc<Postoffice>> = OnceLock::new();
    GLOBAL.get_or_init(Postoffice::new)
}
