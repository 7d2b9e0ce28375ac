//! Chronicle ingestion pipeline.
//!
//! Event flow: the platform gateway hands events to the [`IngestGateway`],
//! which validates, rate limits, and journals them into the [`EventBuffer`].
//! The [`BatchFlusher`] drains buffer lanes on a timer (or when a lane fills)
//! and applies them to the [`PersistentStore`], which deduplicates via unique
//! constraints. The [`ConnectionSupervisor`] watches both storage media and
//! the [`VoiceSessionTracker`] turns voice state updates into session rows
//! and time aggregates.

mod error;

pub mod buffer;
pub mod flusher;
pub mod ingress;
pub mod journal;
pub mod ratelimit;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod voice;

pub use buffer::EventBuffer;
pub use error::{Error, Result};
pub use flusher::{BatchFlusher, DirectWriteFallback, RecordApplier, SnapshotReport};
pub use ingress::{IncomingMessage, IncomingVoiceState, IngestGateway};
pub use journal::Journal;
pub use ratelimit::{Action, RateLimiter};
pub use scheduler::{spawn_periodic, Shutdown, ShutdownHandle};
pub use store::PersistentStore;
pub use supervisor::{
    retry_with_backoff, BackoffConfig, ConnState, ConnectionSupervisor, MediaHealth,
};
pub use voice::VoiceSessionTracker;
