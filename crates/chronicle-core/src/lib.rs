//! Core types, validation, and shared utilities for the Chronicle analytics pipeline.
//!
//! This crate provides:
//! - Record types for every buffered fact (messages, mentions, voice, emoji, invites)
//! - The voice state-flags bitmask codec
//! - Display-name privacy (AES-256-GCM with keyed-hash fallback)
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod flags;
pub mod metrics;
pub mod privacy;
mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// How often the flusher drains every batch lane.
pub const FLUSH_INTERVAL_SECS: u64 = 30;

/// Enqueue count at which a lane triggers an immediate out-of-band flush.
pub const MAX_BATCH_SIZE: usize = 1000;

pub use error::{Error, Result};
pub use record::{
    BufferedRecord, EmojiUsageRecord, EmojiUsageType, EventRecord, InviteEvent, InviteType,
    MemberEvent, MemberEventKind, MentionRecord, MessageEditRecord, MessageRecord, RecordKind,
    VoiceSessionRecord, VoiceTimeAggregate,
};
