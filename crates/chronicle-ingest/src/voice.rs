//! Live voice session tracking.
//!
//! Keeps one in-memory session per (tenant, user) currently in a voice
//! channel. Every transition returns the records it produces; the gateway
//! enqueues them like any other event. Two record shapes come out of here:
//!
//! - [`VoiceSessionRecord`]: the closed session row, emitted on leave, on a
//!   channel move (the old channel's session closes), and at shutdown.
//! - [`VoiceTimeAggregate`]: incremental time deltas keyed by the state-flag
//!   combination, emitted whenever flags change, on close, and by the
//!   periodic sampler so long sessions show up in rankings before they end.
//!
//! Time always comes in as an argument (`*_at` methods) so the logic is
//! testable without waiting on wall clocks.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chronicle_core::flags::{state_category, VoiceAttributes};
use chronicle_core::{EventRecord, VoiceSessionRecord, VoiceTimeAggregate};
use parking_lot::Mutex;

/// Sampler period for in-flight sessions.
pub const SAMPLE_INTERVAL_SECS: u64 = 60;
/// A session younger than this is skipped by the sampler; the close will
/// cover it.
const MIN_SAMPLE_AGE_SECS: i64 = 30;
/// Sessions with no activity for this long are presumed orphaned (missed
/// leave event) and force-closed.
const STALE_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct ActiveSession {
    tenant_id: i64,
    user_id: i64,
    channel_id: i64,
    category_id: Option<i64>,
    display_name: String,
    join_time: DateTime<Utc>,
    attrs: VoiceAttributes,
    /// Start of the unaccounted time slice (advanced by samples and flag
    /// changes).
    last_sampled: DateTime<Utc>,
}

impl ActiveSession {
    /// Aggregate delta covering time since `last_sampled`, if any.
    fn drain_delta(&mut self, now: DateTime<Utc>) -> Option<EventRecord> {
        let seconds = (now - self.last_sampled).num_seconds();
        self.last_sampled = now;
        if seconds <= 0 {
            return None;
        }
        let flags = self.attrs.encode();
        Some(EventRecord::VoiceAggregate(VoiceTimeAggregate {
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            channel_id: self.channel_id,
            category_id: self.category_id,
            state_flags: flags,
            state_category: state_category(flags).to_string(),
            duration_seconds: seconds,
            last_updated: now,
        }))
    }

    fn close(mut self, now: DateTime<Utc>, out: &mut Vec<EventRecord>) {
        if let Some(delta) = self.drain_delta(now) {
            out.push(delta);
        }
        // An instant join/leave carries no voice time; emitting it would
        // also collide with the (tenant, user, join, leave) dedup key on a
        // repeat.
        if (now - self.join_time).num_seconds() <= 0 {
            return;
        }
        let flags = self.attrs.encode();
        out.push(EventRecord::VoiceSession(VoiceSessionRecord {
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            channel_id: self.channel_id,
            category_id: self.category_id,
            display_name: self.display_name,
            join_time: self.join_time,
            leave_time: now,
            duration_seconds: (now - self.join_time).num_seconds().max(0),
            state_flags: flags,
            afk: self.attrs.afk_channel,
            muted: self.attrs.is_muted(),
            deafened: self.attrs.is_deafened(),
            streaming: self.attrs.streaming,
        }));
    }
}

/// Tracks active voice sessions for every tenant.
pub struct VoiceSessionTracker {
    sessions: Mutex<HashMap<(i64, i64), ActiveSession>>,
}

impl VoiceSessionTracker {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// User joined a voice channel (or moved, if already tracked elsewhere).
    pub fn handle_join(
        &self,
        tenant_id: i64,
        user_id: i64,
        channel_id: i64,
        category_id: Option<i64>,
        display_name: String,
        attrs: VoiceAttributes,
        now: DateTime<Utc>,
    ) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.remove(&(tenant_id, user_id)) {
            if existing.channel_id == channel_id {
                // Duplicate join for the same channel; keep the original.
                sessions.insert((tenant_id, user_id), existing);
                return out;
            }
            // Channel move: close the old session first.
            metrics::counter!("voice_sessions_closed_total", "reason" => "move").increment(1);
            existing.close(now, &mut out);
        }

        sessions.insert(
            (tenant_id, user_id),
            ActiveSession {
                tenant_id,
                user_id,
                channel_id,
                category_id,
                display_name,
                join_time: now,
                attrs,
                last_sampled: now,
            },
        );
        metrics::gauge!("voice_active_sessions").set(sessions.len() as f64);
        out
    }

    /// User left voice entirely.
    pub fn handle_leave(
        &self,
        tenant_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.remove(&(tenant_id, user_id)) {
            metrics::counter!("voice_sessions_closed_total", "reason" => "leave").increment(1);
            session.close(now, &mut out);
        }
        metrics::gauge!("voice_active_sessions").set(sessions.len() as f64);
        out
    }

    /// Mute/deafen/stream flags changed without a channel change.
    ///
    /// Closes out the accumulated slice under the old flags so aggregate
    /// rows stay per-state, then continues under the new flags.
    pub fn handle_state(
        &self,
        tenant_id: i64,
        user_id: i64,
        attrs: VoiceAttributes,
        now: DateTime<Utc>,
    ) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&(tenant_id, user_id)) {
            if session.attrs.encode() == attrs.encode() {
                return out;
            }
            if let Some(delta) = session.drain_delta(now) {
                out.push(delta);
            }
            session.attrs = attrs;
        }
        out
    }

    /// Periodic sampler: emit aggregate deltas for long-running sessions.
    pub fn sample_at(&self, now: DateTime<Utc>) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            if (now - session.last_sampled).num_seconds() < MIN_SAMPLE_AGE_SECS {
                continue;
            }
            if let Some(delta) = session.drain_delta(now) {
                metrics::counter!("voice_samples_total").increment(1);
                out.push(delta);
            }
        }
        out
    }

    /// Force-close sessions that have seen no activity for too long.
    pub fn cleanup_stale_at(&self, now: DateTime<Utc>) -> Vec<EventRecord> {
        let cutoff = now - ChronoDuration::hours(STALE_AFTER_HOURS);
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();
        let stale: Vec<(i64, i64)> = sessions
            .iter()
            .filter(|(_, s)| s.last_sampled < cutoff)
            .map(|(&k, _)| k)
            .collect();
        for key in stale {
            if let Some(session) = sessions.remove(&key) {
                tracing::warn!(
                    tenant_id = key.0,
                    user_id = key.1,
                    "force-closing stale voice session"
                );
                metrics::counter!("voice_sessions_closed_total", "reason" => "stale")
                    .increment(1);
                session.close(now, &mut out);
            }
        }
        metrics::gauge!("voice_active_sessions").set(sessions.len() as f64);
        out
    }

    /// Close everything (shutdown): every active session gets a synthesized
    /// leave at `now`.
    pub fn close_all_at(&self, now: DateTime<Utc>) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut sessions = self.sessions.lock();
        for (_, session) in sessions.drain() {
            metrics::counter!("voice_sessions_closed_total", "reason" => "shutdown")
                .increment(1);
            session.close(now, &mut out);
        }
        metrics::gauge!("voice_active_sessions").set(0.0);
        out
    }
}

impl Default for VoiceSessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn quiet() -> VoiceAttributes {
        VoiceAttributes::default()
    }

    fn join(tracker: &VoiceSessionTracker, channel: i64, at: i64) -> Vec<EventRecord> {
        tracker.handle_join(1, 10, channel, Some(5), "hsh:aa".to_string(), quiet(), t(at))
    }

    fn sessions_in(records: &[EventRecord]) -> Vec<&VoiceSessionRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                EventRecord::VoiceSession(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn aggregates_in(records: &[EventRecord]) -> Vec<&VoiceTimeAggregate> {
        records
            .iter()
            .filter_map(|r| match r {
                EventRecord::VoiceAggregate(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_join_then_leave_emits_session_and_delta() {
        let tracker = VoiceSessionTracker::new();
        assert!(join(&tracker, 100, 0).is_empty());
        assert_eq!(tracker.active_count(), 1);

        let out = tracker.handle_leave(1, 10, t(90));
        assert_eq!(tracker.active_count(), 0);

        let sessions = sessions_in(&out);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration_seconds, 90);
        assert_eq!(sessions[0].channel_id, 100);

        let aggs = aggregates_in(&out);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].duration_seconds, 90);
        assert_eq!(aggs[0].state_category, "active");
    }

    #[test]
    fn test_instant_leave_emits_nothing() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);

        // Join and leave in the same second: no voice time accrued, so no
        // session row and no aggregate.
        let out = tracker.handle_leave(1, 10, t(0));
        assert!(out.is_empty());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_move_closes_old_session() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);
        let out = join(&tracker, 200, 60);

        let sessions = sessions_in(&out);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].channel_id, 100);
        assert_eq!(sessions[0].duration_seconds, 60);
        // Still tracked, now in the new channel.
        assert_eq!(tracker.active_count(), 1);

        let out = tracker.handle_leave(1, 10, t(100));
        assert_eq!(sessions_in(&out)[0].channel_id, 200);
        assert_eq!(sessions_in(&out)[0].duration_seconds, 40);
    }

    #[test]
    fn test_duplicate_join_is_ignored() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);
        let out = join(&tracker, 100, 30);
        assert!(out.is_empty());

        // Original join time retained.
        let out = tracker.handle_leave(1, 10, t(50));
        assert_eq!(sessions_in(&out)[0].duration_seconds, 50);
    }

    #[test]
    fn test_flag_change_splits_aggregates() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);

        let muted = VoiceAttributes {
            self_muted: true,
            ..VoiceAttributes::default()
        };
        let out = tracker.handle_state(1, 10, muted, t(60));
        let aggs = aggregates_in(&out);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].duration_seconds, 60);
        assert_eq!(aggs[0].state_category, "active");

        let out = tracker.handle_leave(1, 10, t(100));
        let aggs = aggregates_in(&out);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].duration_seconds, 40);
        assert_eq!(aggs[0].state_category, "muted");
        // The closed session carries the final flags.
        assert!(sessions_in(&out)[0].muted);
    }

    #[test]
    fn test_unchanged_flags_emit_nothing() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);
        assert!(tracker.handle_state(1, 10, quiet(), t(60)).is_empty());
    }

    #[test]
    fn test_sampler_skips_young_sessions() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);
        // Under the minimum age: nothing.
        assert!(tracker.sample_at(t(20)).is_empty());

        let out = tracker.sample_at(t(60));
        let aggs = aggregates_in(&out);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].duration_seconds, 60);

        // Sampled time is not double-counted at close.
        let out = tracker.handle_leave(1, 10, t(90));
        assert_eq!(aggregates_in(&out)[0].duration_seconds, 30);
        assert_eq!(sessions_in(&out)[0].duration_seconds, 90);
    }

    #[test]
    fn test_leave_without_session_is_noop() {
        let tracker = VoiceSessionTracker::new();
        assert!(tracker.handle_leave(1, 99, t(0)).is_empty());
    }

    #[test]
    fn test_stale_sessions_force_closed() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);

        // A day plus an hour later with no samples in between.
        let out = tracker.cleanup_stale_at(t(25 * 3600));
        assert_eq!(sessions_in(&out).len(), 1);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_close_all_synthesizes_leaves() {
        let tracker = VoiceSessionTracker::new();
        join(&tracker, 100, 0);
        tracker.handle_join(1, 11, 100, None, "hsh:bb".to_string(), quiet(), t(0));

        let out = tracker.close_all_at(t(300));
        assert_eq!(sessions_in(&out).len(), 2);
        assert_eq!(tracker.active_count(), 0);
        for s in sessions_in(&out) {
            assert_eq!(s.duration_seconds, 300);
        }
    }
}
