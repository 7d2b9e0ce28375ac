//! Postgres/TimescaleDB persistent store.
//!
//! Schema layout:
//! - Six append-only hypertables partitioned on their time column
//!   (`message_tracking`, `message_edits`, `mention_tracking`,
//!   `voice_sessions`, `invite_events`, `member_events`). Dedup is enforced
//!   by unique indexes that include the partitioning column, with
//!   `ON CONFLICT DO NOTHING` inserts.
//! - Two plain aggregate tables (`voice_time_aggregates`, `emoji_usage`)
//!   maintained by accumulate upserts.
//! - Aux tables `exclusion_lists` and `invite_uses`.
//! - Two daily continuous aggregates over messages and voice time.
//!
//! Batch application runs each record inside its own savepoint, so a bad
//! record rolls back alone while the rest of the batch commits. Connection
//! or transaction failures abort the whole batch, which the flusher then
//! retries.

use async_trait::async_trait;
use chronicle_core::{
    BufferedRecord, EmojiUsageRecord, EventRecord, InviteEvent, InviteType, MemberEvent,
    MentionRecord, MessageEditRecord, MessageRecord, VoiceSessionRecord, VoiceTimeAggregate,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Executor, Postgres, Transaction};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flusher::{RecordApplier, SnapshotReport};

/// How long a single acquire from the pool may wait.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// The persistent store, shared by the ingest pipeline and the query API.
#[derive(Clone)]
pub struct PersistentStore {
    pool: PgPool,
}

enum Applied {
    Inserted,
    Duplicate,
}

impl PersistentStore {
    /// Connect to the database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by the query API binary).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap liveness probe for the health check loop.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables, hypertables, and indexes. Idempotent: every statement
    /// either uses `IF NOT EXISTS` or tolerates "already exists".
    pub async fn init_schema(&self) -> Result<()> {
        for sql in TABLE_DDL {
            self.pool.execute(*sql).await?;
        }
        for sql in TIMESCALE_DDL {
            self.execute_tolerant(sql).await?;
        }
        tracing::info!("store schema initialized");
        Ok(())
    }

    /// Apply compression, retention, and continuous-aggregate policies.
    ///
    /// Safe to re-run on every startup and on the maintenance schedule;
    /// "already exists" from a previous run is expected and ignored.
    pub async fn run_maintenance(&self) -> Result<()> {
        for sql in POLICY_DDL {
            self.execute_tolerant(sql).await?;
        }
        Ok(())
    }

    /// Execute DDL, treating "already exists" as success.
    async fn execute_tolerant(&self, sql: &str) -> Result<()> {
        match self.pool.execute(sql).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("already exists")
                    || msg.contains("already a hypertable")
                    || msg.contains("already has")
                {
                    tracing::debug!("ddl already applied: {}", first_line(sql));
                    Ok(())
                } else {
                    Err(Error::Store(e))
                }
            }
        }
    }

    async fn apply_one(
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> Result<Applied> {
        match record {
            EventRecord::Message(r) => Self::insert_message(tx, r).await,
            EventRecord::MessageEdit(r) => Self::insert_edit(tx, r).await,
            EventRecord::Mention(r) => Self::insert_mention(tx, r).await,
            EventRecord::VoiceSession(r) => Self::insert_voice_session(tx, r).await,
            EventRecord::VoiceAggregate(r) => Self::upsert_voice_aggregate(tx, r).await,
            EventRecord::Emoji(r) => Self::upsert_emoji(tx, r).await,
            EventRecord::Invite(r) => Self::insert_invite(tx, r).await,
            EventRecord::MemberEvent(r) => Self::insert_member_event(tx, r).await,
        }
    }

    async fn insert_message(
        tx: &mut Transaction<'_, Postgres>,
        r: &MessageRecord,
    ) -> Result<Applied> {
        let result = sqlx::query(
            "INSERT INTO message_tracking
               (tenant_id, user_id, channel_id, category_id, message_id,
                display_name, length, mention_ids, has_attachment, has_embed,
                created_at, is_bot)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (message_id, created_at) DO NOTHING",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(r.message_id)
        .bind(&r.display_name)
        .bind(r.length)
        .bind(&r.mention_ids)
        .bind(r.has_attachment)
        .bind(r.has_embed)
        .bind(r.created_at)
        .bind(r.is_bot)
        .execute(&mut **tx)
        .await?;
        Ok(if result.rows_affected() == 0 {
            Applied::Duplicate
        } else {
            Applied::Inserted
        })
    }

    async fn insert_edit(
        tx: &mut Transaction<'_, Postgres>,
        r: &MessageEditRecord,
    ) -> Result<Applied> {
        let result = sqlx::query(
            "INSERT INTO message_edits
               (tenant_id, user_id, channel_id, category_id, message_id,
                new_length, edited_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (message_id, edited_at) DO NOTHING",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(r.message_id)
        .bind(r.new_length)
        .bind(r.edited_at)
        .execute(&mut **tx)
        .await?;
        Ok(if result.rows_affected() == 0 {
            Applied::Duplicate
        } else {
            Applied::Inserted
        })
    }

    async fn insert_mention(
        tx: &mut Transaction<'_, Postgres>,
        r: &MentionRecord,
    ) -> Result<Applied> {
        let result = sqlx::query(
            "INSERT INTO mention_tracking
               (tenant_id, mentioned_user_id, mentioner_user_id, channel_id,
                category_id, message_id, display_name, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (message_id, mentioned_user_id, created_at) DO NOTHING",
        )
        .bind(r.tenant_id)
        .bind(r.mentioned_user_id)
        .bind(r.mentioner_user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(r.message_id)
        .bind(&r.display_name)
        .bind(r.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(if result.rows_affected() == 0 {
            Applied::Duplicate
        } else {
            Applied::Inserted
        })
    }

    async fn insert_voice_session(
        tx: &mut Transaction<'_, Postgres>,
        r: &VoiceSessionRecord,
    ) -> Result<Applied> {
        let result = sqlx::query(
            "INSERT INTO voice_sessions
               (tenant_id, user_id, channel_id, category_id, display_name,
                join_time, leave_time, duration_seconds, state_flags,
                afk, muted, deafened, streaming)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (tenant_id, user_id, join_time, leave_time) DO NOTHING",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(&r.display_name)
        .bind(r.join_time)
        .bind(r.leave_time)
        .bind(r.duration_seconds)
        .bind(r.state_flags as i16)
        .bind(r.afk)
        .bind(r.muted)
        .bind(r.deafened)
        .bind(r.streaming)
        .execute(&mut **tx)
        .await?;
        Ok(if result.rows_affected() == 0 {
            Applied::Duplicate
        } else {
            Applied::Inserted
        })
    }

    async fn upsert_voice_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        r: &VoiceTimeAggregate,
    ) -> Result<Applied> {
        // Accumulate: duration only grows, last_updated keeps the max.
        sqlx::query(
            "INSERT INTO voice_time_aggregates
               (tenant_id, user_id, channel_id, category_id, state_flags,
                state_category, duration_seconds, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant_id, user_id, channel_id, state_flags) DO UPDATE SET
               duration_seconds = voice_time_aggregates.duration_seconds
                 + EXCLUDED.duration_seconds,
               last_updated = GREATEST(voice_time_aggregates.last_updated,
                                       EXCLUDED.last_updated)",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(r.state_flags as i16)
        .bind(&r.state_category)
        .bind(r.duration_seconds)
        .bind(r.last_updated)
        .execute(&mut **tx)
        .await?;
        Ok(Applied::Inserted)
    }

    async fn upsert_emoji(
        tx: &mut Transaction<'_, Postgres>,
        r: &EmojiUsageRecord,
    ) -> Result<Applied> {
        sqlx::query(
            "INSERT INTO emoji_usage
               (tenant_id, user_id, channel_id, category_id, emoji_token,
                is_custom, usage_count, last_used, usage_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (tenant_id, user_id, channel_id, emoji_token, usage_type)
             DO UPDATE SET
               usage_count = emoji_usage.usage_count + EXCLUDED.usage_count,
               last_used = GREATEST(emoji_usage.last_used, EXCLUDED.last_used)",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.channel_id)
        .bind(r.category_id)
        .bind(&r.emoji_token)
        .bind(r.is_custom)
        .bind(r.usage_count)
        .bind(r.last_used)
        .bind(r.usage_type.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(Applied::Inserted)
    }

    async fn insert_invite(
        tx: &mut Transaction<'_, Postgres>,
        r: &InviteEvent,
    ) -> Result<Applied> {
        sqlx::query(
            "INSERT INTO invite_events
               (tenant_id, inviter_id, invitee_id, invite_code, invite_type,
                created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(r.tenant_id)
        .bind(r.inviter_id)
        .bind(r.invitee_id)
        .bind(&r.invite_code)
        .bind(r.invite_type.as_str())
        .bind(r.created_at)
        .execute(&mut **tx)
        .await?;

        // Valid uses also bump the per-code counter.
        if r.invite_type == InviteType::Valid {
            sqlx::query(
                "INSERT INTO invite_uses (tenant_id, invite_code, inviter_id, uses, last_used)
                 VALUES ($1, $2, $3, 1, $4)
                 ON CONFLICT (tenant_id, invite_code) DO UPDATE SET
                   uses = invite_uses.uses + 1,
                   last_used = GREATEST(invite_uses.last_used, EXCLUDED.last_used)",
            )
            .bind(r.tenant_id)
            .bind(&r.invite_code)
            .bind(r.inviter_id)
            .bind(r.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(Applied::Inserted)
    }

    async fn insert_member_event(
        tx: &mut Transaction<'_, Postgres>,
        r: &MemberEvent,
    ) -> Result<Applied> {
        let result = sqlx::query(
            "INSERT INTO member_events
               (tenant_id, user_id, event_kind, display_name, occurred_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id, user_id, event_kind, occurred_at) DO NOTHING",
        )
        .bind(r.tenant_id)
        .bind(r.user_id)
        .bind(r.event_kind.as_str())
        .bind(&r.display_name)
        .bind(r.occurred_at)
        .execute(&mut **tx)
        .await?;
        Ok(if result.rows_affected() == 0 {
            Applied::Duplicate
        } else {
            Applied::Inserted
        })
    }
}

/// Whether an error affects only the record that caused it.
///
/// Database-reported errors (constraint violations, bad values) poison the
/// savepoint but not the connection; everything else (I/O, pool, protocol)
/// means the batch cannot proceed.
fn is_record_level(e: &Error) -> bool {
    matches!(e, Error::Store(sqlx::Error::Database(_)))
}

#[async_trait]
impl RecordApplier for PersistentStore {
    async fn apply_snapshot(&self, records: &[BufferedRecord]) -> Result<SnapshotReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = SnapshotReport::default();

        for buffered in records {
            let mut sp = tx.begin().await?;
            match Self::apply_one(&mut sp, &buffered.record).await {
                Ok(Applied::Inserted) => {
                    sp.commit().await?;
                    report.inserted += 1;
                }
                Ok(Applied::Duplicate) => {
                    sp.commit().await?;
                    report.duplicates += 1;
                }
                Err(e) if is_record_level(&e) => {
                    sp.rollback().await?;
                    report.failures += 1;
                    tracing::warn!(kind = %buffered.kind(), "record failed to apply: {}", e);
                }
                Err(e) => {
                    // Connection-level: abort, nothing is acknowledged.
                    let _ = sp.rollback().await;
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or("").trim()
}

/// Plain-SQL table and index definitions. All idempotent.
const TABLE_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS message_tracking (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        message_id BIGINT NOT NULL,
        display_name TEXT NOT NULL,
        length INTEGER NOT NULL,
        mention_ids BIGINT[] NOT NULL DEFAULT '{}',
        has_attachment BOOLEAN NOT NULL DEFAULT FALSE,
        has_embed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        is_bot BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_message_tracking_dedup
        ON message_tracking (message_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_message_tracking_user
        ON message_tracking (tenant_id, user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_message_tracking_channel
        ON message_tracking (tenant_id, channel_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS message_edits (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        message_id BIGINT NOT NULL,
        new_length INTEGER NOT NULL,
        edited_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_message_edits_dedup
        ON message_edits (message_id, edited_at)",
    "CREATE TABLE IF NOT EXISTS mention_tracking (
        tenant_id BIGINT NOT NULL,
        mentioned_user_id BIGINT NOT NULL,
        mentioner_user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        message_id BIGINT NOT NULL,
        display_name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mention_tracking_dedup
        ON mention_tracking (message_id, mentioned_user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_mention_tracking_mentioned
        ON mention_tracking (tenant_id, mentioned_user_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS voice_sessions (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        display_name TEXT NOT NULL,
        join_time TIMESTAMPTZ NOT NULL,
        leave_time TIMESTAMPTZ NOT NULL,
        duration_seconds BIGINT NOT NULL,
        state_flags SMALLINT NOT NULL DEFAULT 0,
        afk BOOLEAN NOT NULL DEFAULT FALSE,
        muted BOOLEAN NOT NULL DEFAULT FALSE,
        deafened BOOLEAN NOT NULL DEFAULT FALSE,
        streaming BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_voice_sessions_dedup
        ON voice_sessions (tenant_id, user_id, join_time, leave_time)",
    "CREATE INDEX IF NOT EXISTS idx_voice_sessions_user
        ON voice_sessions (tenant_id, user_id, leave_time DESC)",
    "CREATE TABLE IF NOT EXISTS voice_time_aggregates (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        state_flags SMALLINT NOT NULL,
        state_category TEXT NOT NULL,
        duration_seconds BIGINT NOT NULL DEFAULT 0,
        last_updated TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant_id, user_id, channel_id, state_flags)
    )",
    "CREATE TABLE IF NOT EXISTS emoji_usage (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        category_id BIGINT,
        emoji_token TEXT NOT NULL,
        is_custom BOOLEAN NOT NULL DEFAULT FALSE,
        usage_count BIGINT NOT NULL DEFAULT 0,
        last_used TIMESTAMPTZ NOT NULL,
        usage_type TEXT NOT NULL,
        PRIMARY KEY (tenant_id, user_id, channel_id, emoji_token, usage_type)
    )",
    "CREATE INDEX IF NOT EXISTS idx_emoji_usage_token
        ON emoji_usage (tenant_id, emoji_token)",
    "CREATE TABLE IF NOT EXISTS invite_events (
        tenant_id BIGINT NOT NULL,
        inviter_id BIGINT NOT NULL,
        invitee_id BIGINT,
        invite_code TEXT NOT NULL,
        invite_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_invite_events_inviter
        ON invite_events (tenant_id, inviter_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS invite_uses (
        tenant_id BIGINT NOT NULL,
        invite_code TEXT NOT NULL,
        inviter_id BIGINT NOT NULL,
        uses BIGINT NOT NULL DEFAULT 0,
        last_used TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant_id, invite_code)
    )",
    "CREATE TABLE IF NOT EXISTS member_events (
        tenant_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        event_kind TEXT NOT NULL,
        display_name TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_member_events_dedup
        ON member_events (tenant_id, user_id, event_kind, occurred_at)",
    "CREATE TABLE IF NOT EXISTS exclusion_lists (
        tenant_id BIGINT NOT NULL,
        scope TEXT NOT NULL,
        subject_id BIGINT NOT NULL,
        pinned BOOLEAN NOT NULL DEFAULT FALSE,
        added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, scope, subject_id)
    )",
];

/// Hypertable conversions. Tolerant execution: a table that is already a
/// hypertable reports an error we ignore.
const TIMESCALE_DDL: &[&str] = &[
    "SELECT create_hypertable('message_tracking', 'created_at',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT create_hypertable('message_edits', 'edited_at',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT create_hypertable('mention_tracking', 'created_at',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT create_hypertable('voice_sessions', 'leave_time',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT create_hypertable('invite_events', 'created_at',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
    "SELECT create_hypertable('member_events', 'occurred_at',
        chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE)",
];

/// Compression, retention, and continuous-aggregate policies.
const POLICY_DDL: &[&str] = &[
    "ALTER TABLE message_tracking SET (timescaledb.compress,
        timescaledb.compress_segmentby = 'tenant_id, channel_id')",
    "SELECT add_compression_policy('message_tracking', INTERVAL '30 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('message_tracking', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "ALTER TABLE mention_tracking SET (timescaledb.compress,
        timescaledb.compress_segmentby = 'tenant_id')",
    "SELECT add_compression_policy('mention_tracking', INTERVAL '30 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('mention_tracking', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "ALTER TABLE voice_sessions SET (timescaledb.compress,
        timescaledb.compress_segmentby = 'tenant_id, channel_id')",
    "SELECT add_compression_policy('voice_sessions', INTERVAL '90 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('voice_sessions', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('message_edits', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('invite_events', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "SELECT add_retention_policy('member_events', INTERVAL '365 days',
        if_not_exists => TRUE)",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS daily_message_counts
        WITH (timescaledb.continuous) AS
        SELECT tenant_id,
               user_id,
               time_bucket('1 day', created_at) AS day,
               COUNT(*) AS messages,
               SUM(length) AS characters
        FROM message_tracking
        GROUP BY tenant_id, user_id, day
        WITH NO DATA",
    "CREATE MATERIALIZED VIEW IF NOT EXISTS daily_voice_seconds
        WITH (timescaledb.continuous) AS
        SELECT tenant_id,
               user_id,
               time_bucket('1 day', leave_time) AS day,
               SUM(duration_seconds) AS seconds
        FROM voice_sessions
        GROUP BY tenant_id, user_id, day
        WITH NO DATA",
    "SELECT add_continuous_aggregate_policy('daily_message_counts',
        start_offset => INTERVAL '3 days',
        end_offset => INTERVAL '1 hour',
        schedule_interval => INTERVAL '1 hour',
        if_not_exists => TRUE)",
    "SELECT add_continuous_aggregate_policy('daily_voice_seconds',
        start_offset => INTERVAL '3 days',
        end_offset => INTERVAL '1 hour',
        schedule_interval => INTERVAL '1 hour',
        if_not_exists => TRUE)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_covers_every_fact_table() {
        let all = TABLE_DDL.join("\n");
        for table in [
            "message_tracking",
            "message_edits",
            "mention_tracking",
            "voice_sessions",
            "voice_time_aggregates",
            "emoji_usage",
            "invite_events",
            "invite_uses",
            "member_events",
            "exclusion_lists",
        ] {
            assert!(
                all.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn test_table_ddl_is_idempotent_by_construction() {
        for sql in TABLE_DDL {
            assert!(sql.contains("IF NOT EXISTS"), "non-idempotent DDL: {sql}");
        }
        for sql in TIMESCALE_DDL {
            assert!(sql.contains("if_not_exists => TRUE"));
        }
    }

    #[test]
    fn test_record_level_error_classification() {
        assert!(!is_record_level(&Error::Store(sqlx::Error::PoolClosed)));
        assert!(!is_record_level(&Error::Config("x".to_string())));
    }

    #[test]
    fn test_first_line_trims() {
        assert_eq!(first_line("\n  SELECT 1\n  FROM t"), "SELECT 1");
    }
}
