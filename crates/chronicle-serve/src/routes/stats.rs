//! Ranking and overview endpoints.
//!
//! Every ranking shares the same shape: tenant scope, a trailing time
//! window, bot exclusion, tenant exclusion lists, and a capped limit. The
//! filter set is built with the typed predicate builder and lowered to `$N`
//! SQL once, so adding a filter can never desynchronize placeholders from
//! binds.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::get_or_compute;
use crate::error::ApiError;
use crate::exclusion::{apply_exclusions, ExclusionColumns, FilterOutcome, Subject};
use crate::predicate::{bind_predicates, PredicateSet};
use crate::state::AppState;

const DEFAULT_WINDOW_DAYS: u32 = 30;
const MAX_WINDOW_DAYS: u32 = 365;
const DEFAULT_LIMIT: u32 = 25;
const MAX_LIMIT: u32 = 100;

/// Common query parameters for ranking endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RankingQuery {
    pub tenant_id: i64,
    /// Trailing window in days (default 30, max 365).
    pub days: Option<u32>,
    /// Result cap (default 25, max 100).
    pub limit: Option<u32>,
    /// Restrict to one channel.
    pub channel_id: Option<i64>,
    /// Restrict to members of one role (resolved through the directory).
    pub role_id: Option<i64>,
}

impl RankingQuery {
    fn window_days(&self) -> u32 {
        self.days.unwrap_or(DEFAULT_WINDOW_DAYS).min(MAX_WINDOW_DAYS)
    }

    fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.window_days() as i64)
    }

    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT) as i64
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.tenant_id <= 0 {
            return Err(ApiError::BadRequest("tenant_id must be positive".to_string()));
        }
        Ok(())
    }

    fn cache_key(&self, endpoint: &str) -> String {
        format!(
            "{endpoint}:{}:{}:{}:{}:{}",
            self.tenant_id,
            self.window_days(),
            self.channel_id.unwrap_or(0),
            self.role_id.unwrap_or(0),
            self.limit()
        )
    }

    /// Resolve the role filter into a member-id predicate on `user_column`.
    ///
    /// Returns false when the role has no members, meaning the result is
    /// empty and the query can be skipped.
    async fn apply_role_filter(
        &self,
        state: &AppState,
        user_column: &'static str,
        predicates: &mut PredicateSet,
    ) -> Result<bool, ApiError> {
        let Some(role_id) = self.role_id else {
            return Ok(true);
        };
        let mut members = state.exclusions.role_members(self.tenant_id, role_id).await?;
        if members.is_empty() {
            return Ok(false);
        }
        members.sort_unstable();
        predicates.one_of(user_column, members);
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Overview
// ═══════════════════════════════════════════════════════════════════════════

/// Tenant-level totals.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OverviewResponse {
    pub total_messages: i64,
    pub active_authors: i64,
    pub voice_seconds: i64,
    pub emoji_uses: i64,
}

/// `GET /api/v1/stats?tenant_id=...`
pub async fn overview(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<OverviewResponse>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "stats").increment(1);

    let key = format!("overview:{}", params.tenant_id);
    let pool = state.pool.clone();
    let tenant_id = params.tenant_id;

    let response = get_or_compute(&state.cache, &key, || async move {
        let started = Instant::now();
        let row: OverviewResponse = sqlx::query_as(
            "SELECT
               (SELECT COUNT(*) FROM message_tracking
                  WHERE tenant_id = $1) AS total_messages,
               (SELECT COUNT(DISTINCT user_id) FROM message_tracking
                  WHERE tenant_id = $1) AS active_authors,
               (SELECT COALESCE(SUM(duration_seconds), 0) FROM voice_time_aggregates
                  WHERE tenant_id = $1) AS voice_seconds,
               (SELECT COALESCE(SUM(usage_count), 0) FROM emoji_usage
                  WHERE tenant_id = $1) AS emoji_uses",
        )
        .bind(tenant_id)
        .fetch_one(&pool)
        .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(row)
    })
    .await?;

    Ok(Json(response))
}

// ═══════════════════════════════════════════════════════════════════════════
// Rankings
// ═══════════════════════════════════════════════════════════════════════════

/// One leaderboard row for message activity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRankingRow {
    pub user_id: i64,
    pub display_name: String,
    pub messages: i64,
    pub characters: i64,
}

/// `GET /api/v1/rankings/messages`
pub async fn message_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Vec<MessageRankingRow>>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "rankings_messages").increment(1);

    let key = params.cache_key("rankings_messages");
    let state2 = state.clone();

    let rows = get_or_compute(&state.cache, &key, || async move {
        let exclusions = state2.exclusions.resolve(params.tenant_id).await?;

        let mut predicates = PredicateSet::new();
        predicates
            .eq("tenant_id", params.tenant_id)
            .since("created_at", params.window_start())
            .eq_bool("is_bot", false);
        if let Some(channel_id) = params.channel_id {
            predicates.eq("channel_id", channel_id);
        }
        if !params.apply_role_filter(&state2, "user_id", &mut predicates).await? {
            return Ok(Vec::new());
        }
        let subject = params.channel_id.map(Subject::Channel);
        if let FilterOutcome::Excluded =
            apply_exclusions(&exclusions, subject, &mut predicates, &ExclusionColumns::STANDARD)
        {
            metrics::counter!("api_requests_excluded_total").increment(1);
            return Ok(Vec::new());
        }

        let (clause, next) = predicates.lower(1);
        let sql = format!(
            "SELECT user_id,
                    MAX(display_name) AS display_name,
                    COUNT(*) AS messages,
                    COALESCE(SUM(length), 0) AS characters
             FROM message_tracking
             {clause}
             GROUP BY user_id
             ORDER BY messages DESC, user_id
             LIMIT ${next}"
        );

        let started = Instant::now();
        let query = sqlx::query_as::<_, MessageRankingRow>(&sql);
        let rows = bind_predicates(query, &predicates)
            .bind(params.limit())
            .fetch_all(&state2.pool)
            .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(rows)
    })
    .await?;

    Ok(Json(rows))
}

/// One leaderboard row for voice activity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VoiceRankingRow {
    pub user_id: i64,
    pub display_name: String,
    pub seconds: i64,
    pub sessions: i64,
}

/// `GET /api/v1/rankings/voice`
pub async fn voice_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Vec<VoiceRankingRow>>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "rankings_voice").increment(1);

    let key = params.cache_key("rankings_voice");
    let state2 = state.clone();

    let rows = get_or_compute(&state.cache, &key, || async move {
        let exclusions = state2.exclusions.resolve(params.tenant_id).await?;

        let mut predicates = PredicateSet::new();
        predicates
            .eq("tenant_id", params.tenant_id)
            .since("leave_time", params.window_start());
        if let Some(channel_id) = params.channel_id {
            predicates.eq("channel_id", channel_id);
        }
        if !params.apply_role_filter(&state2, "user_id", &mut predicates).await? {
            return Ok(Vec::new());
        }
        let subject = params.channel_id.map(Subject::Channel);
        if let FilterOutcome::Excluded =
            apply_exclusions(&exclusions, subject, &mut predicates, &ExclusionColumns::STANDARD)
        {
            metrics::counter!("api_requests_excluded_total").increment(1);
            return Ok(Vec::new());
        }

        let (clause, next) = predicates.lower(1);
        let sql = format!(
            "SELECT user_id,
                    MAX(display_name) AS display_name,
                    COALESCE(SUM(duration_seconds), 0) AS seconds,
                    COUNT(*) AS sessions
             FROM voice_sessions
             {clause}
             GROUP BY user_id
             ORDER BY seconds DESC, user_id
             LIMIT ${next}"
        );

        let started = Instant::now();
        let query = sqlx::query_as::<_, VoiceRankingRow>(&sql);
        let rows = bind_predicates(query, &predicates)
            .bind(params.limit())
            .fetch_all(&state2.pool)
            .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(rows)
    })
    .await?;

    Ok(Json(rows))
}

/// One leaderboard row for received mentions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MentionRankingRow {
    pub user_id: i64,
    pub display_name: String,
    pub mentions: i64,
}

/// `GET /api/v1/rankings/mentions`
pub async fn mention_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Vec<MentionRankingRow>>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "rankings_mentions").increment(1);

    let key = params.cache_key("rankings_mentions");
    let state2 = state.clone();

    let columns = ExclusionColumns {
        user: Some("mentioned_user_id"),
        channel: Some("channel_id"),
        category: Some("category_id"),
    };

    let rows = get_or_compute(&state.cache, &key, || async move {
        let exclusions = state2.exclusions.resolve(params.tenant_id).await?;

        let mut predicates = PredicateSet::new();
        predicates
            .eq("tenant_id", params.tenant_id)
            .since("created_at", params.window_start());
        if let Some(channel_id) = params.channel_id {
            predicates.eq("channel_id", channel_id);
        }
        if !params
            .apply_role_filter(&state2, "mentioned_user_id", &mut predicates)
            .await?
        {
            return Ok(Vec::new());
        }
        let subject = params.channel_id.map(Subject::Channel);
        if let FilterOutcome::Excluded =
            apply_exclusions(&exclusions, subject, &mut predicates, &columns)
        {
            metrics::counter!("api_requests_excluded_total").increment(1);
            return Ok(Vec::new());
        }

        let (clause, next) = predicates.lower(1);
        let sql = format!(
            "SELECT mentioned_user_id AS user_id,
                    MAX(display_name) AS display_name,
                    COUNT(*) AS mentions
             FROM mention_tracking
             {clause}
             GROUP BY mentioned_user_id
             ORDER BY mentions DESC, mentioned_user_id
             LIMIT ${next}"
        );

        let started = Instant::now();
        let query = sqlx::query_as::<_, MentionRankingRow>(&sql);
        let rows = bind_predicates(query, &predicates)
            .bind(params.limit())
            .fetch_all(&state2.pool)
            .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(rows)
    })
    .await?;

    Ok(Json(rows))
}

/// One leaderboard row for emoji usage.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmojiRankingRow {
    pub emoji_token: String,
    pub is_custom: bool,
    pub uses: i64,
    pub users: i64,
}

/// `GET /api/v1/rankings/emoji`
///
/// Ranks by lifetime accumulated counts; the per-row window is the
/// aggregate's `last_used`, so `days` filters out emoji nobody has touched
/// recently rather than slicing counts.
pub async fn emoji_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Vec<EmojiRankingRow>>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "rankings_emoji").increment(1);

    let key = params.cache_key("rankings_emoji");
    let state2 = state.clone();

    let rows = get_or_compute(&state.cache, &key, || async move {
        let exclusions = state2.exclusions.resolve(params.tenant_id).await?;

        let mut predicates = PredicateSet::new();
        predicates.eq("tenant_id", params.tenant_id);
        if params.days.is_some() {
            predicates.since("last_used", params.window_start());
        }
        if let Some(channel_id) = params.channel_id {
            predicates.eq("channel_id", channel_id);
        }
        let subject = params.channel_id.map(Subject::Channel);
        if let FilterOutcome::Excluded =
            apply_exclusions(&exclusions, subject, &mut predicates, &ExclusionColumns::STANDARD)
        {
            metrics::counter!("api_requests_excluded_total").increment(1);
            return Ok(Vec::new());
        }

        let (clause, next) = predicates.lower(1);
        let sql = format!(
            "SELECT emoji_token,
                    BOOL_OR(is_custom) AS is_custom,
                    COALESCE(SUM(usage_count), 0) AS uses,
                    COUNT(DISTINCT user_id) AS users
             FROM emoji_usage
             {clause}
             GROUP BY emoji_token
             ORDER BY uses DESC, emoji_token
             LIMIT ${next}"
        );

        let started = Instant::now();
        let query = sqlx::query_as::<_, EmojiRankingRow>(&sql);
        let rows = bind_predicates(query, &predicates)
            .bind(params.limit())
            .fetch_all(&state2.pool)
            .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(rows)
    })
    .await?;

    Ok(Json(rows))
}

/// One leaderboard row for invite activity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InviteRankingRow {
    pub inviter_id: i64,
    pub uses: i64,
    pub codes: i64,
}

/// `GET /api/v1/rankings/invites`
pub async fn invite_rankings(
    State(state): State<AppState>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<Vec<InviteRankingRow>>, ApiError> {
    params.validate()?;
    metrics::counter!("api_requests_total", "route" => "rankings_invites").increment(1);

    let key = params.cache_key("rankings_invites");
    let state2 = state.clone();

    let columns = ExclusionColumns {
        user: Some("inviter_id"),
        channel: None,
        category: None,
    };

    let rows = get_or_compute(&state.cache, &key, || async move {
        let exclusions = state2.exclusions.resolve(params.tenant_id).await?;

        let mut predicates = PredicateSet::new();
        predicates.eq("tenant_id", params.tenant_id);
        if let FilterOutcome::Excluded =
            apply_exclusions(&exclusions, None, &mut predicates, &columns)
        {
            metrics::counter!("api_requests_excluded_total").increment(1);
            return Ok(Vec::new());
        }

        let (clause, next) = predicates.lower(1);
        let sql = format!(
            "SELECT inviter_id,
                    COALESCE(SUM(uses), 0) AS uses,
                    COUNT(*) AS codes
             FROM invite_uses
             {clause}
             GROUP BY inviter_id
             ORDER BY uses DESC, inviter_id
             LIMIT ${next}"
        );

        let started = Instant::now();
        let query = sqlx::query_as::<_, InviteRankingRow>(&sql);
        let rows = bind_predicates(query, &predicates)
            .bind(params.limit())
            .fetch_all(&state2.pool)
            .await?;
        metrics::histogram!("api_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(rows)
    })
    .await?;

    Ok(Json(rows))
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-user summary
// ═══════════════════════════════════════════════════════════════════════════

/// A user's activity over the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummaryResponse {
    pub user_id: i64,
    /// True when the user is on the tenant's exclusion list; all counts are
    /// zero in that case.
    pub excluded: bool,
    pub messages: i64,
    pub characters: i64,
    pub mentions_received: i64,
    pub voice_seconds: i64,
}

/// `GET /api/v1/users/{user_id}?tenant_id=...`
pub async fn user_summary(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<RankingQuery>,
) -> Result<Json<UserSummaryResponse>, ApiError> {
    params.validate()?;
    if user_id <= 0 {
        return Err(ApiError::BadRequest("user_id must be positive".to_string()));
    }
    metrics::counter!("api_requests_total", "route" => "user_summary").increment(1);

    let exclusions = state.exclusions.resolve(params.tenant_id).await?;
    let mut scratch = PredicateSet::new();
    if let FilterOutcome::Excluded = apply_exclusions(
        &exclusions,
        Some(Subject::User(user_id)),
        &mut scratch,
        &ExclusionColumns::STANDARD,
    ) {
        metrics::counter!("api_requests_excluded_total").increment(1);
        return Ok(Json(UserSummaryResponse {
            user_id,
            excluded: true,
            messages: 0,
            characters: 0,
            mentions_received: 0,
            voice_seconds: 0,
        }));
    }

    let since = params.window_start();
    let started = Instant::now();
    let (messages, characters, mentions_received, voice_seconds): (i64, i64, i64, i64) =
        sqlx::query_as(
            "SELECT
               (SELECT COUNT(*) FROM message_tracking
                  WHERE tenant_id = $1 AND user_id = $2 AND created_at >= $3),
               (SELECT COALESCE(SUM(length), 0) FROM message_tracking
                  WHERE tenant_id = $1 AND user_id = $2 AND created_at >= $3),
               (SELECT COUNT(*) FROM mention_tracking
                  WHERE tenant_id = $1 AND mentioned_user_id = $2 AND created_at >= $3),
               (SELECT COALESCE(SUM(duration_seconds), 0) FROM voice_sessions
                  WHERE tenant_id = $1 AND user_id = $2 AND leave_time >= $3)",
        )
        .bind(params.tenant_id)
        .bind(user_id)
        .bind(since)
        .fetch_one(&state.pool)
        .await?;
    metrics::histogram!("api_query_duration_seconds").record(started.elapsed().as_secs_f64());

    Ok(Json(UserSummaryResponse {
        user_id,
        excluded: false,
        messages,
        characters,
        mentions_received,
        voice_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tenant_id: i64) -> RankingQuery {
        RankingQuery {
            tenant_id,
            days: None,
            limit: None,
            channel_id: None,
            role_id: None,
        }
    }

    #[test]
    fn test_window_defaults_and_caps() {
        let mut p = params(1);
        assert_eq!(p.window_days(), 30);
        p.days = Some(10_000);
        assert_eq!(p.window_days(), 365);
    }

    #[test]
    fn test_limit_defaults_and_caps() {
        let mut p = params(1);
        assert_eq!(p.limit(), 25);
        p.limit = Some(5000);
        assert_eq!(p.limit(), 100);
    }

    #[test]
    fn test_validate_rejects_bad_tenant() {
        assert!(params(0).validate().is_err());
        assert!(params(1).validate().is_ok());
    }

    #[test]
    fn test_cache_key_varies_by_parameters() {
        let a = params(1).cache_key("rankings_messages");
        let mut q = params(1);
        q.channel_id = Some(9);
        let b = q.cache_key("rankings_messages");
        assert_ne!(a, b);
        assert!(a.starts_with("rankings_messages:1:"));
    }
}
