//! Exclusion list resolution and query filtering.
//!
//! Tenants can exclude users, channels, categories, or whole roles from
//! analytics. Exclusions are stored in `exclusion_lists`; role entries are
//! expanded to user ids through the platform [`Directory`], with a semaphore
//! bounding concurrent lookups. Pinned entries override exclusion: a pinned
//! user stays in rankings even if a role they hold is excluded.
//!
//! Queries consume the resolved [`ExclusionSet`] two ways: a detail query
//! whose subject is itself excluded short-circuits to an empty result, and
//! ranking queries get `NOT IN` predicates appended.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::error::ApiError;
use crate::predicate::PredicateSet;

/// Concurrent role-membership lookups allowed at once.
pub const DEFAULT_DIRECTORY_PERMITS: usize = 20;

/// What an exclusion row applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionScope {
    User,
    Channel,
    Category,
    Role,
}

impl ExclusionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Channel => "channel",
            Self::Category => "category",
            Self::Role => "role",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "channel" => Some(Self::Channel),
            "category" => Some(Self::Category),
            "role" => Some(Self::Role),
            _ => None,
        }
    }
}

/// Resolved exclusions for one tenant, role entries already expanded.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    pub users: HashSet<i64>,
    pub channels: HashSet<i64>,
    pub categories: HashSet<i64>,
}

/// The subject of a detail query, checked for short-circuit exclusion.
#[derive(Debug, Clone, Copy)]
pub enum Subject {
    User(i64),
    Channel(i64),
}

/// Result of applying exclusions to a query.
#[derive(Debug)]
pub enum FilterOutcome {
    /// The query's subject is excluded; return empty without hitting the
    /// store.
    Excluded,
    /// Predicates were appended; proceed.
    Filtered,
}

/// Which columns of the queried table each exclusion scope maps to.
///
/// `None` means the table has no such column and that scope is skipped
/// (e.g. `invite_uses` has no channel).
#[derive(Debug, Clone, Copy)]
pub struct ExclusionColumns {
    pub user: Option<&'static str>,
    pub channel: Option<&'static str>,
    pub category: Option<&'static str>,
}

impl ExclusionColumns {
    /// The common fact-table layout.
    pub const STANDARD: Self = Self {
        user: Some("user_id"),
        channel: Some("channel_id"),
        category: Some("category_id"),
    };
}

/// Apply an exclusion set to a query's predicates.
pub fn apply_exclusions(
    set: &ExclusionSet,
    subject: Option<Subject>,
    predicates: &mut PredicateSet,
    columns: &ExclusionColumns,
) -> FilterOutcome {
    match subject {
        Some(Subject::User(id)) if set.users.contains(&id) => return FilterOutcome::Excluded,
        Some(Subject::Channel(id)) if set.channels.contains(&id) => {
            return FilterOutcome::Excluded;
        }
        _ => {}
    }

    // A pinned subject already narrows that column with an equality
    // predicate, so its NOT-IN list would be redundant.
    let user_pinned = matches!(subject, Some(Subject::User(_)));
    let channel_pinned = matches!(subject, Some(Subject::Channel(_)));

    // Sorted for deterministic SQL, which keeps cache keys and tests stable.
    if let (Some(column), false) = (columns.user, user_pinned) {
        let mut ids: Vec<i64> = set.users.iter().copied().collect();
        ids.sort_unstable();
        predicates.not_in(column, ids);
    }
    if let (Some(column), false) = (columns.channel, channel_pinned) {
        let mut ids: Vec<i64> = set.channels.iter().copied().collect();
        ids.sort_unstable();
        predicates.not_in(column, ids);
    }
    if let Some(column) = columns.category {
        let mut ids: Vec<i64> = set.categories.iter().copied().collect();
        ids.sort_unstable();
        predicates.not_in(column, ids);
    }

    FilterOutcome::Filtered
}

/// Platform lookup for role membership.
///
/// The query API does not talk to the chat platform itself; the embedding
/// service provides this.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn members_of_role(&self, tenant_id: i64, role_id: i64)
        -> Result<Vec<i64>, ApiError>;
}

/// A directory that knows nothing; role exclusions expand to no users.
pub struct EmptyDirectory;

#[async_trait]
impl Directory for EmptyDirectory {
    async fn members_of_role(&self, _tenant_id: i64, _role_id: i64) -> Result<Vec<i64>, ApiError> {
        Ok(Vec::new())
    }
}

/// Loads and expands exclusion lists for query handlers.
pub struct ExclusionFilterResolver {
    pool: PgPool,
    directory: Arc<dyn Directory>,
    permits: Arc<Semaphore>,
}

impl ExclusionFilterResolver {
    pub fn new(pool: PgPool, directory: Arc<dyn Directory>, permits: usize) -> Self {
        Self {
            pool,
            directory,
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// Resolve the exclusion set for a tenant.
    pub async fn resolve(&self, tenant_id: i64) -> Result<ExclusionSet, ApiError> {
        let rows: Vec<(String, i64, bool)> = sqlx::query_as(
            "SELECT scope, subject_id, pinned FROM exclusion_lists WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let role_ids: Vec<i64> = rows
            .iter()
            .filter(|(scope, _, pinned)| scope == "role" && !pinned)
            .map(|(_, id, _)| *id)
            .collect();

        let mut role_members: HashMap<i64, Vec<i64>> = HashMap::new();
        for role_id in role_ids {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| ApiError::Internal(anyhow::anyhow!("semaphore closed: {e}")))?;
            let members = self.directory.members_of_role(tenant_id, role_id).await?;
            role_members.insert(role_id, members);
        }

        Ok(assemble(rows, role_members))
    }

    /// Expand one role into its member ids, under the same concurrency gate
    /// as exclusion expansion. Used by handlers that scope a ranking to a
    /// role.
    pub async fn role_members(&self, tenant_id: i64, role_id: i64) -> Result<Vec<i64>, ApiError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("semaphore closed: {e}")))?;
        self.directory.members_of_role(tenant_id, role_id).await
    }
}

/// Fold raw exclusion rows and expanded role memberships into a set.
///
/// Pinned rows are overrides: a pinned user is removed from the final user
/// exclusions even when a role expansion included them. Pinned rows of other
/// scopes simply don't exclude.
fn assemble(
    rows: Vec<(String, i64, bool)>,
    role_members: HashMap<i64, Vec<i64>>,
) -> ExclusionSet {
    let mut set = ExclusionSet::default();
    let mut pinned_users: HashSet<i64> = HashSet::new();

    for (scope, subject_id, pinned) in rows {
        let Some(scope) = ExclusionScope::parse(&scope) else {
            tracing::warn!(scope = %scope, subject_id, "unknown exclusion scope, ignoring");
            continue;
        };
        match (scope, pinned) {
            (ExclusionScope::User, false) => {
                set.users.insert(subject_id);
            }
            (ExclusionScope::User, true) => {
                pinned_users.insert(subject_id);
            }
            (ExclusionScope::Channel, false) => {
                set.channels.insert(subject_id);
            }
            (ExclusionScope::Category, false) => {
                set.categories.insert(subject_id);
            }
            (ExclusionScope::Role, false) => {
                if let Some(members) = role_members.get(&subject_id) {
                    set.users.extend(members.iter().copied());
                }
            }
            // Pinned channel/category/role rows are inert.
            _ => {}
        }
    }

    for id in pinned_users {
        set.users.remove(&id);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(scope: &str, id: i64, pinned: bool) -> (String, i64, bool) {
        (scope.to_string(), id, pinned)
    }

    #[test]
    fn test_assemble_basic_scopes() {
        let set = assemble(
            vec![
                row("user", 1, false),
                row("channel", 2, false),
                row("category", 3, false),
            ],
            HashMap::new(),
        );
        assert!(set.users.contains(&1));
        assert!(set.channels.contains(&2));
        assert!(set.categories.contains(&3));
    }

    #[test]
    fn test_role_rows_expand_to_members() {
        let mut members = HashMap::new();
        members.insert(50, vec![10, 11]);
        let set = assemble(vec![row("role", 50, false)], members);
        assert_eq!(set.users, HashSet::from([10, 11]));
    }

    #[test]
    fn test_pinned_user_overrides_role_expansion() {
        let mut members = HashMap::new();
        members.insert(50, vec![10, 11]);
        let set = assemble(
            vec![row("role", 50, false), row("user", 10, true)],
            members,
        );
        assert_eq!(set.users, HashSet::from([11]));
    }

    #[test]
    fn test_unknown_scope_ignored() {
        let set = assemble(vec![row("guild", 9, false)], HashMap::new());
        assert!(set.users.is_empty());
    }

    #[test]
    fn test_excluded_subject_short_circuits() {
        let mut set = ExclusionSet::default();
        set.users.insert(7);
        let mut predicates = PredicateSet::new();
        let outcome = apply_exclusions(
            &set,
            Some(Subject::User(7)),
            &mut predicates,
            &ExclusionColumns::STANDARD,
        );
        assert!(matches!(outcome, FilterOutcome::Excluded));
    }

    #[test]
    fn test_filtering_appends_not_in_per_scope() {
        let mut set = ExclusionSet::default();
        set.users.insert(7);
        set.channels.insert(8);
        let mut predicates = PredicateSet::new();
        predicates.eq("tenant_id", 1);

        let outcome = apply_exclusions(&set, None, &mut predicates, &ExclusionColumns::STANDARD);
        assert!(matches!(outcome, FilterOutcome::Filtered));
        let (clause, _) = predicates.lower(1);
        assert_eq!(
            clause,
            "WHERE tenant_id = $1 AND user_id <> ALL($2) AND channel_id <> ALL($3)"
        );
    }

    #[test]
    fn test_pinned_channel_skips_channel_not_in() {
        let mut set = ExclusionSet::default();
        set.users.insert(7);
        set.channels.insert(8);
        let mut predicates = PredicateSet::new();

        // Channel 9 is not excluded; pinning it keeps the user list but
        // drops the redundant channel list.
        let outcome = apply_exclusions(
            &set,
            Some(Subject::Channel(9)),
            &mut predicates,
            &ExclusionColumns::STANDARD,
        );
        assert!(matches!(outcome, FilterOutcome::Filtered));
        let (clause, _) = predicates.lower(1);
        assert_eq!(clause, "WHERE user_id <> ALL($1)");
    }

    #[test]
    fn test_empty_set_adds_no_predicates() {
        let set = ExclusionSet::default();
        let mut predicates = PredicateSet::new();
        apply_exclusions(&set, None, &mut predicates, &ExclusionColumns::STANDARD);
        assert!(predicates.is_empty());
    }

    #[test]
    fn test_column_mapping_skips_missing_columns() {
        let mut set = ExclusionSet::default();
        set.users.insert(7);
        set.channels.insert(8);
        let mut predicates = PredicateSet::new();
        let columns = ExclusionColumns {
            user: Some("inviter_id"),
            channel: None,
            category: None,
        };
        apply_exclusions(&set, None, &mut predicates, &columns);
        let (clause, _) = predicates.lower(1);
        assert_eq!(clause, "WHERE inviter_id <> ALL($1)");
    }

    #[tokio::test]
    async fn test_empty_directory_returns_no_members() {
        let members = EmptyDirectory.members_of_role(1, 2).await.unwrap();
        assert!(members.is_empty());
    }
}
