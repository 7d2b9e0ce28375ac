//! Typed SQL predicate building.
//!
//! Ranking queries share one filter surface: tenant, time window, bot
//! exclusion, and the exclusion lists. Predicates are assembled as typed
//! (column, operator, value) triples and lowered to `$N` placeholder SQL in
//! one place, so placeholder numbering can never drift from the bind order.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::Postgres;

/// A bindable value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    BigInt(i64),
    BigIntArray(Vec<i64>),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `column = ANY($n)` against a bigint array.
    InArray,
    /// `column <> ALL($n)` against a bigint array.
    NotInArray,
}

impl Op {
    fn render(self, column: &str, placeholder: usize) -> String {
        match self {
            Self::Eq => format!("{column} = ${placeholder}"),
            Self::Ne => format!("{column} <> ${placeholder}"),
            Self::Lt => format!("{column} < ${placeholder}"),
            Self::Le => format!("{column} <= ${placeholder}"),
            Self::Gt => format!("{column} > ${placeholder}"),
            Self::Ge => format!("{column} >= ${placeholder}"),
            Self::InArray => format!("{column} = ANY(${placeholder})"),
            Self::NotInArray => format!("{column} <> ALL(${placeholder})"),
        }
    }
}

/// One typed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: &'static str,
    pub op: Op,
    pub value: SqlValue,
}

/// An ordered conjunction of predicates.
#[derive(Debug, Clone, Default)]
pub struct PredicateSet {
    predicates: Vec<Predicate>,
}

impl PredicateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: &'static str, op: Op, value: SqlValue) -> &mut Self {
        self.predicates.push(Predicate { column, op, value });
        self
    }

    pub fn eq(&mut self, column: &'static str, value: i64) -> &mut Self {
        self.push(column, Op::Eq, SqlValue::BigInt(value))
    }

    pub fn eq_bool(&mut self, column: &'static str, value: bool) -> &mut Self {
        self.push(column, Op::Eq, SqlValue::Bool(value))
    }

    pub fn since(&mut self, column: &'static str, value: DateTime<Utc>) -> &mut Self {
        self.push(column, Op::Ge, SqlValue::Timestamp(value))
    }

    pub fn until(&mut self, column: &'static str, value: DateTime<Utc>) -> &mut Self {
        self.push(column, Op::Lt, SqlValue::Timestamp(value))
    }

    /// Exclude rows whose `column` is in `ids`. Empty lists add nothing.
    pub fn not_in(&mut self, column: &'static str, ids: Vec<i64>) -> &mut Self {
        if ids.is_empty() {
            return self;
        }
        self.push(column, Op::NotInArray, SqlValue::BigIntArray(ids))
    }

    /// Keep only rows whose `column` is in `ids`. An empty list matches
    /// nothing, so callers should short-circuit before querying.
    pub fn one_of(&mut self, column: &'static str, ids: Vec<i64>) -> &mut Self {
        self.push(column, Op::InArray, SqlValue::BigIntArray(ids))
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Values in bind order, matching the placeholders from [`lower`].
    ///
    /// [`lower`]: PredicateSet::lower
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.predicates.iter().map(|p| &p.value)
    }

    /// Render `WHERE ...` with placeholders numbered from `start_index`.
    ///
    /// Returns the clause (empty string when no predicates) and the next free
    /// placeholder index, for queries that append their own binds (LIMIT
    /// etc.).
    pub fn lower(&self, start_index: usize) -> (String, usize) {
        if self.predicates.is_empty() {
            return (String::new(), start_index);
        }
        let mut parts = Vec::with_capacity(self.predicates.len());
        let mut index = start_index;
        for p in &self.predicates {
            parts.push(p.op.render(p.column, index));
            index += 1;
        }
        (format!("WHERE {}", parts.join(" AND ")), index)
    }
}

/// Bind a predicate set's values onto a `query_as`, in lowering order.
pub fn bind_predicates<'q, O>(
    mut query: sqlx::query::QueryAs<'q, Postgres, O, PgArguments>,
    set: &PredicateSet,
) -> sqlx::query::QueryAs<'q, Postgres, O, PgArguments> {
    for value in set.values() {
        query = match value {
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::BigIntArray(v) => query.bind(v.clone()),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
            SqlValue::Bool(v) => query.bind(*v),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_set_renders_nothing() {
        let set = PredicateSet::new();
        let (clause, next) = set.lower(1);
        assert_eq!(clause, "");
        assert_eq!(next, 1);
    }

    #[test]
    fn test_placeholders_are_contiguous() {
        let mut set = PredicateSet::new();
        set.eq("tenant_id", 1)
            .since("created_at", Utc.timestamp_opt(0, 0).unwrap())
            .eq_bool("is_bot", false);

        let (clause, next) = set.lower(1);
        assert_eq!(
            clause,
            "WHERE tenant_id = $1 AND created_at >= $2 AND is_bot = $3"
        );
        assert_eq!(next, 4);
    }

    #[test]
    fn test_numbering_continues_from_start_index() {
        let mut set = PredicateSet::new();
        set.eq("tenant_id", 1).eq("channel_id", 2);
        let (clause, next) = set.lower(3);
        assert_eq!(clause, "WHERE tenant_id = $3 AND channel_id = $4");
        assert_eq!(next, 5);
    }

    #[test]
    fn test_not_in_renders_all_against_array() {
        let mut set = PredicateSet::new();
        set.not_in("user_id", vec![5, 6]);
        let (clause, _) = set.lower(1);
        assert_eq!(clause, "WHERE user_id <> ALL($1)");
        // One placeholder, one array value.
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_empty_exclusion_adds_nothing() {
        let mut set = PredicateSet::new();
        set.not_in("user_id", vec![]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_values_align_with_placeholders() {
        let mut set = PredicateSet::new();
        set.eq("tenant_id", 7).not_in("channel_id", vec![1, 2]);
        let values: Vec<&SqlValue> = set.values().collect();
        assert_eq!(values[0], &SqlValue::BigInt(7));
        assert_eq!(values[1], &SqlValue::BigIntArray(vec![1, 2]));
        let (clause, _) = set.lower(1);
        assert_eq!(clause, "WHERE tenant_id = $1 AND channel_id <> ALL($2)");
    }
}
