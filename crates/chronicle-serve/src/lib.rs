//! Chronicle Serve - HTTP API for community analytics
//!
//! This crate provides a REST API for querying aggregate activity data
//! stored in Postgres/TimescaleDB. It is designed for analytics-oriented
//! access patterns (rankings, totals, per-user summaries) rather than raw
//! event access.
//!
//! # Authentication
//!
//! All endpoints under `/api/v1` require Bearer token authentication.
//! Tokens are configured via environment variables (typically in a `.env`
//! file).
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (connection pool, configuration,
//!   response cache, exclusion resolver)
//! - **Auth**: Bearer token middleware for request authentication
//! - **Predicate**: Typed WHERE-clause builder keeping SQL placeholders and
//!   binds in lockstep
//! - **Exclusion**: Tenant opt-out lists applied to every query
//! - **Routes**: Endpoint handlers grouped by domain

mod auth;
pub mod cache;
mod error;
pub mod exclusion;
pub mod predicate;
mod routes;
mod state;

pub use self::auth::require_auth;
pub use self::cache::{get_or_compute, new_cache, ResponseCache};
pub use self::error::ApiError;
pub use self::exclusion::{
    apply_exclusions, Directory, EmptyDirectory, ExclusionColumns, ExclusionFilterResolver,
    ExclusionScope, ExclusionSet, FilterOutcome, Subject,
};
pub use self::predicate::{bind_predicates, PredicateSet};
pub use self::routes::router;
pub use self::state::{default_directory, AppState, Config};
