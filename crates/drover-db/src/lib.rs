//! Persistence layer for drover: ticket store, dependency DAG, append-only
//! event log, and per-project settings, backed by PostgreSQL.

pub mod models;
pub mod pool;
pub mod queries;
