//! Nested cache scopes with tag propagation, lifetime tightening and a
//! size-capped Postgres store.

pub mod cache;
pub mod config;
pub mod infra;
