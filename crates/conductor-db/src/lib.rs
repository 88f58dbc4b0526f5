//! Persistence layer for the conductor orchestrator: schema migrations, row
//! models, and query functions over PostgreSQL.
//!
//! This crate is the single ground truth for durable state. Every state
//! transition is an optimistic-locked UPDATE; in-memory views elsewhere are
//! derived caches.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
