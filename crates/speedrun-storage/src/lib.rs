//! Event Store: idempotent persistence for intents and their lifecycle
//! events (spec.md §4.3).

mod migrations;
mod store;

pub use store::EventStore;
pub use sqlx::PgPool;
