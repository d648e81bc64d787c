//! Persistence layer for drover: connection pool, migrations, row models,
//! and the query functions that implement the task / worker / conversation
//! store primitives.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::StoreError;
