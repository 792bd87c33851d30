//! Relational persistence for proctor: connection pool, migrations, row
//! models, and query functions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
