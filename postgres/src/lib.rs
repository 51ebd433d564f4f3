//! `PostgreSQL` store implementation for meshwork.
//!
//! This crate provides [`PostgresStore`], the production implementation of
//! the [`Store`](meshwork_core::store::Store) trait. It uses sqlx with
//! connection pooling and embedded migrations, and implements transactional
//! groups over a single dedicated transaction per group.
//!
//! # Example
//!
//! ```no_run
//! use meshwork_postgres::PostgresStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::new("postgres://localhost/meshwork").await?;
//!     store.run_migrations().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::PostgresStore;
