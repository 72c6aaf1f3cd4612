//! Slot store for Tutorbook
//!
//! The reservation engine talks to persistence only through [`BookingStore`] and the
//! [`BookingTx`] unit of work. Two backends implement them:
//!
//! - [`MemoryStore`]: process-local, used when no database is configured and by the tests
//! - [`PgBookingStore`]: PostgreSQL through SQLx
//!
//! # Example
//!
//! ```rust,no_run
//! use tutorbook_config::AppConfig;
//! use tutorbook_db::StoreFactory;
//! use std::sync::Arc;
//!
//! async fn setup_store() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(AppConfig::default());
//!     let store = StoreFactory::new().from_app_config(&config).await?;
//!     let mut tx = store.begin().await?;
//!     let slots = tx.lock_slots(&[3, 1, 2]).await?;
//!     tx.commit().await?;
//!     println!("locked {} slots", slots.len());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod factory;
pub mod memory;
pub mod postgres;
pub mod store;

pub use client::DbClient;
pub use error::DbError;
pub use factory::StoreFactory;
pub use memory::MemoryStore;
pub use postgres::PgBookingStore;
pub use store::{lock_order, BookingStore, BookingTx, LockKey};

#[cfg(test)]
mod memory_test;
