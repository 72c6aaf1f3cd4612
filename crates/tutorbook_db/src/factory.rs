//! Factory for the store backend
//!
//! Picks PostgreSQL when the configuration has a `database` section and the in-memory store
//! otherwise.

use crate::client::DbClient;
use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::postgres::PgBookingStore;
use crate::store::BookingStore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tutorbook_config::{AppConfig, DatabaseConfig};

#[derive(Debug, Clone, Default)]
pub struct StoreFactory;

impl StoreFactory {
    pub fn new() -> Self {
        Self
    }

    /// Builds the store described by the application configuration.
    ///
    /// # Errors
    ///
    /// Fails when a database is configured but cannot be reached or its schema cannot be created.
    pub async fn from_app_config(
        &self,
        config: &Arc<AppConfig>,
    ) -> Result<Arc<dyn BookingStore>, DbError> {
        match config.database.as_ref() {
            Some(db_config) => self.from_db_config(db_config).await,
            None => {
                warn!(
                    "No database configured; using the in-memory store (state is lost on restart)"
                );
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Connects to PostgreSQL and makes sure the schema exists.
    pub async fn from_db_config(
        &self,
        db_config: &DatabaseConfig,
    ) -> Result<Arc<dyn BookingStore>, DbError> {
        debug!("Creating PostgreSQL store from database configuration");
        let client = DbClient::from_config(db_config).await?;
        let store = PgBookingStore::new(client);
        store.init_schema().await?;
        info!("PostgreSQL store ready");
        Ok(Arc::new(store))
    }
}
