//! Connection Management
//!
//! [`ConnectionManager`] maps connection ids to live drivers. Drivers are built by an
//! injectable [`DriverFactory`], so tests can swap in fakes and builds without an
//! engine feature report [`QuarryError::UnsupportedEngine`] instead of failing to link.
//!
//! `connect` and `disconnect` on the same id are serialized by a per-id async lock;
//! different ids proceed in parallel.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{ConnectionConfig, DatabaseType, Driver, QueryResult};
use crate::error::{QuarryError, Result};

/// Builds a fresh, disconnected driver for an engine
pub trait DriverFactory: Send + Sync {
    fn create(&self, engine: DatabaseType) -> Result<Arc<dyn Driver>>;
}

/// Factory for the engines compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineDriverFactory;

impl DriverFactory for EngineDriverFactory {
    fn create(&self, engine: DatabaseType) -> Result<Arc<dyn Driver>> {
        match engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => Ok(Arc::new(crate::engine::postgres::PostgresDriver::new())),
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => Ok(Arc::new(crate::engine::mysql::MySqlDriver::new())),
            #[cfg(feature = "mssql")]
            DatabaseType::Mssql => Ok(Arc::new(crate::engine::mssql::MssqlDriver::new())),
            #[cfg(feature = "mongodb")]
            DatabaseType::MongoDB => Ok(Arc::new(crate::engine::mongodb::MongoDriver::new())),
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => Ok(Arc::new(crate::engine::sqlite::SqliteDriver::new())),
            #[allow(unreachable_patterns)]
            other => Err(QuarryError::unsupported_engine(format!(
                "{} support is not compiled into this build",
                other.display_name()
            ))),
        }
    }
}

/// Registry of live connections keyed by caller-chosen id
pub struct ConnectionManager {
    factory: Arc<dyn DriverFactory>,
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
    id_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(Arc::new(EngineDriverFactory))
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self { factory, drivers: RwLock::new(HashMap::new()), id_locks: Mutex::new(HashMap::new()) }
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.id_locks.lock().entry(id.to_string()).or_default().clone()
    }

    /// Forget the lock for an unmapped `id` once no other task holds or awaits it
    fn release_id_lock(&self, id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.id_locks.lock();
        // The map's clone plus ours
        if Arc::strong_count(&lock) == 2 && locks.get(id).is_some_and(|held| Arc::ptr_eq(held, &lock)) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn tracked_ids(&self) -> usize {
        self.id_locks.lock().len()
    }

    /// Connect `id`, replacing any existing connection under that id
    ///
    /// On failure the half-built driver is disconnected and `id` stays unmapped.
    pub async fn connect(&self, id: &str, config: &ConnectionConfig) -> Result<()> {
        let lock = self.id_lock(id);
        let connected = {
            let _guard = lock.lock().await;
            self.replace_driver(id, config).await
        };
        if connected.is_err() {
            self.release_id_lock(id, lock);
        }
        connected
    }

    async fn replace_driver(&self, id: &str, config: &ConnectionConfig) -> Result<()> {
        let previous = self.drivers.write().remove(id);
        if let Some(old) = previous {
            if old.is_connected() {
                if let Err(e) = old.disconnect().await {
                    warn!(connection = %id, error = %e, "failed to disconnect replaced connection");
                }
            }
        }

        let driver = self.factory.create(config.engine)?;
        if let Err(e) = driver.connect(config).await {
            if let Err(cleanup) = driver.disconnect().await {
                debug!(connection = %id, error = %cleanup, "cleanup after failed connect also failed");
            }
            warn!(connection = %id, engine = %config.engine, code = e.error_code(), "connect failed");
            return Err(e);
        }

        info!(connection = %id, engine = %config.engine, "connected");
        self.drivers.write().insert(id.to_string(), driver);
        Ok(())
    }

    /// Disconnect and forget `id`; unknown ids are a no-op
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id);
        let disconnected = {
            let _guard = lock.lock().await;
            let driver = self.drivers.write().remove(id);
            match driver {
                Some(driver) => {
                    info!(connection = %id, "disconnecting");
                    driver.disconnect().await
                }
                None => Ok(()),
            }
        };
        self.release_id_lock(id, lock);
        disconnected
    }

    /// Disconnect every connection concurrently. Never fails; the map ends empty.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Arc<dyn Driver>)> = self.drivers.write().drain().collect();
        self.id_locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
        if drained.is_empty() {
            return;
        }

        let handles = drained.into_iter().map(|(id, driver)| {
            tokio::spawn(async move {
                if let Err(e) = driver.disconnect().await {
                    warn!(connection = %id, error = %e, "disconnect failed during shutdown");
                }
            })
        });

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "disconnect task panicked during shutdown");
            }
        }
    }

    #[must_use]
    pub fn get_driver(&self, id: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().get(id).cloned()
    }

    /// Ids of all mapped connections, sorted
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_connected(&self, id: &str) -> bool {
        self.get_driver(id).is_some_and(|d| d.is_connected())
    }

    /// Run a query on `id`; failures are reported in [`QueryResult::error`]
    pub async fn execute_query(
        &self,
        id: &str,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> QueryResult {
        let Some(driver) = self.get_driver(id) else {
            return QueryResult::failed(&QuarryError::not_found(format!("Connection '{id}' not found")));
        };
        match driver.execute_query(sql, limit, offset).await {
            Ok(result) => result,
            Err(e) => {
                debug!(connection = %id, code = e.error_code(), "query failed");
                QueryResult::failed(&e)
            }
        }
    }

    /// Cancel the in-flight query on `id`
    pub async fn cancel_query(&self, id: &str) -> Result<()> {
        let driver = self
            .get_driver(id)
            .ok_or_else(|| QuarryError::not_found(format!("Connection '{id}' not found")))?;
        driver.cancel_query().await
    }

    /// Connect with a throwaway driver and return the connect latency in ms
    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<u64> {
        let driver = self.factory.create(config.engine)?;
        let start = Instant::now();
        let connected = driver.connect(config).await;
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let Err(e) = driver.disconnect().await {
            debug!(error = %e, "disconnect after connection test failed");
        }
        connected.map(|()| elapsed)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sqlite_connection_lifecycle() {
        let manager = ConnectionManager::default();
        manager.connect("local", &ConnectionConfig::sqlite(":memory:")).await.unwrap();

        assert!(manager.is_connected("local"));
        assert_eq!(manager.connection_ids(), vec!["local"]);

        let result = manager.execute_query("local", "SELECT 1 AS one", None, None).await;
        assert!(result.is_ok());
        assert_eq!(result.rows[0]["one"], serde_json::json!(1));

        manager.disconnect("local").await.unwrap();
        assert!(manager.get_driver("local").is_none());
        manager.disconnect("local").await.unwrap();
    }

    #[test]
    fn test_factory_builds_matching_disconnected_drivers() {
        for engine in DatabaseType::ALL {
            match EngineDriverFactory.create(engine) {
                Ok(driver) => {
                    assert_eq!(driver.engine(), engine);
                    assert!(!driver.is_connected());
                }
                Err(e) => assert_eq!(e.error_code(), "UNSUPPORTED_ENGINE"),
            }
        }
    }

    #[tokio::test]
    async fn test_id_locks_are_released_when_unmapped() {
        let manager = ConnectionManager::default();
        manager.connect("a", &ConnectionConfig::sqlite(":memory:")).await.unwrap();
        manager.connect("b", &ConnectionConfig::sqlite(":memory:")).await.unwrap();
        assert_eq!(manager.tracked_ids(), 2);

        manager.disconnect("a").await.unwrap();
        assert_eq!(manager.tracked_ids(), 1);
        manager.disconnect("never-connected").await.unwrap();
        assert_eq!(manager.tracked_ids(), 1);

        let err = manager.connect("c", &ConnectionConfig::new(DatabaseType::SQLite)).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert_eq!(manager.tracked_ids(), 1);

        // A replaced connection that fails leaves its id unmapped too
        let err = manager.connect("b", &ConnectionConfig::new(DatabaseType::SQLite)).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(manager.get_driver("b").is_none());
        assert_eq!(manager.tracked_ids(), 0);
    }

    #[tokio::test]
    async fn test_execute_on_unknown_connection() {
        let manager = ConnectionManager::default();
        let result = manager.execute_query("nope", "SELECT 1", None, None).await;
        assert!(result.error.unwrap().contains("Connection 'nope' not found"));
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let manager = ConnectionManager::default();
        manager.test_connection(&ConnectionConfig::sqlite(":memory:")).await.unwrap();
        assert!(manager.connection_ids().is_empty());

        let err = manager.test_connection(&ConnectionConfig::new(DatabaseType::SQLite)).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }
}
