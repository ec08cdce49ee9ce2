//! Everything wired together from one configuration

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::connection::ConnectionEvents;
use crate::coroutine::{CoroutineHandle, CoroutineScheduler, Sequence};
use crate::driver::{Connector, MySqlConnector};
use crate::error::Result;
use crate::manager::{QueryFuture, QueryManager};
use crate::pool::ConnectionPool;
use crate::query::Query;

/// The event manager, pool, query manager and coroutine scheduler of one
/// application, built from a [`DatabaseConfig`].
///
/// Nothing here is global: build one `Runtime` and pass it (or its parts)
/// to whatever needs database access.
pub struct Runtime {
    config: DatabaseConfig,
    events: Arc<ConnectionEvents>,
    pool: ConnectionPool,
    manager: QueryManager,
    scheduler: CoroutineScheduler,
}

impl Runtime {
    /// Validate the configuration and build every component. No connection is opened yet.
    pub fn new(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(ConnectionEvents::new());
        let pool = ConnectionPool::new(&config, connector, Arc::clone(&events))?;
        let manager = QueryManager::new(pool.clone(), config.max_execution_time());
        let scheduler = CoroutineScheduler::new(config.coroutine.clone()).with_pool(pool.clone());

        info!(
            names = ?pool.names().collect::<Vec<_>>(),
            "database runtime ready"
        );
        Ok(Self {
            config,
            events,
            pool,
            manager,
            scheduler,
        })
    }

    /// Build a runtime talking to MySQL.
    pub fn mysql(config: DatabaseConfig) -> Result<Self> {
        Self::new(config, Arc::new(MySqlConnector::new()))
    }

    /// Load the configuration (file plus `STRAND_*` overrides) and build a MySQL runtime.
    pub fn from_config_file(path: Option<&Path>) -> Result<Self> {
        Self::mysql(DatabaseConfig::load(path)?)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Where `connection.state_changed.*` events are published.
    pub fn events(&self) -> &Arc<ConnectionEvents> {
        &self.events
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &CoroutineScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut CoroutineScheduler {
        &mut self.scheduler
    }

    pub fn execute(&self, query: Query) -> QueryFuture {
        self.manager.execute(query)
    }

    pub fn spawn(&mut self, sequence: Box<dyn Sequence>) -> CoroutineHandle {
        self.scheduler.spawn(sequence)
    }

    /// Start the periodic pool reaper. Abort the handle to stop it.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.pool.spawn_reaper()
    }

    /// Drive coroutines until none is live. The coroutine pool is trimmed
    /// periodically while they run, and once more at the end.
    pub async fn run_until_idle(&mut self) {
        self.scheduler.run_until_idle().await;
        self.scheduler.trim_pool();
    }

    /// Close every connection and cancel every waiter.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
