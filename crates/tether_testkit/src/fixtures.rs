//! Test fixtures: sample schema, replica builders and polling helpers.

use crate::loopback::{LoopbackServer, LoopbackSocketFactory};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether_codec::SqlValue;
use tether_protocol::{ReplicaId, Shape, WallClock};
use tether_satellite::{
    BackoffConfig, Migration, Satellite, SatelliteConfig, SatelliteDeps, SatelliteResult,
};
use tether_storage::{DatabaseAdapter, SqliteAdapter};

/// Token accepted by servers built with [`server`].
pub const TEST_TOKEN: &str = "test-token";

/// Endpoint name used by test configurations.
pub const TEST_ENDPOINT: &str = "loopback";

/// Creates a loopback server accepting [`TEST_TOKEN`].
pub fn server() -> LoopbackServer {
    LoopbackServer::new(TEST_TOKEN)
}

/// Version 1 creates `items`, version 2 creates `orders`.
pub fn sample_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            ["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL)"],
        ),
        Migration::new(
            2,
            ["CREATE TABLE orders (id INTEGER PRIMARY KEY, item_id INTEGER NOT NULL, quantity INTEGER)"],
        ),
    ]
}

/// A replica id made of one repeated byte. Higher bytes order higher.
pub fn replica_id(byte: u8) -> ReplicaId {
    ReplicaId::new([byte; 16])
}

/// Configuration with short timeouts and deterministic backoff.
pub fn fast_config(replica: ReplicaId) -> SatelliteConfig {
    SatelliteConfig::new(TEST_ENDPOINT, TEST_TOKEN)
        .with_replica_id(replica)
        .with_migrations(sample_migrations())
        .with_backoff(
            BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(100))
                .with_jitter(0.0),
        )
        .with_connect_timeout(Duration::from_secs(1))
        .with_auth_timeout(Duration::from_secs(1))
        .with_liveness(Duration::from_millis(200), Duration::from_secs(2))
        .with_apply_retry(3, Duration::from_millis(10))
        .with_initial_shapes(vec![Shape::table("items"), Shape::table("orders")])
}

/// Primary key `id = n`.
pub fn id(n: i64) -> Vec<(String, SqlValue)> {
    vec![("id".into(), SqlValue::Integer(n))]
}

/// Builds and starts a satellite against a loopback server.
pub struct ReplicaBuilder {
    name: String,
    server: LoopbackServer,
    config: SatelliteConfig,
    adapter: Option<Arc<dyn DatabaseAdapter>>,
    wall_clock: Option<Arc<dyn WallClock>>,
    file_backed: bool,
}

impl ReplicaBuilder {
    /// A replica called `name`, with replica id `replica`.
    pub fn new(server: &LoopbackServer, name: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            name: name.into(),
            server: server.clone(),
            config: fast_config(replica),
            adapter: None,
            wall_clock: None,
            file_backed: false,
        }
    }

    /// Adjusts the configuration.
    pub fn configure(mut self, f: impl FnOnce(SatelliteConfig) -> SatelliteConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Uses an existing adapter instead of a fresh in-memory database.
    pub fn adapter(mut self, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Uses a fresh SQLite file in a temporary directory.
    pub fn file_backed(mut self) -> Self {
        self.file_backed = true;
        self
    }

    /// Uses another wall clock for the HLC.
    pub fn wall_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.wall_clock = Some(clock);
        self
    }

    /// Opens the database and starts the satellite.
    pub async fn start(self) -> SatelliteResult<TestReplica> {
        let mut dir = None;
        let adapter: Arc<dyn DatabaseAdapter> = match self.adapter {
            Some(adapter) => adapter,
            None if self.file_backed => {
                let temp = TempDir::new().expect("failed to create temp directory");
                let db = SqliteAdapter::open(temp.path().join("replica.db"))?;
                dir = Some(temp);
                Arc::new(db)
            }
            None => Arc::new(SqliteAdapter::open_in_memory()?),
        };
        let factory = Arc::new(LoopbackSocketFactory::new(self.server));
        let mut deps = SatelliteDeps::new(adapter.clone(), factory.clone());
        if let Some(clock) = self.wall_clock {
            deps = deps.with_wall_clock(clock);
        }
        let satellite = Satellite::start(self.name, self.config, deps).await?;
        Ok(TestReplica {
            satellite,
            factory,
            adapter,
            _dir: dir,
        })
    }
}

/// A started satellite and the handles a test needs around it.
pub struct TestReplica {
    /// The satellite.
    pub satellite: Satellite,
    /// Its connection to the loopback server.
    pub factory: Arc<LoopbackSocketFactory>,
    /// Its database.
    pub adapter: Arc<dyn DatabaseAdapter>,
    _dir: Option<TempDir>,
}

impl TestReplica {
    /// Path of the database file, if file backed.
    pub fn path(&self) -> Option<PathBuf> {
        self._dir.as_ref().map(|d| d.path().join("replica.db"))
    }

    /// Takes the replica's network down or brings it back.
    pub fn set_online(&self, online: bool) {
        self.factory.set_online(online);
    }

    /// `name` and `price` of the `items` row with id `n`.
    pub fn item(&self, n: i64) -> Option<Vec<SqlValue>> {
        self.adapter
            .run(
                "SELECT name, price FROM items WHERE id = ?1",
                &[SqlValue::Integer(n)],
            )
            .expect("failed to read items")
            .into_iter()
            .next()
            .map(|row| row.into_values())
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> i64 {
        let rows = self
            .adapter
            .run(&format!("SELECT COUNT(*) FROM {table}"), &[])
            .expect("failed to count rows");
        rows[0].integer(0).expect("count is an integer")
    }
}

impl std::ops::Deref for TestReplica {
    type Target = Satellite;

    fn deref(&self) -> &Self::Target {
        &self.satellite
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `future` with a timeout, panicking if it does not finish.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .expect("timed out")
}
