//! Process-wide registry of running satellites, keyed by database name.

use crate::config::SatelliteConfig;
use crate::error::{SatelliteError, SatelliteResult};
use crate::process::{Satellite, SatelliteDeps};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// At most one running satellite per database name.
///
/// Start and stop for the same name are serialized by one async lock, so
/// two concurrent starts never produce two satellites.
#[derive(Debug, Default)]
pub struct Registry {
    satellites: Mutex<HashMap<String, Arc<Satellite>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running satellite for `name`, starting one if needed.
    ///
    /// A satellite that has stopped, for example after a fatal error, is
    /// replaced.
    pub async fn start(
        &self,
        name: &str,
        config: SatelliteConfig,
        deps: SatelliteDeps,
    ) -> SatelliteResult<Arc<Satellite>> {
        let mut satellites = self.satellites.lock().await;
        if let Some(existing) = satellites.get(name) {
            if existing.is_running() {
                return Ok(existing.clone());
            }
            info!(db = %name, "replacing stopped satellite");
        }
        let satellite = Arc::new(Satellite::start(name, config, deps).await?);
        satellites.insert(name.to_string(), satellite.clone());
        Ok(satellite)
    }

    /// Registers a satellite started elsewhere.
    pub async fn register(&self, satellite: Arc<Satellite>) -> SatelliteResult<()> {
        let mut satellites = self.satellites.lock().await;
        if let Some(existing) = satellites.get(satellite.name()) {
            if existing.is_running() {
                return Err(SatelliteError::AlreadyRunning(satellite.name().to_string()));
            }
        }
        satellites.insert(satellite.name().to_string(), satellite);
        Ok(())
    }

    /// Returns the satellite registered for `name`.
    pub async fn get(&self, name: &str) -> Option<Arc<Satellite>> {
        self.satellites.lock().await.get(name).cloned()
    }

    /// Names of registered databases, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.satellites.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops and removes the satellite for `name`.
    pub async fn stop(&self, name: &str) -> SatelliteResult<()> {
        let mut satellites = self.satellites.lock().await;
        let satellite = satellites
            .remove(name)
            .ok_or_else(|| SatelliteError::NotRunning(name.to_string()))?;
        satellite.stop().await;
        Ok(())
    }

    /// Stops every registered satellite.
    pub async fn stop_all(&self) {
        let mut satellites = self.satellites.lock().await;
        for (name, satellite) in satellites.drain() {
            satellite.stop().await;
            info!(db = %name, "satellite removed from registry");
        }
    }
}
