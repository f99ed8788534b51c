//! Schema migrations.
//!
//! A migration bundle is an ordered list of DDL batches numbered from 1
//! with no gaps. Applied versions are recorded with a checksum; reopening
//! a database with a bundle that rewrites history fails instead of
//! silently diverging.

use crate::error::{SatelliteError, SatelliteResult};
use crate::schema::unix_millis;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tether_codec::SqlValue;
use tether_storage::{AdapterExt, DatabaseAdapter, Transaction};
use tracing::{debug, info};

/// One schema migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Schema version this migration produces.
    pub version: u32,
    /// Hex SHA-256 over the statements.
    pub checksum: String,
    /// DDL statements, executed in order.
    pub statements: Vec<String>,
    /// Lowest protocol version able to replicate the resulting schema.
    pub min_protocol_version: u16,
}

impl Migration {
    /// Creates a migration and computes its checksum.
    pub fn new<S: Into<String>>(version: u32, statements: impl IntoIterator<Item = S>) -> Self {
        let statements: Vec<String> = statements.into_iter().map(Into::into).collect();
        let checksum = checksum(&statements);
        Self {
            version,
            checksum,
            statements,
            min_protocol_version: 1,
        }
    }

    /// Sets the minimum protocol version.
    pub fn with_min_protocol_version(mut self, version: u16) -> Self {
        self.min_protocol_version = version;
        self
    }
}

/// Computes the checksum of a statement list.
///
/// Each statement is length-prefixed so that moving text across statement
/// boundaries changes the digest.
pub fn checksum(statements: &[String]) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update((statement.len() as u64).to_be_bytes());
        hasher.update(statement.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<u32>,
    /// Schema version after the run.
    pub current_version: u32,
}

/// Applies a migration bundle to a database.
#[derive(Debug, Clone)]
pub struct Migrator {
    bundle: Vec<Migration>,
    protocol_version: u16,
}

impl Migrator {
    /// Creates a migrator for `bundle`, running under `protocol_version`.
    pub fn new(bundle: Vec<Migration>, protocol_version: u16) -> Self {
        Self {
            bundle,
            protocol_version,
        }
    }

    /// Latest version in the bundle.
    pub fn target_version(&self) -> u32 {
        self.bundle.last().map_or(0, |m| m.version)
    }

    /// Checks the bundle, verifies recorded history and applies every
    /// pending migration, each in its own transaction.
    pub fn apply(&self, adapter: &dyn DatabaseAdapter) -> SatelliteResult<MigrationReport> {
        self.validate_bundle()?;
        let history = applied_history(adapter)?;
        self.verify_history(&history)?;

        let current = history.keys().next_back().copied().unwrap_or(0);
        let mut report = MigrationReport {
            applied: Vec::new(),
            current_version: current,
        };

        for migration in self.bundle.iter().filter(|m| m.version > current) {
            if migration.min_protocol_version > self.protocol_version {
                return Err(SatelliteError::IncompatibleSchema {
                    version: migration.version,
                    required: migration.min_protocol_version,
                    supported: self.protocol_version,
                });
            }
            adapter.transact(|tx| run_migration(tx, migration))?;
            info!(
                version = migration.version,
                statements = migration.statements.len(),
                "applied migration"
            );
            report.applied.push(migration.version);
            report.current_version = migration.version;
        }

        if report.applied.is_empty() {
            debug!(version = current, "schema up to date");
        }
        Ok(report)
    }

    fn validate_bundle(&self) -> SatelliteResult<()> {
        for (idx, migration) in self.bundle.iter().enumerate() {
            let expected = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            if migration.version != expected {
                return Err(SatelliteError::schema_integrity(format!(
                    "bundle has version {} at position {}, expected {}",
                    migration.version,
                    idx + 1,
                    expected
                )));
            }
            if migration.checksum != checksum(&migration.statements) {
                return Err(SatelliteError::schema_integrity(format!(
                    "migration {} checksum does not match its statements",
                    migration.version
                )));
            }
        }
        Ok(())
    }

    fn verify_history(&self, history: &BTreeMap<u32, String>) -> SatelliteResult<()> {
        for (version, recorded) in history {
            let bundled = self
                .bundle
                .iter()
                .find(|m| m.version == *version)
                .ok_or_else(|| {
                    SatelliteError::schema_integrity(format!(
                        "applied migration {version} is missing from the bundle"
                    ))
                })?;
            if &bundled.checksum != recorded {
                return Err(SatelliteError::schema_integrity(format!(
                    "migration {version} was modified after being applied"
                )));
            }
        }
        Ok(())
    }
}

fn run_migration(tx: &mut dyn Transaction, migration: &Migration) -> SatelliteResult<()> {
    for statement in &migration.statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT INTO _tether_migrations (version, checksum, applied_at) VALUES (?1, ?2, ?3)",
        &[
            SqlValue::Integer(i64::from(migration.version)),
            SqlValue::Text(migration.checksum.clone()),
            SqlValue::Integer(unix_millis()),
        ],
    )?;
    Ok(())
}

fn applied_history(adapter: &dyn DatabaseAdapter) -> SatelliteResult<BTreeMap<u32, String>> {
    let rows = adapter.run(
        "SELECT version, checksum FROM _tether_migrations ORDER BY version",
        &[],
    )?;
    let mut history = BTreeMap::new();
    for row in rows {
        let version = u32::try_from(row.integer(0)?)
            .map_err(|_| SatelliteError::schema_integrity("negative migration version"))?;
        history.insert(version, row.text(1)?.to_string());
    }
    Ok(history)
}

/// Current schema version recorded in the database.
pub fn current_version(adapter: &dyn DatabaseAdapter) -> SatelliteResult<u32> {
    Ok(applied_history(adapter)?
        .keys()
        .next_back()
        .copied()
        .unwrap_or(0))
}
