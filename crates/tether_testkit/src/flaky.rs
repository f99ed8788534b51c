//! Failure injection for the execution adapter.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_codec::SqlValue;
use tether_storage::{DatabaseAdapter, Row, StorageError, StorageResult, Transaction};

struct Rule {
    needle: String,
    remaining: u32,
}

/// Wraps an adapter and fails statements containing a given text.
///
/// Failures are reported as [`StorageError::Busy`], so callers see them as
/// transient.
pub struct FlakyAdapter {
    inner: Arc<dyn DatabaseAdapter>,
    rule: Mutex<Option<Rule>>,
    failures: AtomicU64,
}

impl FlakyAdapter {
    /// Wraps `inner` without injecting anything.
    pub fn new(inner: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            inner,
            rule: Mutex::new(None),
            failures: AtomicU64::new(0),
        }
    }

    /// Fails the next `times` statements whose SQL contains `needle`.
    pub fn fail_statements(&self, needle: impl Into<String>, times: u32) {
        *self.rule.lock() = Some(Rule {
            needle: needle.into(),
            remaining: times,
        });
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        *self.rule.lock() = None;
    }

    /// Statements failed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, sql: &str) -> StorageResult<()> {
        let mut rule = self.rule.lock();
        if let Some(active) = rule.as_mut() {
            if active.remaining > 0 && sql.contains(&active.needle) {
                active.remaining -= 1;
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::Busy);
            }
        }
        Ok(())
    }
}

impl DatabaseAdapter for FlakyAdapter {
    fn run(&self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        self.check(sql)?;
        self.inner.run(sql, params)
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.inner.transaction(&mut |tx| {
            let mut flaky = FlakyTransaction { inner: tx, adapter: self };
            body(&mut flaky)
        })
    }
}

impl fmt::Debug for FlakyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlakyAdapter")
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

struct FlakyTransaction<'a> {
    inner: &'a mut dyn Transaction,
    adapter: &'a FlakyAdapter,
}

impl Transaction for FlakyTransaction<'_> {
    fn run(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        self.adapter.check(sql)?;
        self.inner.run(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<usize> {
        self.adapter.check(sql)?;
        self.inner.execute(sql, params)
    }

    fn execute_batch(&mut self, sql: &str) -> StorageResult<()> {
        self.adapter.check(sql)?;
        self.inner.execute_batch(sql)
    }
}
