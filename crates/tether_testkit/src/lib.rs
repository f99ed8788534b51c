//! # Tether Testkit
//!
//! Test utilities for Tether.
//!
//! This crate provides:
//! - An in-memory relay server and socket factory with failure injection
//! - An execution adapter wrapper that fails chosen statements
//! - Fixtures: a sample schema, replica builders and polling helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn replicas_converge() {
//!     let server = server();
//!     let a = ReplicaBuilder::new(&server, "a", replica_id(1)).start().await.unwrap();
//!     // ... write through `a`, observe another replica
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod flaky;
pub mod loopback;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::flaky::*;
    pub use crate::init_tracing;
    pub use crate::loopback::*;
}

pub use fixtures::*;
pub use flaky::*;
pub use loopback::*;

use tracing_subscriber::EnvFilter;

/// Installs a test-friendly `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
