//! # Task Engine Testing Utils
//!
//! Shared test doubles for the task engine crates.
//!
//! - **Mock Repositories**: an in-memory `TaskRepository` that applies the same
//!   conditional updates as the SQL stores
//! - **Clock**: a manually advanced clock for deterministic scheduling tests
//! - **Fakes**: scriptable broadcast gateway, notifier and segment directory
//! - **Test Data Builders**: `TaskBuilder` with sensible defaults
//!
//! ```toml
//! [dev-dependencies]
//! taskengine-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod clock;
pub mod fakes;
pub mod mocks;

pub use builders::*;
pub use clock::*;
pub use fakes::*;
pub use mocks::*;
