//! # qtask Testing Utils
//!
//! Shared testing utilities for the queued task engine.
//!
//! ## Features
//!
//! - **Database Test Containers**: PostgreSQL test container with migrations applied
//! - **Test Data Builders**: `NewTask` and `WorkerRegistration` builders with sensible defaults
//! - **Recording Hooks**: hook implementations that record every invocation
//! - **Integration Test Helpers**: polling helpers and a fast queue configuration
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! qtask-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
