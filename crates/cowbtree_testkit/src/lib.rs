//! # cowbtree testkit
//!
//! Test utilities for cowbtree.
//!
//! This crate provides:
//! - Store fixtures, in memory or on a temporary log file
//! - Property-based generators for keys and operation sequences
//! - An integration harness that checks a store against a shadow model
//! - Crash and torn-write helpers for recovery tests
//! - Concurrent stress drivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cowbtree_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
