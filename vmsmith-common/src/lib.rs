//! # vmsmith Common
//!
//! Shared utilities for the vmsmith binaries.
//!
//! ## Logging
//!
//! ```rust
//! use vmsmith_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(domain = "vm1", "Cloning domain");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
