//! Shared configuration, error, and logging types for wakegate.
//!
//! Kept deliberately small: this crate has no knowledge of routing, proxying,
//! or process management — it just gives the gateway binary a validated
//! `Config` to start from, a single `Error` taxonomy to return, and one
//! `init_logging` call to set up `tracing`.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
