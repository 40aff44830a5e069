pub mod archive;
pub mod config;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod log_sanitize;
pub mod logging;
pub mod ops;
pub mod orchestrator;
pub mod pipeline;
pub mod remote;
pub mod schedule;
pub mod tools;

pub use error::{Error, ErrorKind, Result};
