pub mod artifact;
pub mod baseline;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod evidence;
pub mod io;
pub mod job;
pub mod merge_ready;
pub mod paths;
pub mod queue;
pub mod readiness;
pub mod rules;
pub mod runner;
pub mod types;

#[cfg(test)]
mod testutil;

pub use error::{Result, TollgateError};
