//! CLI command implementations.
//!
//! # Command Modules
//!
//! - [`run`] - Process a directory of chips (main command)
//! - [`rebuild`] - Reconstruct the registry from finalized outputs
//! - [`audit`] - Report finalized outputs missing from the registry
//! - [`init`] - Configuration initialization
//! - [`config`] - Show the effective configuration

pub mod audit;
pub mod config;
pub mod init;
pub mod rebuild;
pub mod run;
