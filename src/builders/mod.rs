//! Builders
//!
//! Fluent builder for the broker application credentials.

pub mod config;

pub use config::{app_credentials, AppCredentialsBuilder};
