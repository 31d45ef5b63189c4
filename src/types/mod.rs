//! Credential Types
//!
//! Core type definitions for the credential subsystem.

pub mod callback;
pub mod config;
pub mod token;

pub use callback::*;
pub use config::*;
pub use token::*;
