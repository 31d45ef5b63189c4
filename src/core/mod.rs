//! Core Components
//!
//! HTTP transport, CSRF state and consent presentation.

pub mod presenter;
pub mod state;
pub mod transport;

pub use presenter::*;
pub use state::*;
pub use transport::*;
