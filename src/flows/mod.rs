//! Authorization Flows
//!
//! The interactive authorization-code flow and the redirect receivers it
//! listens with.

pub mod authorization_code;
pub mod redirect;

pub use authorization_code::{
    AuthorizationFlow, FlowOptions, FlowState, InteractiveAuthorizationFlow, MockAuthorizationFlow,
};
pub use redirect::{LocalRedirectListener, ManualRedirectReceiver, RedirectReceiver};
