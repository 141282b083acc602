//! Common code shared between `sign_server` and `sign_client`.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
