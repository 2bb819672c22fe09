//! Secret handling utilities.
//!
//! Re-exports secrecy types so credentials travel as `SecretString` from
//! the environment through the token store down to the transport.

pub use secrecy::{ExposeSecret, SecretString};
