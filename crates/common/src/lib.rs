//! Shared error plumbing for the reverb workspace.
//!
//! Each crate defines its own `Error` enum; this crate carries the glue that
//! lets them all offer the same `.context()` ergonomics without depending on
//! each other.

mod error;

pub use error::{Error, FromMessage, Result};
