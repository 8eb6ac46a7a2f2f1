pub mod api;
pub mod envelope;
pub mod error;

pub use api::*;
pub use envelope::{Envelope, Signed};
pub use error::{ApiError, ConduitError};

/// Protocol version stamped into every envelope. Mismatched versions are a
/// logged advisory, never a hard failure.
pub const WIRE_VERSION: &str = env!("CARGO_PKG_VERSION");
