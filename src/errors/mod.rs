//! # Error Handling
//!
//! Error types shared by every layer of the warden core. Errors are grouped by
//! where they originate (plugin transport, capability boundary, backend
//! business logic, lease lifecycle) so callers can tell a wedged plugin process
//! apart from a backend that answered with a failure.

pub mod types;

pub use types::{Result, WardenError};
