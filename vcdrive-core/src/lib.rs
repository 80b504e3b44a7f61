pub mod credentials;
pub mod error;

// Re-export the crate-wide result types for convenience
pub use credentials::Credentials;
pub use error::{DriverError, Result};
