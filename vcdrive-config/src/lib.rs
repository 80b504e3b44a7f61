pub mod config;
pub mod loader;

pub use config::{DriverConfig, TimeoutConfig, VcenterConfig};
pub use loader::ConfigLoader;
