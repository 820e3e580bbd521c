// Module declarations
pub mod config;
pub mod extensions;
pub mod logging;

pub use config::ShimConfig;
pub use logging::ExtensionLogger;
