pub mod logging;
pub mod metrics;
pub mod shutdown;

// Re-export common functions and types
pub use logging::init_logging;
pub use metrics::{RunMetrics, RequestTimer};
pub use shutdown::shutdown_signal;
