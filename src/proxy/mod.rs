pub mod identity;
pub mod manager;

// Re-export common types
pub use identity::{IdentityRotator, RotationError, TorController};
pub use manager::ProxyManager;
