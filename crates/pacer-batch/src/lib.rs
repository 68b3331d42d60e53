//! Adaptive batching in front of a rate-limited, detection-sensitive service.

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod outcome;
pub mod pause;
pub mod window;

pub use config::*;
pub use coordinator::*;
pub use detector::*;
pub use outcome::*;
pub use pause::*;
pub use window::*;
