pub mod config;
pub mod doctor;
pub mod session;

pub use config::*;
pub use doctor::*;
pub use session::*;
