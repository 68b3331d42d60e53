pub mod coordinator;
pub mod error;
pub mod outcome;

pub use coordinator::*;
pub use error::*;
pub use outcome::*;
