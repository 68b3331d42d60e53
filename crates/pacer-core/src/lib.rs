pub mod backoff;
pub mod clock;
pub mod ids;
pub mod model;

pub use backoff::*;
pub use clock::*;
pub use ids::*;
pub use model::*;
