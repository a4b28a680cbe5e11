pub mod bounds;
pub mod extent;
pub mod ids;
pub mod pitch;
pub mod time;

// Foundation crate: small, well-tested primitives only.
pub use bounds::*;
pub use extent::*;
pub use ids::*;
pub use pitch::*;
pub use time::*;
