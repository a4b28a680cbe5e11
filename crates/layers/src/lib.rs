pub mod color;
pub mod colormap;
pub mod elevation;
pub mod interpretation;
pub mod layer;
pub mod update;

pub use color::*;
pub use colormap::*;
pub use elevation::*;
pub use interpretation::*;
pub use layer::*;
pub use update::inherited_texture;
