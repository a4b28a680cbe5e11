pub mod atlas;
pub mod material;
pub mod textures;

pub use atlas::*;
pub use material::*;
pub use textures::*;
