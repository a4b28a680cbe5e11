pub mod node;
pub mod tree;

pub use node::*;
pub use tree::*;
