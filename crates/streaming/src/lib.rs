pub mod cache;
pub mod command;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod update_state;

pub use cache::*;
pub use command::*;
pub use provider::*;
pub use queue::*;
pub use scheduler::*;
pub use update_state::*;
