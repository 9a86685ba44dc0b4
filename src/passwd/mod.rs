//! Password-change conversation with the `passwd` backend.

mod classifier;
mod error;
mod handler;
mod machine;
mod queue;
mod state;

pub use classifier::*;
pub use error::*;
pub use handler::*;
pub use machine::*;
pub use queue::*;
pub use state::*;
