//! Backend module for spawning and supervising the password-change program.

mod process;

pub use process::*;
