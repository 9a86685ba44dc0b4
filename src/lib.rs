//! passwd-driver - change a login password by driving the interactive passwd program.

pub mod backend;
pub mod config;
pub mod passwd;
