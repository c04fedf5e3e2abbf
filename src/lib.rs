// Library exports for testing

#[macro_use]
pub mod output;
pub mod backend;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod nrepl;
pub mod protocol;
pub mod resilience;
pub mod session;
