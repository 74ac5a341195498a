pub mod cli;
pub mod communicator;
pub mod config;
