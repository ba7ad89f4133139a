pub mod cli;
pub mod config;
pub mod ingest;
pub mod process;
pub mod wire;
