pub mod config;
pub mod file;
pub mod map;
