pub mod config;
pub mod credential;
