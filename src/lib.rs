pub mod agent;
pub mod client;
pub mod comms;
pub mod issuer;
pub mod security;
pub mod state;
pub mod transport;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
