pub mod handler;
pub mod types;

pub use handler::{DnsEngine, EngineDeps};
