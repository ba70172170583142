pub mod apps;
pub mod config;
pub mod dns;
pub mod domain;
pub mod engine;
pub mod error;
pub mod init;
pub mod logger;
pub mod policy;
pub mod resolver;
pub mod rules;
pub mod server;
pub mod stats;
pub mod transport;
