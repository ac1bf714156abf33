pub mod config;
pub mod crypto;
pub mod error;
pub mod mutation_manager;
pub mod mutators;
pub mod protocol;
pub mod security;
pub mod server;
pub mod session;
pub mod sql;
pub mod tls;
pub mod types;

pub use error::{TdeError, TdeResult};
