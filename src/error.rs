use std::io;
use thiserror::Error;

use crate::protocol::codec::CodecError;

/// Prefix attached to every error message synthesized for the client.
pub const ERROR_PREFIX: &str = "pgtde";

#[derive(Error, Debug)]
pub enum TdeError {
    /// Query uses protected columns in a way the rewriter cannot support.
    #[error("pgtde: {0}")]
    Query(String),
    #[error("pgtde: {0}")]
    Unsupported(String),
    #[error("pgtde: {0}")]
    Crypto(String),
    #[error("pgtde: unable to parse query: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TdeError {
    pub fn query(message: impl Into<String>) -> Self {
        TdeError::Query(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        TdeError::Unsupported(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        TdeError::Crypto(message.into())
    }

    /// SQLSTATE reported to the client when this error replaces a server response.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            TdeError::Query(_) => "42000",
            TdeError::Unsupported(_) => "0A000",
            TdeError::Parse(_) => "42601",
            TdeError::Protocol(_) => "08P01",
            _ => "XX000",
        }
    }
}

pub type TdeResult<T> = Result<T, TdeError>;
