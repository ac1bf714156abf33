//! Client session plumbing between the sockets and the protocol decoder.

pub mod filter;

pub use filter::{FilterOutput, FilterSettings, TdeFilter, Transport};
