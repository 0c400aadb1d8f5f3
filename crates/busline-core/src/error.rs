//! Error Types for busline Core
//!
//! Errors raised while building or validating core model values. None of these
//! come from the network; transports wrap them into their own error type.
//!
//! ## Error Categories
//!
//! - `InvalidConnectionString`: a connection string is malformed or inconsistent
//! - `InvalidEndpoint`: an endpoint URI has no usable host
//! - `InvalidArgument`: a model value violates its constraints (empty entity name, ...)

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
