// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("not connected")]
    NotConnected,

    #[error("request timeout")]
    RequestTimeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(String),
}
