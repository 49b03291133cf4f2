// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod snapshot;
pub mod upgrade;
pub mod ws;

pub use error::{Error, Result};
pub use protocol::*;
pub use queue::DispatchQueue;
pub use snapshot::{Handshake, SocketSnapshot, TransportSnapshot};
