// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

pub mod config;
pub mod registry;
pub mod server;

pub use registry::RelayRegistry;
pub use server::RelayServer;
