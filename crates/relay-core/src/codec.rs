// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::{Error, Packet, Result};

pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

pub fn encode_packet(packet: &Packet) -> Result<String> {
    let text = serde_json::to_string(packet)?;
    if text.len() > MAX_PACKET_SIZE {
        return Err(Error::Other(format!("packet too large: {} bytes", text.len())));
    }
    Ok(text)
}

pub fn decode_packet(text: &str) -> Result<Packet> {
    if text.len() > MAX_PACKET_SIZE {
        return Err(Error::Other(format!("packet too large: {} bytes", text.len())));
    }
    serde_json::from_str(text).map_err(|e| Error::InvalidPacket(e.to_string()))
}
