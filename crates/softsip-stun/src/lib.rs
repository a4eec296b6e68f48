// softsip - an embedded SIP user agent
// Copyright (C) 2026 The softsip developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! STUN Binding message codec (RFC 5389).
//!
//! Only the Binding method is implemented; the agent uses it to discover its
//! server-reflexive transport address and as a NAT keepalive. Requests and
//! responses share one [`StunMessage`] type; [`peek`] lets the datagram
//! dispatcher tell STUN from SIP without a full decode.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

/// Magic cookie all RFC 5389 messages carry after the length field.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN message types used by the Binding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
}

impl StunMessageType {
    pub fn from_u16(value: u16) -> Option<StunMessageType> {
        match value {
            0x0001 => Some(StunMessageType::BindingRequest),
            0x0101 => Some(StunMessageType::BindingResponse),
            0x0111 => Some(StunMessageType::BindingErrorResponse),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingResponse => 0x0101,
            StunMessageType::BindingErrorResponse => 0x0111,
        }
    }
}

/// Decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Shorter than the 20-byte header or a truncated attribute.
    Truncated,
    /// The magic cookie did not match.
    BadCookie,
    /// Not a Binding message type.
    UnknownType(u16),
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StunError::Truncated => write!(f, "truncated STUN message"),
            StunError::BadCookie => write!(f, "STUN magic cookie mismatch"),
            StunError::UnknownType(t) => write!(f, "unknown STUN message type {:#06x}", t),
        }
    }
}

impl std::error::Error for StunError {}

/// Attributes the Binding exchange cares about; everything else is kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Unknown(u16, Vec<u8>),
}

/// A STUN Binding request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Creates a Binding Request with a random transaction id.
    pub fn binding_request() -> StunMessage {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        StunMessage {
            message_type: StunMessageType::BindingRequest,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Serializes the message, padding attributes to 4-byte boundaries.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 32);
        buf.put_u16(self.message_type.to_u16());
        buf.put_u16(0); // length, patched below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        for attr in &self.attributes {
            write_attribute(&mut buf, attr, &self.transaction_id);
        }

        let attr_len = (buf.len() - HEADER_LEN) as u16;
        buf[2..4].copy_from_slice(&attr_len.to_be_bytes());
        buf.freeze()
    }

    /// Decodes a STUN message, skipping undecodable attributes.
    pub fn from_bytes(data: &[u8]) -> Result<StunMessage, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::Truncated);
        }
        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        let message_type =
            StunMessageType::from_u16(raw_type).ok_or(StunError::UnknownType(raw_type))?;
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::BadCookie);
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_LEN]);

        let end = HEADER_LEN
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or(StunError::Truncated)?;

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > end {
                return Err(StunError::Truncated);
            }
            let attr_data = &data[offset..offset + attr_len];
            attributes.push(parse_attribute(attr_type, attr_data, &transaction_id));
            offset += attr_len + (4 - attr_len % 4) % 4;
        }

        Ok(StunMessage {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// The XOR-MAPPED-ADDRESS value, if present.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// The MAPPED-ADDRESS value, if present.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// The reflexive address, preferring XOR-MAPPED-ADDRESS.
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address().or_else(|| self.mapped_address())
    }
}

/// Cheap classification of a datagram: returns the message type and
/// transaction id when the header shape and cookie match, without decoding
/// attributes.
pub fn peek(data: &[u8]) -> Option<(StunMessageType, [u8; 12])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let message_type = StunMessageType::from_u16(u16::from_be_bytes([data[0], data[1]]))?;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&data[8..HEADER_LEN]);
    Some((message_type, transaction_id))
}

fn write_attribute(buf: &mut BytesMut, attr: &StunAttribute, transaction_id: &[u8; 12]) {
    match attr {
        StunAttribute::MappedAddress(addr) => {
            write_address(buf, ATTR_MAPPED_ADDRESS, *addr, None);
        }
        StunAttribute::XorMappedAddress(addr) => {
            write_address(buf, ATTR_XOR_MAPPED_ADDRESS, *addr, Some(transaction_id));
        }
        StunAttribute::Unknown(attr_type, data) => {
            buf.put_u16(*attr_type);
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
            buf.put_bytes(0, (4 - data.len() % 4) % 4);
        }
    }
}

fn write_address(buf: &mut BytesMut, attr_type: u16, addr: SocketAddr, xor: Option<&[u8; 12]>) {
    let port = match xor {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u16(attr_type);
            buf.put_u16(8);
            buf.put_u8(0);
            buf.put_u8(0x01);
            buf.put_u16(port);
            let raw = u32::from(v4);
            buf.put_u32(if xor.is_some() { raw ^ MAGIC_COOKIE } else { raw });
        }
        IpAddr::V6(v6) => {
            buf.put_u16(attr_type);
            buf.put_u16(20);
            buf.put_u8(0);
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = v6.octets();
            if let Some(id) = xor {
                let key = xor_key_v6(id);
                for (byte, k) in octets.iter_mut().zip(key) {
                    *byte ^= k;
                }
            }
            buf.put_slice(&octets);
        }
    }
}

fn parse_attribute(attr_type: u16, data: &[u8], transaction_id: &[u8; 12]) -> StunAttribute {
    match attr_type {
        ATTR_MAPPED_ADDRESS => match parse_address(data, None) {
            Some(addr) => StunAttribute::MappedAddress(addr),
            None => StunAttribute::Unknown(attr_type, data.to_vec()),
        },
        ATTR_XOR_MAPPED_ADDRESS => match parse_address(data, Some(transaction_id)) {
            Some(addr) => StunAttribute::XorMappedAddress(addr),
            None => StunAttribute::Unknown(attr_type, data.to_vec()),
        },
        _ => StunAttribute::Unknown(attr_type, data.to_vec()),
    }
}

fn parse_address(data: &[u8], xor: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }
    let raw_port = u16::from_be_bytes([data[2], data[3]]);
    let port = match xor {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    match data[1] {
        0x01 => {
            let raw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let ip = Ipv4Addr::from(match xor {
                Some(_) => raw ^ MAGIC_COOKIE,
                None => raw,
            });
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if data.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if let Some(id) = xor {
                let key = xor_key_v6(id);
                for (byte, k) in octets.iter_mut().zip(key) {
                    *byte ^= k;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn xor_key_v6(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}
