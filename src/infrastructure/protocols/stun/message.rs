//! STUN binding messages (RFC 5389)
//!
//! Only what reflexive address discovery needs: Binding requests and
//! responses with MAPPED-ADDRESS, XOR-MAPPED-ADDRESS, SOFTWARE and ERROR-CODE.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    #[error("Not a STUN message")]
    NotStun,
    #[error("Unsupported STUN message type {0:#06x}")]
    UnsupportedType(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
}

impl TryFrom<u16> for StunMessageType {
    type Error = StunError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(StunMessageType::BindingRequest),
            0x0101 => Ok(StunMessageType::BindingResponse),
            0x0111 => Ok(StunMessageType::BindingErrorResponse),
            other => Err(StunError::UnsupportedType(other)),
        }
    }
}

impl From<StunMessageType> for u16 {
    fn from(value: StunMessageType) -> Self {
        match value {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingResponse => 0x0101,
            StunMessageType::BindingErrorResponse => 0x0111,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Software(String),
    ErrorCode { code: u16, reason: String },
    /// Anything else, kept undecoded
    Other(u16, Bytes),
}

/// XOR-MAPPED-ADDRESS obfuscation; applying it twice restores the address
fn xor_address(address: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = address.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match address.ip() {
        IpAddr::V4(ip) => IpAddr::V4(Ipv4Addr::from(u32::from(ip) ^ MAGIC_COOKIE)),
        IpAddr::V6(ip) => {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(transaction_id);
            IpAddr::V6(Ipv6Addr::from(u128::from(ip) ^ u128::from_be_bytes(key)))
        }
    };
    SocketAddr::new(ip, port)
}

fn put_address(out: &mut BytesMut, address: SocketAddr) {
    out.put_u8(0);
    match address.ip() {
        IpAddr::V4(ip) => {
            out.put_u8(FAMILY_V4);
            out.put_u16(address.port());
            out.put_u32(ip.into());
        }
        IpAddr::V6(ip) => {
            out.put_u8(FAMILY_V6);
            out.put_u16(address.port());
            out.put_u128(ip.into());
        }
    }
}

fn get_address(mut value: &[u8]) -> Option<SocketAddr> {
    if value.remaining() < 4 {
        return None;
    }
    value.advance(1);
    let family = value.get_u8();
    let port = value.get_u16();
    let ip = match family {
        FAMILY_V4 if value.remaining() >= 4 => IpAddr::V4(Ipv4Addr::from(value.get_u32())),
        FAMILY_V6 if value.remaining() >= 16 => IpAddr::V6(Ipv6Addr::from(value.get_u128())),
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

impl StunAttribute {
    fn decode(kind: u16, value: &[u8], transaction_id: &TransactionId) -> Self {
        let decoded = match kind {
            ATTR_MAPPED_ADDRESS => get_address(value).map(StunAttribute::MappedAddress),
            ATTR_XOR_MAPPED_ADDRESS => get_address(value)
                .map(|masked| StunAttribute::XorMappedAddress(xor_address(masked, transaction_id))),
            ATTR_SOFTWARE => std::str::from_utf8(value)
                .ok()
                .map(|s| StunAttribute::Software(s.to_string())),
            ATTR_ERROR_CODE if value.len() >= 4 => Some(StunAttribute::ErrorCode {
                code: (value[2] & 0x07) as u16 * 100 + value[3] as u16,
                reason: String::from_utf8_lossy(&value[4..]).into_owned(),
            }),
            _ => None,
        };
        decoded.unwrap_or_else(|| StunAttribute::Other(kind, Bytes::copy_from_slice(value)))
    }

    fn encode(&self, out: &mut BytesMut, transaction_id: &TransactionId) {
        let mut value = BytesMut::new();
        let kind = match self {
            StunAttribute::MappedAddress(address) => {
                put_address(&mut value, *address);
                ATTR_MAPPED_ADDRESS
            }
            StunAttribute::XorMappedAddress(address) => {
                put_address(&mut value, xor_address(*address, transaction_id));
                ATTR_XOR_MAPPED_ADDRESS
            }
            StunAttribute::Software(software) => {
                value.put_slice(software.as_bytes());
                ATTR_SOFTWARE
            }
            StunAttribute::ErrorCode { code, reason } => {
                value.put_u16(0);
                value.put_u8((code / 100) as u8);
                value.put_u8((code % 100) as u8);
                value.put_slice(reason.as_bytes());
                ATTR_ERROR_CODE
            }
            StunAttribute::Other(kind, data) => {
                value.put_slice(data);
                *kind
            }
        };
        out.put_u16(kind);
        out.put_u16(value.len() as u16);
        out.put_slice(&value);
        out.put_bytes(0, (4 - value.len() % 4) % 4);
    }
}

/// Fixed 20 byte header, readable without decoding attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunHeader {
    pub message_type: u16,
    pub length: u16,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: StunMessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Binding request with a random transaction id
    pub fn binding_request() -> Self {
        Self {
            message_type: StunMessageType::BindingRequest,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// Binding success response reporting `mapped` as the reflexive address
    pub fn binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::BindingResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Header of `data` if its leading bits, magic cookie and length say
    /// STUN. SIP text never passes: its first byte has the top bits set.
    pub fn peek(data: &[u8]) -> Option<StunHeader> {
        if data.len() < HEADER_LEN || data[0] & 0xC0 != 0 {
            return None;
        }
        let mut header = &data[..HEADER_LEN];
        let message_type = header.get_u16();
        let length = header.get_u16();
        if header.get_u32() != MAGIC_COOKIE
            || length % 4 != 0
            || HEADER_LEN + length as usize > data.len()
        {
            return None;
        }
        let mut transaction_id = [0u8; 12];
        header.copy_to_slice(&mut transaction_id);
        Some(StunHeader {
            message_type,
            length,
            transaction_id,
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, StunError> {
        let header = Self::peek(data).ok_or(StunError::NotStun)?;
        let message_type = StunMessageType::try_from(header.message_type)?;

        let mut body = &data[HEADER_LEN..HEADER_LEN + header.length as usize];
        let mut attributes = Vec::new();
        while body.remaining() >= 4 {
            let kind = body.get_u16();
            let length = body.get_u16() as usize;
            if length > body.remaining() {
                break;
            }
            attributes.push(StunAttribute::decode(kind, &body[..length], &header.transaction_id));
            let padded = (length + 3) & !3;
            body.advance(padded.min(body.remaining()));
        }

        Ok(Self {
            message_type,
            transaction_id: header.transaction_id,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + 32);
        out.put_u16(self.message_type.into());
        out.put_u16(0);
        out.put_u32(MAGIC_COOKIE);
        out.put_slice(&self.transaction_id);
        for attribute in &self.attributes {
            attribute.encode(&mut out, &self.transaction_id);
        }
        let length = (out.len() - HEADER_LEN) as u16;
        out[2..4].copy_from_slice(&length.to_be_bytes());
        out.freeze()
    }

    /// Reflexive address, preferring XOR-MAPPED-ADDRESS
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|attribute| match attribute {
            StunAttribute::XorMappedAddress(address) => Some(*address),
            _ => None,
        });
        xor.or_else(|| {
            self.attributes.iter().find_map(|attribute| match attribute {
                StunAttribute::MappedAddress(address) => Some(*address),
                _ => None,
            })
        })
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attribute| match attribute {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
}
