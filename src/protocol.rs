//! Wire codec (C1): bit-exact encode/decode of FastCGI record headers and
//! bodies, fixed-endian field access, and the name-value pair stream format
//! used by `PARAMS` and `GET_VALUES`/`GET_VALUES_RESULT`.
//!
//! The record-type enum follows the `FcgiRecType` shape this crate grew
//! out of, widened to the full set of record types FastCGI version 1
//! defines.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{Error, Result};

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

/// Record type, per the FastCGI version 1 wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    fn from_byte(b: u8) -> Result<Self> {
        Self::from_u8(b).ok_or_else(|| Error::WireMalformed(format!("unknown record type {b}")))
    }
}

/// Role requested in `BEGIN_REQUEST`, selects the accepted stream sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

/// `protocol_status` of `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMultiplexConns = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

pub const FLAG_KEEP_CONN: u8 = 0x01;

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,
    pub rec_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub fn new(rec_type: RecordType, request_id: u16, content_length: u16) -> Self {
        let padding_length = Self::padding_for(content_length);
        Header {
            version: VERSION,
            rec_type,
            request_id,
            content_length,
            padding_length,
        }
    }

    /// Padding needed to round `8 + content_length` up to a multiple of 8.
    pub fn padding_for(content_length: u16) -> u8 {
        ((8 - (content_length & 0x7) as u8) & 0x7) as u8
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::WireMalformed("header shorter than 8 bytes".into()));
        }
        Ok(Header {
            version: buf[0],
            rec_type: RecordType::from_byte(buf[1])?,
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.rec_type.to_u8().expect("valid record type"),
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }
}

/// Body of a `BEGIN_REQUEST` record (8 bytes).
#[derive(Debug, Clone, Copy)]
pub struct BeginRequestBody {
    pub role: Role,
    pub flags: u8,
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::WireMalformed("begin-request body too short".into()));
        }
        let role = u16::from_be_bytes([buf[0], buf[1]]);
        Ok(BeginRequestBody {
            role: Role::from_u16(role)
                .ok_or_else(|| Error::WireMalformed(format!("unknown role {role}")))?,
            flags: buf[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let role = (self.role.to_u16().unwrap()).to_be_bytes();
        [role[0], role[1], self.flags, 0, 0, 0, 0, 0]
    }
}

/// Body of an `END_REQUEST` record (8 bytes).
#[derive(Debug, Clone, Copy)]
pub struct EndRequestBody {
    pub app_status: i32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let s = self.app_status.to_be_bytes();
        [
            s[0],
            s[1],
            s[2],
            s[3],
            self.protocol_status.to_u8().unwrap(),
            0,
            0,
            0,
        ]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::WireMalformed("end-request body too short".into()));
        }
        let app_status = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let protocol_status = ProtocolStatus::from_u8(buf[4])
            .ok_or_else(|| Error::WireMalformed(format!("unknown protocol status {}", buf[4])))?;
        Ok(EndRequestBody {
            app_status,
            protocol_status,
        })
    }
}

/// Body of an `UNKNOWN_TYPE` record (8 bytes).
#[derive(Debug, Clone, Copy)]
pub struct UnknownTypeBody {
    pub kind: u8,
}

impl UnknownTypeBody {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        [self.kind, 0, 0, 0, 0, 0, 0, 0]
    }
}

/// Decode one length field of a name-value pair: 1 byte if < 128, else a
/// 4-byte big-endian value with the top bit set (low 31 bits are the length).
/// Returns `(length, bytes_consumed)`, or `None` if `buf` doesn't hold a
/// complete length field yet.
fn decode_length(buf: &[u8]) -> Option<(u32, usize)> {
    let b0 = *buf.first()?;
    if b0 & 0x80 == 0 {
        Some((b0 as u32, 1))
    } else {
        if buf.len() < 4 {
            return None;
        }
        let v = (((b0 & 0x7f) as u32) << 24)
            | ((buf[1] as u32) << 16)
            | ((buf[2] as u32) << 8)
            | buf[3] as u32;
        Some((v, 4))
    }
}

fn encode_length(len: u32, out: &mut Vec<u8>) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.push(((len >> 24) as u8) | 0x80);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

/// Decode one `(name, value)` pair from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` is too short to even hold the length
/// prefixes (caller should wait for more bytes); `Err` when the declared
/// lengths exceed what `buf` actually holds (malformed record).
pub fn process_param_record(buf: &[u8]) -> Result<Option<(usize, Vec<u8>, Vec<u8>)>> {
    let Some((name_len, n1)) = decode_length(buf) else {
        return Ok(None);
    };
    let Some((value_len, n2)) = decode_length(&buf[n1..]) else {
        return Ok(None);
    };
    let header_len = n1 + n2;
    let total = header_len + name_len as usize + value_len as usize;
    if buf.len() < total {
        if buf.len() < header_len {
            return Ok(None);
        }
        return Err(Error::WireMalformed(
            "name-value pair length exceeds buffer".into(),
        ));
    }
    let name = buf[header_len..header_len + name_len as usize].to_vec();
    let value =
        buf[header_len + name_len as usize..header_len + name_len as usize + value_len as usize]
            .to_vec();
    Ok(Some((total, name, value)))
}

/// Encode a single name-value pair using the minimal length form for each
/// field.
pub fn encode_name_value(name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + value.len() + 8);
    encode_length(name.len() as u32, &mut out);
    encode_length(value.len() as u32, &mut out);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    out
}

/// Decode every complete name-value pair in `buf`, returning the pairs found
/// and the number of bytes consumed (a trailing partial pair, if any, is
/// left unconsumed for the caller to prepend to the next record).
pub fn decode_name_value_stream(buf: &[u8]) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, usize)> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match process_param_record(&buf[pos..])? {
            Some((consumed, name, value)) => {
                pairs.push((name, value));
                pos += consumed;
            }
            None => break,
        }
    }
    Ok((pairs, pos))
}
