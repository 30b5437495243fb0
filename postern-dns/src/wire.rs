//! DNS wire format: single-question queries and answer-section parsing.
//!
//! Only what the mail path needs: A, AAAA, TXT and MX records, with
//! pointer-compressed names. Responses larger than one UDP datagram are not
//! followed up over TCP.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;

const CLASS_IN: u16 = 1;
const FLAG_RD: u16 = 0x0100;
const MAX_NAME_JUMPS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("name label exceeds 63 bytes")]
    LabelTooLong,

    #[error("name exceeds 255 bytes")]
    NameTooLong,

    #[error("truncated packet at offset {0}")]
    Truncated(usize),

    #[error("compression pointer loop")]
    PointerLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NxDomain,
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::FormatError,
            2 => Self::ServerFailure,
            3 => Self::NxDomain,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Character-strings concatenated, as SPF/DKIM consumers expect.
    Txt(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    pub data: RData,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: ResponseCode,
    pub answers: Vec<Answer>,
}

/// Builds a single-question recursive query.
///
/// # Errors
///
/// Fails when `name` violates label or total length limits.
pub fn build_query(id: u16, name: &str, rtype: u16) -> Result<Vec<u8>, WireError> {
    let mut packet = Vec::with_capacity(12 + name.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    let trimmed = name.trim_end_matches('.');
    if trimmed.len() > 255 {
        return Err(WireError::NameTooLong);
    }
    for label in trimmed.split('.') {
        if label.len() > 63 {
            return Err(WireError::LabelTooLong);
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&rtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

fn read_u8(buf: &[u8], off: &mut usize) -> Result<u8, WireError> {
    let value = *buf.get(*off).ok_or(WireError::Truncated(*off))?;
    *off += 1;
    Ok(value)
}

fn read_u16(buf: &[u8], off: &mut usize) -> Result<u16, WireError> {
    let hi = read_u8(buf, off)?;
    let lo = read_u8(buf, off)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32, WireError> {
    let hi = read_u16(buf, off)?;
    let lo = read_u16(buf, off)?;
    Ok((u32::from(hi) << 16) | u32::from(lo))
}

/// Reads a possibly-compressed name starting at `*off`, leaving `*off` just
/// past the name as stored there (pointers consume two bytes).
fn read_name(buf: &[u8], off: &mut usize) -> Result<String, WireError> {
    let mut name = String::new();
    let mut pos = *off;
    let mut jumped = false;
    let mut jumps = 0usize;

    loop {
        let mut cursor = pos;
        let len = read_u8(buf, &mut cursor)?;

        if len & 0xC0 == 0xC0 {
            let second = read_u8(buf, &mut cursor)?;
            if !jumped {
                *off = cursor;
                jumped = true;
            }
            jumps += 1;
            if jumps > MAX_NAME_JUMPS {
                return Err(WireError::PointerLoop);
            }
            pos = ((usize::from(len & 0x3F)) << 8) | usize::from(second);
            continue;
        }

        if len == 0 {
            if !jumped {
                *off = cursor;
            }
            return Ok(name);
        }

        let end = cursor + usize::from(len);
        let label = buf.get(cursor..end).ok_or(WireError::Truncated(cursor))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos = end;
    }
}

/// Parses a response packet down to its answer records.
///
/// # Errors
///
/// Fails on truncation or compression loops. An error `RCODE` is not an
/// error here; the resolver layer interprets it.
pub fn parse_response(buf: &[u8]) -> Result<Response, WireError> {
    let mut off = 0usize;

    let id = read_u16(buf, &mut off)?;
    let flags = read_u16(buf, &mut off)?;
    let qdcount = read_u16(buf, &mut off)?;
    let ancount = read_u16(buf, &mut off)?;
    let _nscount = read_u16(buf, &mut off)?;
    let _arcount = read_u16(buf, &mut off)?;

    for _ in 0..qdcount {
        read_name(buf, &mut off)?;
        off += 4; // QTYPE + QCLASS
        if off > buf.len() {
            return Err(WireError::Truncated(off));
        }
    }

    let mut answers = Vec::with_capacity(usize::from(ancount));
    for _ in 0..ancount {
        let name = read_name(buf, &mut off)?;
        let rtype = read_u16(buf, &mut off)?;
        let _class = read_u16(buf, &mut off)?;
        let ttl = read_u32(buf, &mut off)?;
        let rdlen = usize::from(read_u16(buf, &mut off)?);
        let rdata_end = off + rdlen;
        if rdata_end > buf.len() {
            return Err(WireError::Truncated(off));
        }

        let data = match rtype {
            TYPE_A if rdlen == 4 => {
                RData::A(Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3]))
            }
            TYPE_AAAA if rdlen == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[off..off + 16]);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            TYPE_TXT => {
                let mut text = String::new();
                let mut cursor = off;
                while cursor < rdata_end {
                    let chunk = usize::from(read_u8(buf, &mut cursor)?);
                    let end = (cursor + chunk).min(rdata_end);
                    text.push_str(&String::from_utf8_lossy(&buf[cursor..end]));
                    cursor = end;
                }
                RData::Txt(text)
            }
            TYPE_MX => {
                let mut cursor = off;
                let preference = read_u16(buf, &mut cursor)?;
                let exchange = read_name(buf, &mut cursor)?;
                RData::Mx {
                    preference,
                    exchange,
                }
            }
            _ => RData::Other,
        };

        off = rdata_end;
        answers.push(Answer {
            name,
            rtype,
            ttl,
            data,
        });
    }

    Ok(Response {
        id,
        rcode: ResponseCode::from((flags & 0x000F) as u8),
        answers,
    })
}
