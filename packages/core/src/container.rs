//! MTP container codec.
//!
//! Every MTP transfer is a container: a 12-byte little-endian header
//! (total length, container type, operation/response code, transaction id)
//! followed by either up to five u32 parameters or a dataset payload.

use crate::error::{Error, Result};

/// Size of the container header in bytes.
pub const HEADER_LEN: usize = 12;

/// Most parameters a command or response container may carry.
pub const MAX_PARAMS: usize = 5;

/// Longest MTP string in UTF-16 units, excluding the terminator.
const MAX_STRING_UNITS: usize = 254;

/// Operation codes understood by the responder.
pub mod op {
    pub const OPEN_SESSION: u16 = 0x1002;
    pub const CLOSE_SESSION: u16 = 0x1003;
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    pub const GET_STORAGE_INFO: u16 = 0x1005;
}

/// Response codes.
pub mod response {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const INVALID_STORAGE_ID: u16 = 0x2008;
    pub const INVALID_PARAMETER: u16 = 0x201D;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
}

/// Container type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    Command,
    Data,
    Response,
    Event,
}

impl ContainerType {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Command),
            2 => Some(Self::Data),
            3 => Some(Self::Response),
            4 => Some(Self::Event),
            _ => None,
        }
    }

    fn as_raw(self) -> u16 {
        match self {
            Self::Command => 1,
            Self::Data => 2,
            Self::Response => 3,
            Self::Event => 4,
        }
    }
}

/// A decoded container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
    pub payload: Vec<u8>,
}

impl Container {
    /// Builds a response container carrying `params`.
    pub fn response(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Self {
            kind: ContainerType::Response,
            code,
            transaction_id,
            payload: params.iter().flat_map(|p| p.to_le_bytes()).collect(),
        }
    }

    /// Builds the data phase of operation `code`.
    pub fn data(code: u16, transaction_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: ContainerType::Data,
            code,
            transaction_id,
            payload,
        }
    }

    /// Decodes one container from the start of `buf`.
    ///
    /// Bytes past the length declared in the header are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }

        let length = read_u32(buf, 0) as usize;
        if length < HEADER_LEN || length > buf.len() {
            return Err(malformed(format!(
                "declared length {} does not fit {} received bytes",
                length,
                buf.len()
            )));
        }

        let raw_kind = read_u16(buf, 4);
        let kind = ContainerType::from_raw(raw_kind)
            .ok_or_else(|| malformed(format!("unknown container type {raw_kind}")))?;

        Ok(Self {
            kind,
            code: read_u16(buf, 6),
            transaction_id: read_u32(buf, 8),
            payload: buf[HEADER_LEN..length].to_vec(),
        })
    }

    /// Encodes the container, header included.
    pub fn encode(&self) -> Vec<u8> {
        let length = (HEADER_LEN + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(length as usize);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.kind.as_raw().to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.transaction_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Returns the u32 parameters of a command or response container.
    pub fn params(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .take(MAX_PARAMS)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Returns parameter `index`, or 0 when the host omitted it.
    pub fn param(&self, index: usize) -> u32 {
        self.params().get(index).copied().unwrap_or(0)
    }
}

/// Builder for dataset payloads.
#[derive(Debug, Default)]
pub struct Dataset {
    buf: Vec<u8>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Appends a u32 element count followed by the elements.
    pub fn u32_array(&mut self, values: &[u32]) -> &mut Self {
        self.u32(values.len() as u32);
        for value in values {
            self.u32(*value);
        }
        self
    }

    /// Appends an MTP string: a u8 count of UTF-16 units including the NUL
    /// terminator, then the units. The empty string is a single zero byte.
    /// Text beyond 254 units is truncated, never splitting a surrogate pair.
    pub fn string(&mut self, value: &str) -> &mut Self {
        let mut units: Vec<u16> = value.encode_utf16().take(MAX_STRING_UNITS).collect();
        if units.last().is_some_and(|u| (0xD800..0xDC00).contains(u)) {
            units.pop();
        }
        if units.is_empty() {
            self.buf.push(0);
            return self;
        }
        units.push(0);
        self.buf.push(units.len() as u8);
        for unit in units {
            self.u16(unit);
        }
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Decodes an MTP string at the start of `buf`.
///
/// Returns the text and the number of bytes consumed.
pub fn read_string(buf: &[u8]) -> Result<(String, usize)> {
    let Some(&count) = buf.first() else {
        return Err(malformed("missing string length".to_string()));
    };
    let count = count as usize;
    let consumed = 1 + count * 2;
    if buf.len() < consumed {
        return Err(malformed(format!("string of {count} units is truncated")));
    }

    let units: Vec<u16> = buf[1..consumed]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    let text = String::from_utf16(&units)
        .map_err(|_| malformed("string is not valid UTF-16".to_string()))?;
    Ok((text, consumed))
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn malformed(reason: String) -> Error {
    Error::MalformedContainer { reason }
}
