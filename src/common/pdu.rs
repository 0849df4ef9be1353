use std::fmt::{Display, Formatter};

use crate::common::function::FunctionCode;
use crate::constants::limits;
use crate::error::{AduParseError, InvalidRequest};
use crate::exception::ExceptionCode;

/// A Modbus Protocol Data Unit: the transport-independent function code plus
/// body, without any framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    bytes: Vec<u8>,
}

impl Pdu {
    /// the raw bytes of the PDU
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// the raw function byte, zero when the PDU is empty
    pub fn raw_function(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// the function code, `None` for exception replies and unsupported codes
    pub fn function_code(&self) -> Option<FunctionCode> {
        FunctionCode::get(self.raw_function())
    }

    /// the starting address carried in a request header
    pub fn address(&self) -> u16 {
        field_u16(&self.bytes, 1)
    }

    /// The number of values a request concerns. Single-value functions always
    /// report 1 without reading past the address field.
    pub fn request_count(&self) -> u16 {
        match self.function_code() {
            Some(fc) if fc.is_single() => 1,
            _ => field_u16(&self.bytes, 3),
        }
    }

    /// Check a received request for errors a server must reject before
    /// dispatching: minimum length and a supported function code. Value and
    /// address checks happen in [`Pdu::request_values`] and at dispatch.
    pub fn validate_request(&self) -> Result<(), ExceptionCode> {
        if self.function_code().is_none() {
            return Err(ExceptionCode::IllegalFunction);
        }
        if self.bytes.len() < 3 {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    /// The values carried by a write request. Enforces the declared byte
    /// count, the value-count/byte-count consistency, and the address range.
    /// With `over_size` the declared byte count is ignored and the length is
    /// taken from the quantity field instead.
    pub fn request_values(&self, over_size: bool) -> Result<&[u8], ExceptionCode> {
        let fc = match self.function_code() {
            Some(fc) => fc,
            None => return Err(ExceptionCode::IllegalFunction),
        };
        if fc.is_single() {
            if self.bytes.len() != 5 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            return Ok(&self.bytes[3..]);
        }
        let data_len = self.bytes.len().saturating_sub(6);
        if data_len < 1 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if !over_size && data_len != self.bytes[5] as usize {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let count = self.request_count() as usize;
        if count + self.address() as usize > limits::ADDRESS_SPACE as usize {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let expected = if fc.is_uint16() {
            count * 2
        } else {
            (count + 7) / 8
        };
        if data_len != expected || count == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Ok(&self.bytes[6..])
    }

    /// the values carried by a read reply
    pub fn reply_values(&self) -> Result<&[u8], AduParseError> {
        let data_len = self.bytes.len().saturating_sub(2);
        if data_len < 1 {
            return Err(AduParseError::InsufficientBytes);
        }
        if data_len != self.bytes[1] as usize {
            return Err(AduParseError::ByteCountMismatch(
                self.bytes[1] as usize,
                data_len,
            ));
        }
        Ok(&self.bytes[2..])
    }

    /// Build the reply to a read request from the data produced by a handler.
    pub fn make_read_reply(&self, data: &[u8]) -> Pdu {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(self.raw_function());
        bytes.push(data.len() as u8);
        bytes.extend_from_slice(data);
        Pdu { bytes }
    }

    /// Build a full write request by appending handler data to a request
    /// header produced by [`FunctionCode::make_request_header`].
    pub fn make_write_request(&self, data: &[u8]) -> Result<Pdu, InvalidRequest> {
        let header_len = match self.function_code() {
            Some(fc) if fc.is_single() => 3,
            Some(fc) if fc.is_write_to_server() => 6,
            _ => return Err(InvalidRequest::NotAWriteFunction(self.raw_function())),
        };
        let mut bytes = self.bytes[..header_len.min(self.bytes.len())].to_vec();
        bytes.extend_from_slice(data);
        Ok(Pdu { bytes })
    }

    /// Build the reply to a successful write request: the first five bytes of
    /// the request echoed back.
    pub fn make_write_reply(&self) -> Pdu {
        if self.bytes.len() > 5 {
            return Pdu {
                bytes: self.bytes[..5].to_vec(),
            };
        }
        self.clone()
    }

    /// Build the exception reply to this request.
    pub fn exception_reply(&self, code: ExceptionCode) -> Pdu {
        Pdu {
            bytes: vec![self.raw_function() | 0x80, code.to_u8()],
        }
    }
}

impl From<Vec<u8>> for Pdu {
    fn from(bytes: Vec<u8>) -> Self {
        Pdu { bytes }
    }
}

impl From<&[u8]> for Pdu {
    fn from(bytes: &[u8]) -> Self {
        Pdu {
            bytes: bytes.to_vec(),
        }
    }
}

impl AsRef<[u8]> for Pdu {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Display for Pdu {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

pub(crate) struct PduDisplay<'a> {
    level: crate::decode::AppDecodeLevel,
    pdu: &'a Pdu,
}

impl<'a> PduDisplay<'a> {
    pub(crate) fn new(level: crate::decode::AppDecodeLevel, pdu: &'a Pdu) -> Self {
        PduDisplay { level, pdu }
    }
}

impl std::fmt::Display for PduDisplay<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.pdu.function_code() {
            Some(fc) => write!(f, "{fc}")?,
            None => write!(f, "FC {:#04X}", self.pdu.raw_function())?,
        }
        if self.level.data_enabled() {
            write!(f, " {}", self.pdu)?;
        }
        Ok(())
    }
}

fn field_u16(bytes: &[u8], offset: usize) -> u16 {
    match (bytes.get(offset), bytes.get(offset + 1)) {
        (Some(&hi), Some(&lo)) => (hi as u16) << 8 | lo as u16,
        _ => 0,
    }
}

/// true if `reply`'s function code answers `request`, counting exception
/// replies as a match.
pub fn match_reply(request: &[u8], reply: &[u8]) -> bool {
    match (request.first(), reply.first()) {
        (Some(&req), Some(&rep)) => req == rep % 128,
        _ => false,
    }
}

/// Test whether two PDUs form a completed request/reply pair, for passive
/// observation of third-party transactions. Both sizes must be exactly what
/// their headers imply, and the FC-specific fields must be consistent: a read
/// reply's byte count must match the requested quantity, a write reply must
/// echo the request's first five bytes.
pub fn is_request_reply(request: &[u8], reply: &[u8], over_size: bool) -> bool {
    let fc = match (request.first(), reply.first()) {
        (Some(&req), Some(&rep)) if req == rep => match FunctionCode::get(req) {
            Some(fc) => fc,
            None => return false,
        },
        _ => return false,
    };
    if pdu_size_from_header(request, false, over_size) != request.len() {
        return false;
    }
    if pdu_size_from_header(reply, true, over_size) != reply.len() {
        return false;
    }
    let count = Pdu::from(request).request_count();
    match fc {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            ((count + 7) / 8) as u8 == reply[1]
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            (count * 2) as u8 == reply[1]
        }
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => request[..5] == reply[..5],
    }
}

/// The expected size of a PDU given a partial prefix of it. When the prefix
/// does not yet determine the size, the shortest length that would is
/// returned. `is_client` means a client is reading a server-originated packet.
pub fn pdu_size_from_header(header: &[u8], is_client: bool, over_size: bool) -> usize {
    if header.len() < 2 {
        return 2;
    }
    let (exception, value) = FunctionCode::separate_error(header[0]);
    let fc = match FunctionCode::get(value) {
        Some(fc) if !exception => fc,
        // exception replies and unknown codes carry only fc + one byte
        _ => return 2,
    };
    if is_client == fc.is_write_to_server() {
        // header-only packets: write replies and read requests
        return 5;
    }
    if is_client {
        // read replies: fc, byte count, data
        return 2 + header[1] as usize;
    }
    if fc.is_single() {
        // fc, address, one value
        return 5;
    }
    // multi-value writes: fc, address, count, byte count, data
    if header.len() < 6 {
        return 6;
    }
    if over_size {
        let count = field_u16(header, 3) as usize;
        if fc.is_uint16() {
            return 6 + count * 2;
        }
        return 6 + (count.saturating_sub(1)) / 8 + 1;
    }
    6 + header[5] as usize
}
