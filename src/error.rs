use std::fmt::{Display, Formatter};

use crate::exception::ExceptionCode;

/// Errors that terminate a transaction or an engine.
///
/// Only [`RequestError::Io`] and [`RequestError::Shutdown`] cause `serve` to
/// return; all other variants surface on the transaction reply channel or are
/// absorbed into the [`Stats`](crate::serial::Stats) counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// An I/O error on the underlying stream
    Io(std::io::ErrorKind),
    /// A frame could not be extracted from the stream
    BadFrame(FrameParseError),
    /// A request could not be constructed from the given parameters
    BadRequest(InvalidRequest),
    /// A reply was received but its contents are not valid
    BadResponse(AduParseError),
    /// The server replied with an exception
    ServerException {
        /// the raw function code of the exception reply (high bit set)
        function: u8,
        /// the exception code carried in the reply
        code: ExceptionCode,
    },
    /// A local handler rejected the operation
    Handler(HandlerError),
    /// Timeout occurred before receiving a reply from the server
    ResponseTimeout,
    /// The engine was shut down while the operation was pending
    Shutdown,
}

impl std::error::Error for RequestError {}

impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            RequestError::Io(kind) => write!(f, "i/o error: {kind}"),
            RequestError::BadFrame(err) => write!(f, "{err}"),
            RequestError::BadRequest(err) => write!(f, "{err}"),
            RequestError::BadResponse(err) => write!(f, "{err}"),
            RequestError::ServerException { function, code } => write!(
                f,
                "server replied with exception: {:02X} {:02X} ({})",
                function,
                code.to_u8(),
                code
            ),
            RequestError::Handler(err) => write!(f, "{err}"),
            RequestError::ResponseTimeout => {
                f.write_str("timeout occurred before receiving a reply from the server")
            }
            RequestError::Shutdown => f.write_str("the engine was shut down"),
        }
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<FrameParseError> for RequestError {
    fn from(err: FrameParseError) -> Self {
        RequestError::BadFrame(err)
    }
}

impl From<InvalidRequest> for RequestError {
    fn from(err: InvalidRequest) -> Self {
        RequestError::BadRequest(err)
    }
}

impl From<AduParseError> for RequestError {
    fn from(err: AduParseError) -> Self {
        RequestError::BadResponse(err)
    }
}

impl From<HandlerError> for RequestError {
    fn from(err: HandlerError) -> Self {
        RequestError::Handler(err)
    }
}

impl From<scursor::ReadError> for RequestError {
    fn from(_: scursor::ReadError) -> Self {
        RequestError::BadResponse(AduParseError::InsufficientBytes)
    }
}

/// Errors that occur while extracting a frame from a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameParseError {
    /// The frame is too short to carry a PDU and a checksum
    FrameTooShort(usize),
    /// The trailing CRC does not match the frame contents
    CrcValidationFailure,
    /// Received an MBAP header with a non-Modbus protocol id
    UnknownProtocolId(u16),
    /// The MBAP length field is below the minimum of unit id + function code
    MbapLengthTooSmall(usize),
    /// The MBAP length field exceeds the configured maximum frame size
    MbapLengthTooBig(usize, usize),
}

impl std::error::Error for FrameParseError {}

impl Display for FrameParseError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FrameParseError::FrameTooShort(len) => {
                write!(f, "frame of {len} bytes is too short to contain a PDU")
            }
            FrameParseError::CrcValidationFailure => {
                f.write_str("frame CRC does not match its contents")
            }
            FrameParseError::UnknownProtocolId(id) => {
                write!(
                    f,
                    "received MBAP header with non-Modbus protocol id: {id:#06X}"
                )
            }
            FrameParseError::MbapLengthTooSmall(len) => {
                write!(f, "MBAP length of {len} is below the minimum of 3")
            }
            FrameParseError::MbapLengthTooBig(len, max) => {
                write!(f, "MBAP length of {len} exceeds the maximum of {max}")
            }
        }
    }
}

/// Errors that result from bad request parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidRequest {
    /// The requested count cannot be carried by this function code in one packet
    CountTooBigForType(u16, u16),
    /// start + count exceeds the Modbus address space
    AddressOverflow(u16, u16),
    /// A slave id above the unicast maximum of 247
    SlaveIdOutOfRange(u64),
    /// The function code cannot carry a write payload
    NotAWriteFunction(u8),
}

impl std::error::Error for InvalidRequest {}

impl Display for InvalidRequest {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            InvalidRequest::CountTooBigForType(count, max) => write!(
                f,
                "count of {count} exceeds the maximum of {max} for this function"
            ),
            InvalidRequest::AddressOverflow(start, count) => write!(
                f,
                "start == {start} and count == {count} would exceed the address space"
            ),
            InvalidRequest::SlaveIdOutOfRange(value) => {
                write!(f, "slave id {value} is outside the range 0..=247")
            }
            InvalidRequest::NotAWriteFunction(fc) => {
                write!(f, "function code {fc:#04X} cannot carry a write payload")
            }
        }
    }
}

/// Errors that occur while interpreting a received PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AduParseError {
    /// The PDU is too short to be valid
    InsufficientBytes,
    /// The declared byte count does not match the number of bytes present
    ByteCountMismatch(usize, usize),
    /// A received packet does not pair with the outstanding request
    UnexpectedReply,
}

impl std::error::Error for AduParseError {}

impl Display for AduParseError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            AduParseError::InsufficientBytes => f.write_str("PDU is too short to be valid"),
            AduParseError::ByteCountMismatch(declared, actual) => write!(
                f,
                "declared byte count ({declared}) does not match the bytes present ({actual})"
            ),
            AduParseError::UnexpectedReply => {
                f.write_str("received packet does not pair with the outstanding request")
            }
        }
    }
}

/// Errors returned by [`ProtocolHandler`](crate::handler::ProtocolHandler)
/// callbacks. Servers turn these into exception replies via
/// [`HandlerError::to_exception`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerError {
    /// Reply with this specific exception code
    Exception(ExceptionCode),
    /// The handler declares no capability for this function code
    NotSupported,
    /// The handler failed in an unspecified way
    Failure,
}

impl HandlerError {
    /// The exception code to place in an exception reply: a known code maps to
    /// itself, a missing capability to illegal-function, and anything else to
    /// server-device-failure.
    pub fn to_exception(self) -> ExceptionCode {
        match self {
            HandlerError::Exception(code) => code,
            HandlerError::NotSupported => ExceptionCode::IllegalFunction,
            HandlerError::Failure => ExceptionCode::ServerDeviceFailure,
        }
    }
}

impl std::error::Error for HandlerError {}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            HandlerError::Exception(code) => write!(f, "handler error: {code}"),
            HandlerError::NotSupported => f.write_str("this function code is not supported"),
            HandlerError::Failure => f.write_str("handler failure"),
        }
    }
}

impl From<ExceptionCode> for HandlerError {
    fn from(code: ExceptionCode) -> Self {
        HandlerError::Exception(code)
    }
}

/// Error returned by a batch of transactions, carrying the index of the
/// request that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchError {
    /// index of the request that failed
    pub index: usize,
    /// the failure itself
    pub source: RequestError,
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl Display for BatchError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "transaction {} failed: {}", self.index, self.source)
    }
}
