//! A [Modbus](https://en.wikipedia.org/wiki/Modbus) stack built on
//! [tokio](https://tokio.rs) that implements both the client (master) and
//! server (slave) roles behind one role-symmetric handler interface, over
//! serial RTU framing and MBAP/TCP framing.
//!
//! Its distinguishing feature is hot-standby failover over a shared serial
//! bus: two servers (or two clients) share one bus and one slave address, and
//! a passive observation state machine decides which of the pair is allowed
//! to speak, counting missed turns and taking over after timing thresholds.
//!
//! # Role symmetry
//!
//! One [`ProtocolHandler`] serves every engine. `on_read` produces data: on
//! the server it answers read requests, on the client it supplies the payload
//! of a write request. `on_write` consumes data: on the server it applies
//! write requests, on the client it receives the values of a read reply. A
//! [`CallbackHandler`] assembles a handler from optional per-register-space
//! closures; absent capabilities fail with illegal-function.
//!
//! # Example: RTU server
//!
//! ```no_run
//! use duobus::{CallbackHandler, RtuServer, SerialContext, SlaveId};
//!
//! # async fn run(port: tokio::net::TcpStream) {
//! let ctx = SerialContext::new(port, 19_200);
//! let server = RtuServer::new(ctx, SlaveId::new(0x11));
//! let mut handler = CallbackHandler {
//!     read_holding_registers: Some(Box::new(|_address, count| {
//!         Ok(vec![0; count as usize])
//!     })),
//!     ..Default::default()
//! };
//! server.serve(&mut handler).await;
//! # }
//! ```
//!
//! # Example: failover pair
//!
//! Wrap each server's context in a [`FailoverConn`]; the primary answers by
//! default, and the failover side takes over when it observes the primary
//! missing its turns on the bus:
//!
//! ```no_run
//! use duobus::{FailoverConn, RtuServer, SerialContext, SlaveId};
//!
//! # fn build(port: tokio::net::TcpStream) -> RtuServer {
//! let ctx = SerialContext::new(port, 19_200);
//! let conn = FailoverConn::new(ctx, true);
//! RtuServer::new_failover(conn, SlaveId::new(0x77))
//! # }
//! ```

/// protocol constants: limits, coil encodings, MBAP header layout
pub mod constants;
/// decode levels controlling wire logging
pub mod decode;
/// error types surfaced by engines and transactions
pub mod error;
/// Modbus exception codes
pub mod exception;
/// failover coordination over a shared serial bus
pub mod failover;
/// the role-symmetric application handler
pub mod handler;
/// serial RTU transport: context, framing, client and server engines
pub mod serial;
/// Modbus TCP transport
pub mod tcp;
/// basic protocol types
pub mod types;

mod common;

pub use crate::common::data::{bools_to_data, data_to_bools, data_to_registers, registers_to_data};
pub use crate::common::function::FunctionCode;
pub use crate::common::pdu::{is_request_reply, match_reply, pdu_size_from_header, Pdu};
pub use crate::decode::{AppDecodeLevel, DecodeLevel, FrameDecodeLevel, PhysDecodeLevel};
pub use crate::error::{
    AduParseError, BatchError, FrameParseError, HandlerError, InvalidRequest, RequestError,
};
pub use crate::exception::ExceptionCode;
pub use crate::failover::{FailoverConn, FailoverMonitor, FailoverRtuClient, FailoverTimings};
pub use crate::handler::{CallbackHandler, ProtocolHandler};
pub use crate::serial::frame::{rtu_bidirectional_size, rtu_size_from_header};
pub use crate::serial::{
    make_pdu_request_headers, make_pdu_request_headers_sized, RtuClient, RtuServer, SerialContext,
    SerialOptions, ShutdownHandle, Stats, TransactionHandle,
};
pub use crate::tcp::{TcpClient, TcpServer, TcpShutdownHandle, TcpTransactionHandle};
pub use crate::types::SlaveId;
