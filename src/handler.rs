//! The role-symmetric application handler.
//!
//! The same callbacks serve both sides of the protocol: a server produces
//! data in `on_read` when answering a read request, and a client produces
//! data in `on_read` when it is about to ship a write request. Likewise a
//! server consumes data in `on_write` for a write request, and a client
//! consumes data in `on_write` when a read reply arrives.

use crate::common::data::{bools_to_data, data_to_bools, data_to_registers, registers_to_data};
use crate::common::function::FunctionCode;
use crate::common::pdu::Pdu;
use crate::error::HandlerError;

/// Application callbacks dispatched by every engine in this crate.
pub trait ProtocolHandler: Send {
    /// Produce the data for a request. Called on the server for a
    /// read-from-server function, and on the client to obtain the payload of
    /// a write-to-server request before it is transmitted.
    fn on_read(&mut self, req: &Pdu) -> Result<Vec<u8>, HandlerError>;

    /// Consume the data of a completed operation. Called on the server for a
    /// write-to-server function, and on the client when a read reply arrives.
    fn on_write(&mut self, req: &Pdu, data: &[u8]) -> Result<(), HandlerError>;

    /// Called on the client when the server answers `req` with a well-formed
    /// exception reply.
    fn on_error(&mut self, req: &Pdu, exception: &Pdu) {
        let _ = (req, exception);
    }
}

pub type BitsReader = Box<dyn FnMut(u16, u16) -> Result<Vec<bool>, HandlerError> + Send>;
pub type BitsWriter = Box<dyn FnMut(u16, &[bool]) -> Result<(), HandlerError> + Send>;
pub type RegistersReader = Box<dyn FnMut(u16, u16) -> Result<Vec<u16>, HandlerError> + Send>;
pub type RegistersWriter = Box<dyn FnMut(u16, &[u16]) -> Result<(), HandlerError> + Send>;
pub type ErrorCallback = Box<dyn FnMut(&Pdu, &Pdu) + Send>;

/// A [`ProtocolHandler`] assembled from optional callbacks, one pair per
/// register space. A capability is declared by supplying the callback;
/// functions whose callback is absent fail with illegal-function.
#[derive(Default)]
pub struct CallbackHandler {
    /// server side FC 2
    pub read_discrete_inputs: Option<BitsReader>,
    /// client side FC 2
    pub write_discrete_inputs: Option<BitsWriter>,
    /// server side FC 1, client side FC 5 & 15
    pub read_coils: Option<BitsReader>,
    /// server side FC 5 & 15, client side FC 1
    pub write_coils: Option<BitsWriter>,
    /// server side FC 4
    pub read_input_registers: Option<RegistersReader>,
    /// client side FC 4
    pub write_input_registers: Option<RegistersWriter>,
    /// server side FC 3, client side FC 6 & 16
    pub read_holding_registers: Option<RegistersReader>,
    /// server side FC 6 & 16, client side FC 3
    pub write_holding_registers: Option<RegistersWriter>,
    /// exception replies received from the server
    pub on_error: Option<ErrorCallback>,
}

impl ProtocolHandler for CallbackHandler {
    fn on_read(&mut self, req: &Pdu) -> Result<Vec<u8>, HandlerError> {
        let fc = req.function_code().ok_or(HandlerError::NotSupported)?;
        let address = req.address();
        let count = req.request_count();

        match fc {
            FunctionCode::ReadDiscreteInputs => {
                let callback = self
                    .read_discrete_inputs
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                Ok(bools_to_data(&callback(address, count)?, fc)?)
            }
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => {
                let callback = self.read_coils.as_mut().ok_or(HandlerError::NotSupported)?;
                Ok(bools_to_data(&callback(address, count)?, fc)?)
            }
            FunctionCode::ReadInputRegisters => {
                let callback = self
                    .read_input_registers
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                Ok(registers_to_data(&callback(address, count)?))
            }
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => {
                let callback = self
                    .read_holding_registers
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                Ok(registers_to_data(&callback(address, count)?))
            }
        }
    }

    fn on_write(&mut self, req: &Pdu, data: &[u8]) -> Result<(), HandlerError> {
        let fc = req.function_code().ok_or(HandlerError::NotSupported)?;
        let address = req.address();
        let count = req.request_count();

        match fc {
            FunctionCode::ReadDiscreteInputs => {
                let callback = self
                    .write_discrete_inputs
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                callback(address, &data_to_bools(data, count, fc)?)
            }
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => {
                let callback = self.write_coils.as_mut().ok_or(HandlerError::NotSupported)?;
                callback(address, &data_to_bools(data, count, fc)?)
            }
            FunctionCode::ReadInputRegisters => {
                let callback = self
                    .write_input_registers
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                callback(address, &data_to_registers(data)?)
            }
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => {
                let callback = self
                    .write_holding_registers
                    .as_mut()
                    .ok_or(HandlerError::NotSupported)?;
                callback(address, &data_to_registers(data)?)
            }
        }
    }

    fn on_error(&mut self, req: &Pdu, exception: &Pdu) {
        if let Some(callback) = self.on_error.as_mut() {
            callback(req, exception);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionCode;

    #[test]
    fn missing_capability_is_not_supported() {
        let mut handler = CallbackHandler::default();
        let req = Pdu::from(&[0x03, 0x00, 0x6B, 0x00, 0x03][..]);
        assert_eq!(handler.on_read(&req), Err(HandlerError::NotSupported));
        assert_eq!(
            handler.on_write(&req, &[0x00, 0x01]),
            Err(HandlerError::NotSupported)
        );
    }

    #[test]
    fn read_holding_registers_produces_payload() {
        let mut handler = CallbackHandler {
            read_holding_registers: Some(Box::new(|address, count| {
                assert_eq!(address, 0x6B);
                assert_eq!(count, 3);
                Ok(vec![0xAE41, 0x5652, 0x4340])
            })),
            ..Default::default()
        };
        let req = Pdu::from(&[0x03, 0x00, 0x6B, 0x00, 0x03][..]);
        assert_eq!(
            handler.on_read(&req).unwrap(),
            vec![0xAE, 0x41, 0x56, 0x52, 0x43, 0x40]
        );
    }

    #[test]
    fn single_coil_write_dispatches_to_coil_space() {
        let mut handler = CallbackHandler {
            write_coils: Some(Box::new(|address, values| {
                assert_eq!(address, 0x00AC);
                assert_eq!(values, &[true]);
                Ok(())
            })),
            ..Default::default()
        };
        let req = Pdu::from(&[0x05, 0x00, 0xAC, 0xFF, 0x00][..]);
        handler.on_write(&req, &[0xFF, 0x00]).unwrap();
    }

    #[test]
    fn handler_exception_passes_through() {
        let mut handler = CallbackHandler {
            read_holding_registers: Some(Box::new(|_, _| {
                Err(ExceptionCode::IllegalDataAddress.into())
            })),
            ..Default::default()
        };
        let req = Pdu::from(&[0x03, 0x01, 0x00, 0x00, 0x01][..]);
        assert_eq!(
            handler.on_read(&req),
            Err(HandlerError::Exception(ExceptionCode::IllegalDataAddress))
        );
    }
}
