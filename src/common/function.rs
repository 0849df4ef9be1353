use std::fmt::{Display, Formatter};

use crate::common::pdu::Pdu;
use crate::constants::limits;
use crate::error::InvalidRequest;

mod constants {
    pub(crate) const READ_COILS: u8 = 1;
    pub(crate) const READ_DISCRETE_INPUTS: u8 = 2;
    pub(crate) const READ_HOLDING_REGISTERS: u8 = 3;
    pub(crate) const READ_INPUT_REGISTERS: u8 = 4;
    pub(crate) const WRITE_SINGLE_COIL: u8 = 5;
    pub(crate) const WRITE_SINGLE_REGISTER: u8 = 6;
    pub(crate) const WRITE_MULTIPLE_COILS: u8 = 15;
    pub(crate) const WRITE_MULTIPLE_REGISTERS: u8 = 16;
}

/// The function codes supported by this crate
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = constants::READ_COILS,
    ReadDiscreteInputs = constants::READ_DISCRETE_INPUTS,
    ReadHoldingRegisters = constants::READ_HOLDING_REGISTERS,
    ReadInputRegisters = constants::READ_INPUT_REGISTERS,
    WriteSingleCoil = constants::WRITE_SINGLE_COIL,
    WriteSingleRegister = constants::WRITE_SINGLE_REGISTER,
    WriteMultipleCoils = constants::WRITE_MULTIPLE_COILS,
    WriteMultipleRegisters = constants::WRITE_MULTIPLE_REGISTERS,
}

impl FunctionCode {
    /// Interpret a raw byte as a supported function code. Returns `None` for
    /// unsupported codes and for exception replies (high bit set).
    pub fn get(value: u8) -> Option<Self> {
        match value {
            constants::READ_COILS => Some(FunctionCode::ReadCoils),
            constants::READ_DISCRETE_INPUTS => Some(FunctionCode::ReadDiscreteInputs),
            constants::READ_HOLDING_REGISTERS => Some(FunctionCode::ReadHoldingRegisters),
            constants::READ_INPUT_REGISTERS => Some(FunctionCode::ReadInputRegisters),
            constants::WRITE_SINGLE_COIL => Some(FunctionCode::WriteSingleCoil),
            constants::WRITE_SINGLE_REGISTER => Some(FunctionCode::WriteSingleRegister),
            constants::WRITE_MULTIPLE_COILS => Some(FunctionCode::WriteMultipleCoils),
            constants::WRITE_MULTIPLE_REGISTERS => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// the raw wire value
    pub const fn get_value(self) -> u8 {
        self as u8
    }

    /// the raw wire value with the exception flag set
    pub const fn as_error(self) -> u8 {
        self.get_value() | 0x80
    }

    /// Split a raw function byte into its exception flag and base code
    pub const fn separate_error(value: u8) -> (bool, u8) {
        (value > 0x7F, value & 0x7F)
    }

    /// true if this function writes values to the server (5, 6, 15, 16)
    pub const fn is_write_to_server(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }

    /// true if this function reads values from the server (1, 2, 3, 4)
    pub const fn is_read_to_server(self) -> bool {
        !self.is_write_to_server()
    }

    /// true if this function carries exactly one value (5, 6)
    pub const fn is_single(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister
        )
    }

    /// true if this function concerns boolean values (1, 2, 5, 15)
    pub const fn is_bool(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }

    /// true if this function concerns 16-bit values (3, 4, 6, 16)
    pub const fn is_uint16(self) -> bool {
        !self.is_bool()
    }

    /// the maximum number of values one packet of this function can carry
    pub const fn max_per_packet(self) -> u16 {
        match self {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                limits::MAX_READ_BITS_COUNT
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                limits::MAX_READ_REGISTERS_COUNT
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 1,
            FunctionCode::WriteMultipleCoils => limits::MAX_WRITE_BITS_COUNT,
            FunctionCode::WriteMultipleRegisters => limits::MAX_WRITE_REGISTERS_COUNT,
        }
    }

    /// The maximum number of values per packet when the PDU is further limited
    /// to `size` bytes. At least 1 (8 for bools) is returned when `size` is
    /// too small for a full packet.
    pub fn max_per_packet_sized(self, size: u8) -> u16 {
        let s = (size as usize).min(limits::MAX_PDU_SIZE) as u16;
        match self {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if s < 4 {
                    return 8;
                }
                // at maximum size one byte goes unused
                let s = if s as usize == limits::MAX_PDU_SIZE {
                    s - 1
                } else {
                    s
                };
                (s - 2) * 8
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if s < 6 {
                    return 1;
                }
                (s - 2) / 2
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 1,
            FunctionCode::WriteMultipleCoils => {
                if s < 8 {
                    return 8;
                }
                let s = if s as usize == limits::MAX_PDU_SIZE {
                    s - 1
                } else {
                    s
                };
                (s - 6) * 8
            }
            FunctionCode::WriteMultipleRegisters => {
                if s < 10 {
                    return 1;
                }
                (s - 6) / 2
            }
        }
    }

    /// Build a request PDU without any data, to be used to start a client
    /// transaction. The inverse accessors are [`Pdu::function_code`],
    /// [`Pdu::address`] and [`Pdu::request_count`].
    pub fn make_request_header(self, address: u16, quantity: u16) -> Result<Pdu, InvalidRequest> {
        if quantity > self.max_per_packet() {
            return Err(InvalidRequest::CountTooBigForType(
                quantity,
                self.max_per_packet(),
            ));
        }
        if address as u32 + quantity as u32 > limits::ADDRESS_SPACE {
            return Err(InvalidRequest::AddressOverflow(address, quantity));
        }
        let mut header = vec![self.get_value(), (address >> 8) as u8, address as u8];
        if self.is_single() {
            return Ok(Pdu::from(header));
        }
        header.push((quantity >> 8) as u8);
        header.push(quantity as u8);
        match self {
            FunctionCode::WriteMultipleCoils => header.push(((quantity + 7) / 8) as u8),
            FunctionCode::WriteMultipleRegisters => header.push((quantity * 2) as u8),
            _ => {}
        }
        Ok(Pdu::from(header))
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FunctionCode::ReadCoils => write!(f, "READ COILS ({:#04X})", self.get_value()),
            FunctionCode::ReadDiscreteInputs => {
                write!(f, "READ DISCRETE INPUTS ({:#04X})", self.get_value())
            }
            FunctionCode::ReadHoldingRegisters => {
                write!(f, "READ HOLDING REGISTERS ({:#04X})", self.get_value())
            }
            FunctionCode::ReadInputRegisters => {
                write!(f, "READ INPUT REGISTERS ({:#04X})", self.get_value())
            }
            FunctionCode::WriteSingleCoil => {
                write!(f, "WRITE SINGLE COIL ({:#04X})", self.get_value())
            }
            FunctionCode::WriteSingleRegister => {
                write!(f, "WRITE SINGLE REGISTER ({:#04X})", self.get_value())
            }
            FunctionCode::WriteMultipleCoils => {
                write!(f, "WRITE MULTIPLE COILS ({:#04X})", self.get_value())
            }
            FunctionCode::WriteMultipleRegisters => {
                write!(f, "WRITE MULTIPLE REGISTERS ({:#04X})", self.get_value())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_codes() {
        for value in [1u8, 2, 3, 4, 5, 6, 15, 16] {
            let fc = FunctionCode::get(value).unwrap();
            assert_eq!(fc.get_value(), value);
            assert_ne!(fc.is_write_to_server(), fc.is_read_to_server());
            assert_ne!(fc.is_bool(), fc.is_uint16());
        }
        for value in [0u8, 7, 14, 17, 0x81, 0x83] {
            assert!(FunctionCode::get(value).is_none());
        }
    }

    #[test]
    fn separates_exception_flag() {
        assert_eq!(FunctionCode::separate_error(0x83), (true, 0x03));
        assert_eq!(FunctionCode::separate_error(0x03), (false, 0x03));
    }

    #[test]
    fn builds_request_headers() {
        let header = FunctionCode::ReadHoldingRegisters
            .make_request_header(0x006B, 3)
            .unwrap();
        assert_eq!(header.as_bytes(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);

        let header = FunctionCode::WriteSingleCoil
            .make_request_header(0x00AC, 1)
            .unwrap();
        assert_eq!(header.as_bytes(), &[0x05, 0x00, 0xAC]);

        let header = FunctionCode::WriteMultipleRegisters
            .make_request_header(0x0001, 2)
            .unwrap();
        assert_eq!(header.as_bytes(), &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04]);
    }

    #[test]
    fn rejects_out_of_range_headers() {
        assert_eq!(
            FunctionCode::ReadHoldingRegisters.make_request_header(0xFFFF, 2),
            Err(InvalidRequest::AddressOverflow(0xFFFF, 2))
        );
        assert_eq!(
            FunctionCode::ReadHoldingRegisters.make_request_header(0, 126),
            Err(InvalidRequest::CountTooBigForType(126, 125))
        );
    }

    #[test]
    fn covers_full_address_space() {
        // address + count == 0x10000 is the last permitted range
        assert!(FunctionCode::ReadCoils
            .make_request_header(0xFFFF, 1)
            .is_ok());
    }

    #[test]
    fn sized_packet_limits() {
        assert_eq!(
            FunctionCode::ReadHoldingRegisters.max_per_packet_sized(255),
            125
        );
        assert_eq!(FunctionCode::ReadHoldingRegisters.max_per_packet_sized(6), 2);
        assert_eq!(FunctionCode::ReadHoldingRegisters.max_per_packet_sized(5), 1);
        assert_eq!(FunctionCode::ReadCoils.max_per_packet_sized(3), 8);
        assert_eq!(FunctionCode::WriteSingleCoil.max_per_packet_sized(2), 1);
    }
}
