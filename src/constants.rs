/// u16 coil representations used by write-single-coil
pub mod coil {
    /// wire representation of an energized coil
    pub const ON: u16 = 0xFF00;
    /// wire representation of a de-energized coil
    pub const OFF: u16 = 0x0000;
}

/// Protocol size limits
pub mod limits {
    /// Maximum size of a PDU (function code + body)
    pub const MAX_PDU_SIZE: usize = 253;
    /// Maximum size of an RTU frame: slave id + PDU + CRC
    pub const MAX_RTU_SIZE: usize = 256;
    /// Upper bound on the relaxed RTU frame size when over-size support is enabled
    pub const OVER_SIZE_MAX_RTU: usize = 512;
    /// Smallest complete RTU frame: id + fc + exception code + CRC
    pub const SMALLEST_RTU_SIZE: usize = 4;
    /// One past the largest Modbus address; start + count must not exceed it
    pub const ADDRESS_SPACE: u32 = 0x1_0000;
    /// Largest unicast slave id; 0 is reserved for broadcast
    pub const MAX_SLAVE_ID: u8 = 247;

    /// Maximum count in a read coils / read discrete inputs request
    pub const MAX_READ_BITS_COUNT: u16 = 2000;
    /// Maximum count in a read holding / input registers request
    pub const MAX_READ_REGISTERS_COUNT: u16 = 0x007D;
    /// Maximum count in a write multiple coils request
    pub const MAX_WRITE_BITS_COUNT: u16 = 0x07B0;
    /// Maximum count in a write multiple registers request
    pub const MAX_WRITE_REGISTERS_COUNT: u16 = 0x007B;
}

/// MBAP (Modbus/TCP) framing constants
pub mod mbap {
    /// transaction id + protocol id + length + unit id
    pub const HEADER_LENGTH: usize = 7;
    /// offset of the unit id within the header
    pub const UNIT_ID_OFFSET: usize = 6;
    /// the only protocol id defined by the specification
    pub const PROTOCOL_ID: u16 = 0x0000;
}

pub(crate) mod exceptions {
    pub const OK: u8 = 0x00;
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    pub const SERVER_DEVICE_FAILURE: u8 = 0x04;
    pub const ACKNOWLEDGE: u8 = 0x05;
    pub const SERVER_DEVICE_BUSY: u8 = 0x06;
    pub const MEMORY_PARITY_ERROR: u8 = 0x08;
    pub const GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
    pub const GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND: u8 = 0x0B;
    pub const INTERNAL: u8 = 0xFF;
}
