//! Conversions between wire payloads and typed values. Booleans pack eight to
//! a byte, least significant bit first; registers are big-endian words.

use crate::common::function::FunctionCode;
use crate::exception::ExceptionCode;

/// Pack booleans into a write/reply payload for the given function code.
///
/// Write-single-coil uses the two-byte `FF 00` / `00 00` encoding and accepts
/// exactly one value.
pub fn bools_to_data(values: &[bool], fc: FunctionCode) -> Result<Vec<u8>, ExceptionCode> {
    if fc == FunctionCode::WriteSingleCoil {
        match values {
            [value] => {
                return Ok(vec![if *value { 0xFF } else { 0x00 }, 0x00]);
            }
            _ => return Err(ExceptionCode::IllegalDataValue),
        }
    }
    let mut data = vec![0u8; (values.len() + 7) / 8];
    for (i, value) in values.iter().enumerate() {
        if *value {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    Ok(data)
}

/// Unpack `count` booleans from a payload for the given function code.
pub fn data_to_bools(data: &[u8], count: u16, fc: FunctionCode) -> Result<Vec<bool>, ExceptionCode> {
    if fc == FunctionCode::WriteSingleCoil {
        return match data {
            [0x00, 0x00] => Ok(vec![false]),
            [0xFF, 0x00] => Ok(vec![true]),
            _ => Err(ExceptionCode::IllegalDataValue),
        };
    }
    if (count as usize + 7) / 8 != data.len() {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let mut values = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        values.push(data[i / 8] & (1 << (i % 8)) != 0);
    }
    Ok(values)
}

/// Pack registers into a big-endian payload.
pub fn registers_to_data(values: &[u16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 2);
    for value in values {
        data.push((value >> 8) as u8);
        data.push(*value as u8);
    }
    data
}

/// Unpack big-endian registers from a payload.
pub fn data_to_registers(data: &[u8]) -> Result<Vec<u16>, ExceptionCode> {
    if data.len() % 2 != 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| (pair[0] as u16) << 8 | pair[1] as u16)
        .collect())
}
