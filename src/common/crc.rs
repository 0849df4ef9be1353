//! CRC-16 as used by Modbus RTU: polynomial 0xA001 (reflected 0x8005),
//! initial value 0xFFFF, no final XOR, appended to the frame low byte first.

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// Compute the checksum of `bytes` as `[low, high]`, ready to append.
pub(crate) fn sum(bytes: &[u8]) -> [u8; 2] {
    let value = CRC16.checksum(bytes);
    [value as u8, (value >> 8) as u8]
}

/// true iff `bytes` is long enough to carry a checksum and its trailing two
/// bytes match the CRC of everything before them.
pub(crate) fn validate(bytes: &[u8]) -> bool {
    if bytes.len() < 3 {
        return false;
    }
    let (data, trailer) = bytes.split_at(bytes.len() - 2);
    sum(data) == trailer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_reference_checksums() {
        // request/reply pair from the Modbus reference documentation
        assert_eq!(sum(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), [0x76, 0x87]);
        assert_eq!(
            sum(&[0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40]),
            [0x49, 0xAD]
        );
    }

    #[test]
    fn validates_trailing_checksum() {
        assert!(validate(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]));
        assert!(!validate(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x88]));
    }

    #[test]
    fn rejects_short_input() {
        assert!(!validate(&[]));
        assert!(!validate(&[0x76, 0x87]));
    }
}
