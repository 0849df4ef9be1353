use scursor::ReadCursor;

use crate::common::pdu::Pdu;
use crate::common::phys::PhysReader;
use crate::constants::mbap;
use crate::error::{FrameParseError, RequestError};
use crate::types::SlaveId;

/// One MBAP-framed message: transaction id, unit id, PDU. The protocol id is
/// validated on read and always written as zero.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MbapFrame {
    pub(crate) tx_id: u16,
    pub(crate) unit_id: SlaveId,
    pub(crate) pdu: Pdu,
}

/// Serialize a frame: `tx_id(2) ‖ 0x0000 ‖ length(2) ‖ unit_id(1) ‖ PDU`,
/// all fields network byte order, length covering unit id + PDU.
pub(crate) fn format_mbap(tx_id: u16, unit_id: SlaveId, pdu: &Pdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(mbap::HEADER_LENGTH + pdu.len());
    frame.extend_from_slice(&tx_id.to_be_bytes());
    frame.extend_from_slice(&mbap::PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit_id.value);
    frame.extend_from_slice(pdu.as_bytes());
    frame
}

/// Accumulates stream bytes and yields complete MBAP frames. TCP preserves
/// ordering and loses nothing, so unlike RTU no timing is involved; the
/// declared length alone delimits frames.
pub(crate) struct MbapReader {
    io: PhysReader,
    max_pdu: usize,
    buffer: Vec<u8>,
}

impl MbapReader {
    pub(crate) fn new(io: PhysReader, max_pdu: usize) -> Self {
        Self {
            io,
            max_pdu,
            buffer: Vec::new(),
        }
    }

    async fn fill_to(&mut self, target: usize) -> Result<(), RequestError> {
        let mut chunk = [0u8; 256];
        while self.buffer.len() < target {
            let count = self.io.read(&mut chunk).await?;
            self.buffer.extend_from_slice(&chunk[..count]);
        }
        Ok(())
    }

    pub(crate) async fn read_frame(&mut self) -> Result<MbapFrame, RequestError> {
        self.fill_to(mbap::HEADER_LENGTH - 1).await?;

        let (tx_id, length) = {
            let mut cursor = ReadCursor::new(&self.buffer[..mbap::HEADER_LENGTH - 1]);
            let tx_id = cursor.read_u16_be()?;
            let protocol_id = cursor.read_u16_be()?;
            if protocol_id != mbap::PROTOCOL_ID {
                return Err(FrameParseError::UnknownProtocolId(protocol_id).into());
            }
            (tx_id, cursor.read_u16_be()? as usize)
        };
        if length < 3 {
            // at minimum: unit id plus a two byte PDU
            return Err(FrameParseError::MbapLengthTooSmall(length).into());
        }
        if length > self.max_pdu + 1 {
            return Err(FrameParseError::MbapLengthTooBig(length, self.max_pdu + 1).into());
        }

        let total = mbap::HEADER_LENGTH - 1 + length;
        self.fill_to(total).await?;

        let unit_id = SlaveId::new(self.buffer[mbap::UNIT_ID_OFFSET]);
        let pdu = Pdu::from(&self.buffer[mbap::HEADER_LENGTH..total]);
        self.buffer.drain(..total);
        Ok(MbapFrame {
            tx_id,
            unit_id,
            pdu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::phys;
    use crate::constants::limits;
    use crate::decode::PhysDecodeLevel;
    use tokio::io::AsyncWriteExt;

    fn reader(io: tokio::io::DuplexStream) -> MbapReader {
        let (rx, _tx) = phys::split(io, PhysDecodeLevel::Nothing);
        MbapReader::new(rx, limits::MAX_PDU_SIZE)
    }

    #[test]
    fn formats_the_reference_frame() {
        let pdu = Pdu::from(&[0x03, 0x00, 0x6B, 0x00, 0x03][..]);
        let frame = format_mbap(0x0007, SlaveId::new(0x11), &pdu);
        assert_eq!(
            frame,
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[tokio::test]
    async fn round_trips_through_a_stream() {
        let (local, mut remote) = tokio::io::duplex(256);
        let mut reader = reader(local);

        let pdu = Pdu::from(&[0x03, 0x00, 0x6B, 0x00, 0x03][..]);
        let bytes = format_mbap(0xCAFE, SlaveId::new(0x11), &pdu);
        // fragment the write to exercise reassembly
        let (a, b) = bytes.split_at(5);
        remote.write_all(a).await.unwrap();
        remote.write_all(b).await.unwrap();

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.tx_id, 0xCAFE);
        assert_eq!(frame.unit_id, SlaveId::new(0x11));
        assert_eq!(frame.pdu, pdu);
    }

    #[tokio::test]
    async fn rejects_unknown_protocol_id() {
        let (local, mut remote) = tokio::io::duplex(256);
        let mut reader = reader(local);
        remote
            .write_all(&[0x00, 0x07, 0xCA, 0xFE, 0x00, 0x01, 0x2A])
            .await
            .unwrap();
        assert_eq!(
            reader.read_frame().await,
            Err(RequestError::BadFrame(FrameParseError::UnknownProtocolId(
                0xCAFE
            )))
        );
    }

    #[tokio::test]
    async fn rejects_degenerate_lengths() {
        let (local, mut remote) = tokio::io::duplex(256);
        let mut reader = reader(local);
        remote
            .write_all(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x2A])
            .await
            .unwrap();
        assert_eq!(
            reader.read_frame().await,
            Err(RequestError::BadFrame(FrameParseError::MbapLengthTooSmall(
                0
            )))
        );
    }
}
