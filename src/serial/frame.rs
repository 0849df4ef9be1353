use crate::common::crc;
use crate::common::pdu::{self, Pdu};
use crate::constants::limits;
use crate::decode::FrameDecodeLevel;
use crate::error::FrameParseError;
use crate::types::SlaveId;

/// One RTU frame: slave id, PDU, trailing CRC. Fixed storage sized for the
/// relaxed over-size limit.
#[derive(Clone)]
pub(crate) struct Frame {
    adu: [u8; limits::OVER_SIZE_MAX_RTU],
    length: usize,
}

impl Frame {
    pub(crate) fn from_slice(src: &[u8]) -> Frame {
        let mut adu = [0; limits::OVER_SIZE_MAX_RTU];
        let length = src.len().min(adu.len());
        adu[..length].copy_from_slice(&src[..length]);
        Frame { adu, length }
    }

    /// Wrap a PDU in RTU framing: id ‖ pdu ‖ crc-lo ‖ crc-hi.
    pub(crate) fn wrap(slave_id: SlaveId, pdu: &Pdu) -> Frame {
        let mut adu = [0; limits::OVER_SIZE_MAX_RTU];
        adu[0] = slave_id.value;
        let body = 1 + pdu.len();
        adu[1..body].copy_from_slice(pdu.as_bytes());
        let sum = crc::sum(&adu[..body]);
        adu[body..body + 2].copy_from_slice(&sum);
        Frame {
            adu,
            length: body + 2,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.adu[..self.length]
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn slave_id(&self) -> SlaveId {
        SlaveId::new(self.adu.first().copied().unwrap_or(0))
    }

    pub(crate) fn is_broadcast(&self) -> bool {
        self.slave_id().is_broadcast()
    }

    /// Validate the CRC and extract the PDU.
    pub(crate) fn pdu(&self) -> Result<Pdu, FrameParseError> {
        if self.length < limits::SMALLEST_RTU_SIZE {
            return Err(FrameParseError::FrameTooShort(self.length));
        }
        if !crc::validate(self.as_bytes()) {
            return Err(FrameParseError::CrcValidationFailure);
        }
        Ok(Pdu::from(&self.adu[1..self.length - 2]))
    }

    /// The PDU bytes of a frame this endpoint built itself; no CRC check.
    pub(crate) fn pdu_bytes_unchecked(&self) -> &[u8] {
        if self.length < limits::SMALLEST_RTU_SIZE {
            return &[];
        }
        &self.adu[1..self.length - 2]
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "id: {} (len = {})", self.slave_id(), self.length)
    }
}

pub(crate) struct RtuDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a Frame,
}

impl<'a> RtuDisplay<'a> {
    pub(crate) fn new(level: FrameDecodeLevel, frame: &'a Frame) -> Self {
        RtuDisplay { level, frame }
    }
}

impl std::fmt::Display for RtuDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.frame)?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, self.frame.as_bytes())?;
        }
        Ok(())
    }
}

/// The expected size of an RTU frame given a partial prefix of it:
/// the PDU length inferred from the header plus the surrounding slave id and
/// CRC. `is_client` means a client is reading a server-originated frame.
pub fn rtu_size_from_header(header: &[u8], is_client: bool, over_size: bool) -> usize {
    if header.len() < 3 {
        return 3;
    }
    pdu::pdu_size_from_header(&header[1..], is_client, over_size) + 3
}

/// Like [`rtu_size_from_header`] when the frame may have originated from
/// either side of the protocol. Computes both interpretations; when they
/// disagree, the CRC decides: the shorter wins if it validates, otherwise the
/// longer.
pub fn rtu_bidirectional_size(header: &[u8], over_size: bool) -> usize {
    let a = rtu_size_from_header(header, false, over_size);
    let b = rtu_size_from_header(header, true, over_size);
    if a == b {
        return a;
    }
    let (short, long) = if a < b { (a, b) } else { (b, a) };
    if short > header.len() {
        return short;
    }
    if long <= header.len() && crc::validate(&header[..long]) {
        return long;
    }
    if crc::validate(&header[..short]) {
        return short;
    }
    long
}
